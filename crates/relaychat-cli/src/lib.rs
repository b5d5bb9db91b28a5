//! # relaychat cli
//!
//! Shared pieces of the `relaychat` and `relaychat-relay` binaries.
//!
//! This crate provides:
//! - TOML configuration with command-line overrides
//! - Log subscriber setup
//! - Persistent identity key files
//! - The connect command a listener prints for its dialers
//! - Stdin shared across chat sessions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod keyfile;
pub mod logging;
pub mod stdin;

use relaychat_core::Multiaddr;
use relaychat_relay::DEFAULT_RELAY_PORT;

/// The command a dialer runs to reach a listener at `addr`
///
/// `--relay-port` is only spelled out when it differs from the default.
#[must_use]
pub fn connect_command(
    program: &str,
    addr: &Multiaddr,
    relay_ip: &str,
    relay_peer_id: &str,
    relay_port: u16,
) -> String {
    let mut command =
        format!("{program} -d '{addr}' --relay-ip {relay_ip} --relay-peerid {relay_peer_id}");
    if relay_port != DEFAULT_RELAY_PORT {
        command.push_str(&format!(" --relay-port {relay_port}"));
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaychat_core::{Identity, Protocol};
    use relaychat_relay::resolve;

    #[test]
    fn test_connect_command() {
        let relay_id = Identity::generate().peer_id().to_string();
        let me = Identity::generate().peer_id();
        let relay = resolve("10.0.0.1", &relay_id).unwrap();
        let addr = relay.circuit_addr().with(Protocol::P2p(me));

        let command = connect_command("relaychat", &addr, "10.0.0.1", &relay_id, 4001);
        assert_eq!(
            command,
            format!(
                "relaychat -d '/ip4/10.0.0.1/tcp/4001/p2p/{relay_id}/p2p-circuit/p2p/{me}' \
                 --relay-ip 10.0.0.1 --relay-peerid {relay_id}"
            )
        );

        let command = connect_command("relaychat", &addr, "10.0.0.1", &relay_id, 4101);
        assert!(command.ends_with(" --relay-port 4101"));
    }
}
