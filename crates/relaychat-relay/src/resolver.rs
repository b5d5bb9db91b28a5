//! Relay address resolution
//!
//! Turns the `--relay-ip` / `--relay-peerid` pair an operator types into the
//! full relay address both the listener and the dialer connect to.

use std::fmt;
use std::net::IpAddr;

use relaychat_core::{Error, Multiaddr, PeerId, Protocol, Result};

/// Well-known TCP port relays listen on
pub const DEFAULT_RELAY_PORT: u16 = 4001;

/// Where a relay lives and who it is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDescriptor {
    address: Multiaddr,
    peer_id: PeerId,
}

impl RelayDescriptor {
    /// Full relay address, ending in `/p2p/<relay id>`
    #[must_use]
    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    /// Relay peer identifier
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// `<relay address>/p2p-circuit`, the prefix of every address routed
    /// through this relay
    #[must_use]
    pub fn circuit_addr(&self) -> Multiaddr {
        self.address.clone().with(Protocol::P2pCircuit)
    }
}

impl fmt::Display for RelayDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Build the relay descriptor for `ip` on [`DEFAULT_RELAY_PORT`]
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if `ip` is not an IPv4 or IPv6 literal
/// or `peer_id` is not a 64-character hex peer identifier.
pub fn resolve(ip: &str, peer_id: &str) -> Result<RelayDescriptor> {
    resolve_with_port(ip, peer_id, DEFAULT_RELAY_PORT)
}

/// Build the relay descriptor for `ip` on an explicit port
///
/// # Errors
///
/// See [`resolve`].
pub fn resolve_with_port(ip: &str, peer_id: &str, port: u16) -> Result<RelayDescriptor> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("'{ip}' is not an IP address").into()))?;
    let peer_id: PeerId = peer_id.parse()?;

    let host = match ip {
        IpAddr::V4(v4) => Protocol::Ip4(v4),
        IpAddr::V6(v6) => Protocol::Ip6(v6),
    };
    let address = Multiaddr::from(vec![host, Protocol::Tcp(port), Protocol::P2p(peer_id)]);

    Ok(RelayDescriptor { address, peer_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const ID: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_resolve_ipv4() {
        let relay = resolve("203.0.113.7", ID).unwrap();
        assert_eq!(relay.to_string(), format!("/ip4/203.0.113.7/tcp/4001/p2p/{ID}"));
        assert_eq!(relay.peer_id().to_string(), ID);
        assert_eq!(
            relay.circuit_addr().to_string(),
            format!("/ip4/203.0.113.7/tcp/4001/p2p/{ID}/p2p-circuit")
        );
    }

    #[test]
    fn test_resolve_ipv6_and_port() {
        let relay = resolve_with_port("::1", ID, 9000).unwrap();
        assert_eq!(relay.to_string(), format!("/ip6/::1/tcp/9000/p2p/{ID}"));
    }

    #[test]
    fn test_resolve_rejects_bad_input() {
        assert!(matches!(resolve("not-an-ip", ID), Err(Error::InvalidAddress(_))));
        assert!(matches!(resolve("example.com", ID), Err(Error::InvalidAddress(_))));
        assert!(matches!(resolve("10.0.0.1", "xyz"), Err(Error::InvalidAddress(_))));
        assert!(matches!(resolve("10.0.0.1", &ID[..62]), Err(Error::InvalidAddress(_))));
    }

    proptest! {
        #[test]
        fn resolve_ipv4_roundtrip(ip in any::<[u8; 4]>(), id in any::<[u8; 32]>()) {
            let ip = Ipv4Addr::from(ip).to_string();
            let id = hex::encode(id);
            let relay = resolve(&ip, &id).unwrap();
            prop_assert_eq!(relay.to_string(), format!("/ip4/{ip}/tcp/4001/p2p/{id}"));

            let reparsed: Multiaddr = relay.to_string().parse().unwrap();
            prop_assert_eq!(&reparsed, relay.address());
        }

        #[test]
        fn resolve_ipv6_roundtrip(ip in any::<[u8; 16]>(), id in any::<[u8; 32]>()) {
            let ip = Ipv6Addr::from(ip).to_string();
            let id = hex::encode(id);
            let relay = resolve(&ip, &id).unwrap();
            prop_assert_eq!(relay.to_string(), format!("/ip6/{ip}/tcp/4001/p2p/{id}"));
        }
    }
}
