//! Dialer side: reaching a peer through its relay

use relaychat_core::{Error, Host, Multiaddr, PeerId, Result, Stream};
use tracing::{debug, info};

use crate::circuit::bridge;
use crate::protocol::{HopMessage, RELAY_PROTOCOL};
use crate::resolver::RelayDescriptor;

/// Opens streams to peers that are only reachable through a relay
#[derive(Debug, Clone)]
pub struct CircuitDialer {
    host: Host,
}

impl CircuitDialer {
    /// Dialer for `host`
    #[must_use]
    pub fn new(host: Host) -> Self {
        Self { host }
    }

    /// Open a `protocol` stream to `destination` through `relay`
    ///
    /// `destination` must be `<relay address>/p2p-circuit/p2p/<peer id>` for
    /// this relay.
    ///
    /// # Errors
    ///
    /// - [`Error::RelayUnreachable`] if the relay cannot be reached
    /// - [`Error::InvalidDestination`] if `destination` is malformed or routes
    ///   through a different relay
    /// - [`Error::CircuitRejected`] if the relay refuses the circuit
    /// - [`Error::StreamOpenFailed`] if the handshake or protocol negotiation
    ///   with the destination fails
    pub async fn dial(
        &self,
        relay: &RelayDescriptor,
        destination: &str,
        protocol: &str,
    ) -> Result<Stream> {
        let mut conn = self
            .host
            .open_stream(relay.address(), RELAY_PROTOCOL)
            .await
            .map_err(|e| Error::RelayUnreachable(e.to_string().into()))?;
        info!(relay = %relay, "connected to relay");

        let dst = parse_destination(relay, destination)?;

        conn.send(&HopMessage::Connect { dst })
            .await
            .map_err(|e| Error::RelayUnreachable(e.to_string().into()))?;

        match conn.recv::<HopMessage>().await {
            Ok(HopMessage::Connected) => {}
            Ok(HopMessage::Rejected { reason }) => return Err(Error::CircuitRejected(reason)),
            Ok(other) => {
                return Err(Error::Protocol(
                    format!("unexpected {} in reply to Connect", other.message_type()).into(),
                ));
            }
            Err(e) => return Err(Error::RelayUnreachable(e.to_string().into())),
        }
        debug!(dst = %dst.short(), "circuit connected");

        let (io, fault) = bridge(conn);
        let conn = self
            .host
            .upgrade_outbound(io, Some(dst), protocol, fault)
            .await
            .map_err(|e| Error::StreamOpenFailed(e.to_string().into()))?;

        info!(dst = %dst.short(), protocol, "relayed stream open");
        Ok(Stream::new(conn))
    }
}

/// Extract the destination peer from a relayed address
///
/// # Errors
///
/// Returns [`Error::InvalidDestination`] unless `destination` parses as
/// `<relay>/p2p-circuit/p2p/<peer>` and its relay part names `relay`'s peer.
pub fn parse_destination(relay: &RelayDescriptor, destination: &str) -> Result<PeerId> {
    let addr: Multiaddr = destination
        .trim()
        .parse()
        .map_err(|e: Error| Error::InvalidDestination(e.to_string().into()))?;

    let (relay_part, dst) = addr.split_circuit().ok_or(Error::InvalidDestination(
        "expected <relay>/p2p-circuit/p2p/<peer id>".into(),
    ))?;

    if relay_part.peer_id() != Some(relay.peer_id()) {
        return Err(Error::InvalidDestination(
            "destination routes through a different relay".into(),
        ));
    }
    Ok(dst)
}
