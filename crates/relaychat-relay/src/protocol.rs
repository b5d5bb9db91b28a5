//! Relay protocol message definitions.

use serde::{Deserialize, Serialize};

use relaychat_core::{Error, Multiaddr, PeerId, RejectReason};

/// Protocol identifier for relay control and circuit streams
pub const RELAY_PROTOCOL: &str = "/relaychat/circuit/relay/1.0.0";

/// Relay-assigned circuit identifier
pub type CircuitId = u64;

/// Relay control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopMessage {
    /// Listener asks for a reservation
    Reserve,

    /// Relay grants the reservation
    ReserveOk {
        /// Relay addresses the reservation is reachable through, each ending
        /// in `/p2p-circuit`
        addrs: Vec<Multiaddr>,
        /// Reservation lifetime in milliseconds
        ttl_millis: u64,
        /// Bytes the reservation may carry across all its circuits
        data_limit: u64,
    },

    /// Dialer asks for a circuit to `dst`
    Connect {
        /// Destination peer
        dst: PeerId,
    },

    /// Circuit is spliced; raw circuit frames follow
    Connected,

    /// Relay tells a reservation holder that `src` wants a circuit
    IncomingCircuit {
        /// Circuit to accept
        circuit_id: CircuitId,
        /// Dialing peer
        src: PeerId,
    },

    /// Destination picks up an incoming circuit on a fresh connection
    Accept {
        /// Circuit being accepted
        circuit_id: CircuitId,
    },

    /// Accepted circuit is spliced; raw circuit frames follow
    Accepted,

    /// Relay refused the request
    Rejected {
        /// Why
        reason: RejectReason,
    },

    /// Relay ended the reservation
    ReservationExpired,

    /// Holder gives up its reservation
    Release,
}

impl HopMessage {
    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            HopMessage::Reserve => "Reserve",
            HopMessage::ReserveOk { .. } => "ReserveOk",
            HopMessage::Connect { .. } => "Connect",
            HopMessage::Connected => "Connected",
            HopMessage::IncomingCircuit { .. } => "IncomingCircuit",
            HopMessage::Accept { .. } => "Accept",
            HopMessage::Accepted => "Accepted",
            HopMessage::Rejected { .. } => "Rejected",
            HopMessage::ReservationExpired => "ReservationExpired",
            HopMessage::Release => "Release",
        }
    }
}

/// Frames carried by a spliced circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitFrame {
    /// Opaque payload bytes
    Data(Vec<u8>),
    /// End of circuit
    Close(CloseReason),
}

/// Why a circuit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// An endpoint closed its side
    Normal,
    /// The destination reservation ran out of data
    QuotaExceeded,
    /// The destination reservation ended
    ReservationExpired,
}

impl CloseReason {
    /// Session error an endpoint should report, `None` for a normal close
    #[must_use]
    pub fn into_error(self) -> Option<Error> {
        match self {
            CloseReason::Normal => None,
            CloseReason::QuotaExceeded => Some(Error::QuotaExceeded),
            CloseReason::ReservationExpired => Some(Error::ReservationExpired),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaychat_core::codec::{decode, encode};

    #[test]
    fn test_message_type_names() {
        assert_eq!(HopMessage::Reserve.message_type(), "Reserve");
        assert_eq!(
            HopMessage::Rejected {
                reason: RejectReason::AtCapacity
            }
            .message_type(),
            "Rejected"
        );
    }

    #[test]
    fn test_hop_message_encoding() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001/p2p-circuit".parse().unwrap();
        let msg = HopMessage::ReserveOk {
            addrs: vec![addr],
            ttl_millis: 3_600_000,
            data_limit: 1 << 20,
        };
        let decoded: HopMessage = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_close_reason_errors() {
        assert_eq!(CloseReason::Normal.into_error(), None);
        assert_eq!(CloseReason::QuotaExceeded.into_error(), Some(Error::QuotaExceeded));
        assert_eq!(
            CloseReason::ReservationExpired.into_error(),
            Some(Error::ReservationExpired)
        );
    }
}
