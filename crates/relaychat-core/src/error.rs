//! Error types shared by every relaychat crate
//!
//! Errors are grouped by the phase in which they occur:
//!
//! - **Startup**: bad addresses or configuration. Fatal, the process reports
//!   them and exits.
//! - **Establishment**: reaching the relay, reserving a slot, opening a
//!   circuit, negotiating a stream. Fatal to the attempt; a caller wanting
//!   resilience re-runs the whole establishment sequence.
//! - **Session**: read/write failures on an open stream. Local to the chat
//!   session that owns the stream.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a relay refused a reservation or a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// The relay has no free reservation or circuit slot
    AtCapacity,
    /// The relay's admission policy does not allow this peer
    NotAdmitted,
    /// The destination holds no live reservation on the relay
    NoSuchReservation,
    /// The destination did not pick up the circuit in time
    ConnectFailed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::AtCapacity => write!(f, "relay at capacity"),
            RejectReason::NotAdmitted => write!(f, "peer not admitted by relay"),
            RejectReason::NoSuchReservation => write!(f, "no reservation for destination"),
            RejectReason::ConnectFailed => write!(f, "destination did not accept the circuit"),
        }
    }
}

/// Errors that can occur anywhere in relaychat
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // ============ Startup Errors ============
    /// Malformed network address or peer identifier
    #[error("Invalid address: {0}")]
    InvalidAddress(Cow<'static, str>),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Establishment Errors ============
    /// The relay refused the reservation request
    #[error("Reservation denied: {0}")]
    ReservationDenied(RejectReason),

    /// The relay route never showed up in the local address set
    #[error("Timed out waiting for a relay address")]
    ReservationAddressTimeout,

    /// Transport-level failure while connecting to the relay
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(Cow<'static, str>),

    /// Destination address is not a usable relayed address
    #[error("Invalid destination: {0}")]
    InvalidDestination(Cow<'static, str>),

    /// The relay refused to open the circuit
    #[error("Circuit rejected: {0}")]
    CircuitRejected(RejectReason),

    /// Handshake or protocol negotiation over an open circuit failed
    #[error("Stream open failed: {0}")]
    StreamOpenFailed(Cow<'static, str>),

    /// The remote host does not serve the requested protocol
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Peer authentication failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    // ============ Session Errors ============
    /// The relay closed the circuit after its data quota ran out
    #[error("Relay data quota exceeded")]
    QuotaExceeded,

    /// The relay closed the circuit because the reservation ended
    #[error("Relay reservation expired")]
    ReservationExpired,

    /// Operation on a stream that is already closed
    #[error("Stream closed")]
    ClosedStream,

    // ============ Plumbing Errors ============
    /// Unexpected message or malformed frame
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Message encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Socket or pipe I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl Error {
    /// Returns true for errors that are fatal at startup
    ///
    /// These come from operator input and will not go away on retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_) | Error::InvalidConfig(_) | Error::InvalidDestination(_)
        )
    }

    /// Returns true if re-running the establishment sequence may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RelayUnreachable(_)
                | Error::ReservationAddressTimeout
                | Error::Timeout(_)
                | Error::Io(_)
                | Error::CircuitRejected(RejectReason::AtCapacity | RejectReason::ConnectFailed)
                | Error::ReservationDenied(RejectReason::AtCapacity)
        )
    }

    /// Returns true if this error ends a chat session rather than an attempt
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            Error::ClosedStream | Error::QuotaExceeded | Error::ReservationExpired | Error::Io(_)
        )
    }

    /// Create an invalid address error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_address(context: &'static str) -> Self {
        Error::InvalidAddress(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        Error::Protocol(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        Error::Handshake(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Error::Timeout(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(Cow::Owned(err.to_string()))
    }
}

/// Result type for relaychat operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(Error::invalid_address("bad ip").is_fatal());
        assert!(Error::InvalidDestination(Cow::Borrowed("x")).is_fatal());
        assert!(!Error::ClosedStream.is_fatal());
        assert!(!Error::RelayUnreachable(Cow::Borrowed("refused")).is_fatal());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::RelayUnreachable(Cow::Borrowed("refused")).is_transient());
        assert!(Error::ReservationAddressTimeout.is_transient());
        assert!(Error::CircuitRejected(RejectReason::AtCapacity).is_transient());
        assert!(!Error::CircuitRejected(RejectReason::NoSuchReservation).is_transient());
        assert!(!Error::ReservationDenied(RejectReason::NotAdmitted).is_transient());
    }

    #[test]
    fn test_session_errors() {
        assert!(Error::ClosedStream.ends_session());
        assert!(Error::QuotaExceeded.ends_session());
        assert!(!Error::CircuitRejected(RejectReason::AtCapacity).ends_session());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::CircuitRejected(RejectReason::AtCapacity).to_string(),
            "Circuit rejected: relay at capacity"
        );
        assert_eq!(Error::ClosedStream.to_string(), "Stream closed");
        assert_eq!(
            Error::ReservationDenied(RejectReason::NotAdmitted).to_string(),
            "Reservation denied: peer not admitted by relay"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("pipe gone")));
    }
}
