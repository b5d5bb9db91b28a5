//! # relaychat relay
//!
//! Circuit relaying for peers that cannot reach each other directly.
//!
//! This crate provides:
//! - Relay address resolution
//! - The relay service: reservations, circuits, quota-limited forwarding
//! - The listener-side reservation client
//! - The dialer-side circuit dialer
//!
//! ## Flow
//!
//! ```text
//!  listener (A)               relay (R)                dialer (B)
//!      | --- Reserve ---------->  |                        |
//!      | <-- ReserveOk ---------  |                        |
//!      |                          | <----- Connect{A} ---- |
//!      | <-- IncomingCircuit ---  |                        |
//!      | --- Accept ----------->  |                        |
//!      | <-- Accepted ----------  | ------ Connected ----> |
//!      | <======== handshake + /chat/1.0.0 ==============> |
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit;
pub mod dialer;
pub mod limits;
pub mod poll;
pub mod protocol;
pub mod reservation;
pub mod resolver;
pub mod service;
pub mod splice;
pub mod state;

#[cfg(test)]
mod test_support;

pub use dialer::{CircuitDialer, parse_destination};
pub use limits::{AdmissionPolicy, RelayLimits};
pub use poll::{AddressBook, AddressWait, PollPolicy, wait_for_circuit_addr};
pub use protocol::{CircuitFrame, CircuitId, CloseReason, HopMessage, RELAY_PROTOCOL};
pub use reservation::{ActiveReservation, ReservationClient};
pub use resolver::{DEFAULT_RELAY_PORT, RelayDescriptor, resolve, resolve_with_port};
pub use service::{CIRCUIT_ACCEPT_TIMEOUT, CircuitHandle, RelayService};
pub use state::{Circuit, CircuitStatus, Quota, Reservation};
