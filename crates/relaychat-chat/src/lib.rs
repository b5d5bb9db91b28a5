//! # relaychat chat
//!
//! Line-oriented chat over a single stream.
//!
//! This crate provides:
//! - [`ChatSession`]: concurrent send and receive loops over one [`relaychat_core::Stream`]
//! - [`StreamHandler`]: the inbound handler for the `/chat/1.0.0` protocol
//!
//! ```text
//!  local input ──► outbound loop ──► stream ──► remote peer
//!  local output ◄── inbound loop ◄── stream ◄── remote peer
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handler;
pub mod session;

pub use handler::{CHAT_PROTOCOL, StreamHandler};
pub use session::{ChatSession, EndReason, SessionEnd, SessionInput, SessionOutput};
