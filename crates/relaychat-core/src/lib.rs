//! # relaychat core
//!
//! Substrate shared by the relay, the listener and the dialer.
//!
//! This crate provides:
//! - Peer identities (Ed25519)
//! - Self-describing peer addresses
//! - Length-prefixed message framing
//! - Mutual authentication handshake
//! - The transport host: listeners, protocol handlers, outbound streams
//! - Line-oriented duplex streams with idempotent close
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Stream                                   │
//! │   (shared line reader/writer for one chat session)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Host                                     │
//! │   (handshake + protocol negotiation over TCP or a circuit)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                   │
//! │   (magic + length + bincode payload)                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod handshake;
pub mod host;
pub mod identity;
pub mod multiaddr;
pub mod stream;

pub use error::{Error, RejectReason, Result};
pub use host::{
    AsyncIo, BoxedIo, Connection, ConnectionReader, ConnectionWriter, FaultSlot, Host, HostConfig,
};
pub use identity::{Identity, PEER_ID_LEN, PeerId};
pub use multiaddr::{Multiaddr, Protocol};
pub use stream::{MAX_LINE_LEN, Stream};
