//! Mutual peer authentication
//!
//! Both sides run the same two-message exchange:
//!
//! ```text
//! A -> B: Hello { version, peer_id_a, nonce_a }
//! B -> A: Hello { version, peer_id_b, nonce_b }
//! A -> B: Proof { sign_a(DOMAIN || nonce_b || peer_id_a) }
//! B -> A: Proof { sign_b(DOMAIN || nonce_a || peer_id_b) }
//! ```
//!
//! Each proof binds the signer's identity to a nonce chosen by the other side,
//! so a recorded proof cannot be replayed on a new connection. The exchange
//! authenticates identities only; payload bytes are not encrypted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::codec::{recv_message, send_message};
use crate::error::{Error, Result};
use crate::identity::{Identity, PeerId};

/// Handshake protocol version
pub const HANDSHAKE_VERSION: u8 = 1;

/// Domain separator for signed transcripts
const DOMAIN: &[u8] = b"relaychat/handshake/v1";

#[derive(Debug, Serialize, Deserialize)]
enum HandshakeMessage {
    Hello {
        version: u8,
        peer_id: PeerId,
        nonce: [u8; 32],
    },
    Proof {
        signature: Vec<u8>,
    },
}

fn transcript(nonce: &[u8; 32], signer: &PeerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(DOMAIN.len() + 64);
    out.extend_from_slice(DOMAIN);
    out.extend_from_slice(nonce);
    out.extend_from_slice(signer.as_bytes());
    out
}

/// Authenticate the peer on the other end of `io`
///
/// If `expected` is set, the remote identity must match it.
///
/// # Errors
///
/// Returns [`Error::Handshake`] on version mismatch, bad proof, unexpected
/// identity or a self-connection, and [`Error::Timeout`] if the exchange
/// does not finish within `timeout`.
pub async fn perform<S>(
    io: &mut S,
    identity: &Identity,
    expected: Option<PeerId>,
    timeout: Duration,
) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::time::timeout(timeout, exchange(io, identity, expected))
        .await
        .map_err(|_| Error::timeout("handshake"))?
}

async fn exchange<S>(io: &mut S, identity: &Identity, expected: Option<PeerId>) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let local = identity.peer_id();
    let nonce: [u8; 32] = rand::random();

    send_message(
        io,
        &HandshakeMessage::Hello {
            version: HANDSHAKE_VERSION,
            peer_id: local,
            nonce,
        },
    )
    .await?;

    let (remote, remote_nonce) = match recv_message(io).await? {
        HandshakeMessage::Hello {
            version,
            peer_id,
            nonce,
        } => {
            if version != HANDSHAKE_VERSION {
                return Err(Error::handshake("unsupported handshake version"));
            }
            (peer_id, nonce)
        }
        HandshakeMessage::Proof { .. } => return Err(Error::handshake("expected hello")),
    };

    if remote == local {
        return Err(Error::handshake("connected to self"));
    }
    if let Some(expected) = expected {
        if remote != expected {
            return Err(Error::Handshake(
                format!("expected peer {}, got {}", expected.short(), remote.short()).into(),
            ));
        }
    }

    let signature = identity.sign(&transcript(&remote_nonce, &local));
    send_message(
        io,
        &HandshakeMessage::Proof {
            signature: signature.to_vec(),
        },
    )
    .await?;

    match recv_message(io).await? {
        HandshakeMessage::Proof { signature } => {
            remote.verify(&transcript(&nonce, &remote), &signature)?;
        }
        HandshakeMessage::Hello { .. } => return Err(Error::handshake("expected proof")),
    }

    trace!(remote = %remote.short(), "handshake complete");
    Ok(remote)
}
