//! Peer identity
//!
//! Every process generates one Ed25519 keypair at startup. The public key is
//! the peer's identifier on the wire and in addresses; the signing key proves
//! ownership of that identifier during the connection handshake.
//!
//! Identities are never persisted. Callers create one with
//! [`Identity::generate`] and hand it to [`crate::Host::new`]; nothing else
//! reads key material.
//!
//! # Example
//!
//! ```
//! use relaychat_core::Identity;
//!
//! let identity = Identity::generate();
//! let id = identity.peer_id();
//! assert_eq!(id.to_string().len(), 64);
//! ```

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// Peer identifier (Ed25519 public key)
///
/// Rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// First eight hex characters, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verify that `signature` over `message` was produced by this peer
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the identifier is not a valid Ed25519
    /// point or the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|_| Error::handshake("peer id is not a valid public key"))?;
        let signature = Signature::from_slice(signature)
            .map_err(|_| Error::handshake("malformed signature"))?;
        key.verify(message, &signature)
            .map_err(|_| Error::handshake("signature verification failed"))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| Error::invalid_address("peer id must be hex encoded"))?;
        let bytes: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::invalid_address("peer id must be 64 hex characters"))?;
        Ok(Self(bytes))
    }
}

/// Process identity: peer identifier plus the key that signs for it
#[derive(Clone)]
pub struct Identity {
    peer_id: PeerId,
    signer: SigningKey,
}

impl Identity {
    /// Generate a fresh random identity from the OS RNG
    #[must_use]
    pub fn generate() -> Self {
        use rand_core::OsRng;

        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Build an identity around an existing signing key
    #[must_use]
    pub fn from_signing_key(signer: SigningKey) -> Self {
        let peer_id = PeerId(signer.verifying_key().to_bytes());
        Self { peer_id, signer }
    }

    /// This process's peer identifier
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sign `message` with the identity key
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signer.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
