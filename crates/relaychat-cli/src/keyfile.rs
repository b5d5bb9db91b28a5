//! Persistent node identity.
//!
//! The key file holds the Ed25519 secret key as 64 hex characters.

use anyhow::Context;
use ed25519_dalek::SigningKey;
use relaychat_core::Identity;
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

/// Load the identity stored at `path`, creating one if the file is absent
///
/// # Errors
///
/// Returns an error if the file cannot be read or written, or does not hold
/// a hex-encoded 32-byte key.
pub fn load_or_create(path: &Path) -> anyhow::Result<Identity> {
    if path.exists() {
        return load(path);
    }

    let signer = SigningKey::generate(&mut rand_core::OsRng);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoded = Zeroizing::new(hex::encode(signer.to_bytes()));
    fs::write(path, encoded.as_bytes())
        .with_context(|| format!("cannot write key file {}", path.display()))?;
    restrict_permissions(path)?;

    Ok(Identity::from_signing_key(signer))
}

/// Load the identity stored at `path`
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a
/// hex-encoded 32-byte key.
pub fn load(path: &Path) -> anyhow::Result<Identity> {
    let contents = Zeroizing::new(
        fs::read_to_string(path)
            .with_context(|| format!("cannot read key file {}", path.display()))?,
    );
    let bytes = Zeroizing::new(
        hex::decode(contents.trim())
            .with_context(|| format!("key file {} is not hex", path.display()))?,
    );
    let secret: Zeroizing<[u8; 32]> = Zeroizing::new(
        bytes
            .as_slice()
            .try_into()
            .with_context(|| format!("key file {} must hold 32 bytes", path.display()))?,
    );
    Ok(Identity::from_signing_key(SigningKey::from_bytes(&secret)))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
