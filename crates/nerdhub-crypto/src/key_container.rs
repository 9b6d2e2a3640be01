//! On-disk container for the local encryption key.
//!
//! ```text
//! -----BEGIN AES KEY-----
//! <base64>
//! -----END AES KEY-----
//! ```

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::local_encryption::LocalEncryptionKey;

pub const HEADER: &str = "-----BEGIN AES KEY-----";
pub const FOOTER: &str = "-----END AES KEY-----";

const KEY_NAME_SALT: &[u8] = b"some-salt-for-user-based-local-encryption-key-name";

/// Generate a fresh random local encryption key.
pub fn generate_key() -> LocalEncryptionKey {
    LocalEncryptionKey::generate()
}

/// Render a key in container format.
pub fn encode_key(key: &LocalEncryptionKey) -> String {
    format!("{HEADER}\n{}\n{FOOTER}\n", STANDARD.encode(key.as_bytes()))
}

/// Parse a key out of container text.
///
/// Surrounding whitespace and indentation on each line are ignored; the
/// payload may span several lines.
pub fn decode_key(content: &str) -> Result<LocalEncryptionKey, CryptoError> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some(HEADER) {
        return Err(CryptoError::KeyContainerFormat(format!(
            "missing `{HEADER}` marker"
        )));
    }

    let mut payload = String::new();
    let mut closed = false;
    for line in lines.by_ref() {
        if line == FOOTER {
            closed = true;
            break;
        }
        payload.push_str(line);
    }
    if !closed {
        return Err(CryptoError::KeyContainerFormat(format!(
            "missing `{FOOTER}` marker"
        )));
    }
    if payload.is_empty() {
        return Err(CryptoError::KeyContainerFormat("empty key payload".into()));
    }

    let bytes = STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| CryptoError::KeyContainerFormat(format!("payload is not base64: {e}")))?;
    LocalEncryptionKey::from_slice(&bytes)
        .map_err(|e| CryptoError::KeyContainerFormat(e.to_string()))
}

/// Write `key` to `path`, creating parent directories as needed.
pub fn store_key(key: &LocalEncryptionKey, path: &Path) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_owner_only(path, encode_key(key).as_bytes())?;
    tracing::debug!(path = %path.display(), "stored local encryption key");
    Ok(())
}

/// The file is created owner-only; an existing file is narrowed before it is truncated.
#[cfg(unix)]
fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.set_len(0)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Read a key previously written by [`store_key`].
pub fn retrieve_key(path: &Path) -> Result<LocalEncryptionKey, CryptoError> {
    let content = std::fs::read_to_string(path)?;
    decode_key(&content)
}

/// Per-user container location: hex of HKDF over `"{user_id}-{participant_id}"`
/// with a `.pem` suffix, under `dir`.
pub fn key_path_for(
    dir: &Path,
    user_id: &str,
    participant_id: &str,
) -> Result<PathBuf, CryptoError> {
    let ikm = format!("{user_id}-{participant_id}");
    let hk = Hkdf::<Sha256>::new(Some(KEY_NAME_SALT), ikm.as_bytes());
    let mut name = [0u8; 32];
    hk.expand(&[], &mut name)
        .map_err(|e| CryptoError::KeyDerivation(format!("key file name: {e}")))?;
    Ok(dir.join(format!("{}.pem", hex::encode(name))))
}
