//! Encryption at rest for private key material.
//!
//! AES-256-GCM under a locally held key, with associated data derived from
//! the (user, participant) pair the material belongs to. The key and the pair
//! live in an explicit [`LocalEncryptionContext`] owned by the caller; the
//! associated data is recomputed only when the pair changes.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const LOCAL_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 16;

const AD_SALT: &[u8] = b"dofihqisfhqsdgfuyqfgueqfyqgfuqdygfhdqsgfhjdsqfggfsdquyfg";
const AD_INFO: &[u8] = b"some-text-for-local-encryption-ad";
const AD_LEN: usize = 32;

/// The 256-bit symmetric key used for at-rest encryption.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LocalEncryptionKey([u8; LOCAL_KEY_LEN]);

impl LocalEncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; LOCAL_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; LOCAL_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <[u8; LOCAL_KEY_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "local encryption key must be {LOCAL_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; LOCAL_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for LocalEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalEncryptionKey([REDACTED])")
    }
}

/// Output of one encryption: ciphertext, the random IV, and the GCM tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub cipher: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub auth_tag: [u8; AUTH_TAG_LEN],
}

/// On-disk form: a JSON object of base64 strings.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptedBlobRecord {
    cipher: String,
    iv: String,
    auth_tag: String,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let record = EncryptedBlobRecord {
            cipher: STANDARD.encode(&self.cipher),
            iv: STANDARD.encode(self.iv),
            auth_tag: STANDARD.encode(self.auth_tag),
        };
        serde_json::to_vec(&record)
            .map_err(|e| CryptoError::EncryptionError(format!("serialize blob: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let record: EncryptedBlobRecord = serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::DecryptionError(format!("malformed blob: {e}")))?;

        let cipher = decode_field("cipher", &record.cipher)?;
        let iv = decode_field("iv", &record.iv)?;
        let auth_tag = decode_field("authTag", &record.auth_tag)?;

        Ok(Self {
            cipher,
            iv: <[u8; IV_LEN]>::try_from(iv.as_slice())
                .map_err(|_| CryptoError::DecryptionError(format!("iv must be {IV_LEN} bytes")))?,
            auth_tag: <[u8; AUTH_TAG_LEN]>::try_from(auth_tag.as_slice()).map_err(|_| {
                CryptoError::DecryptionError(format!("authTag must be {AUTH_TAG_LEN} bytes"))
            })?,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::DecryptionError(format!("{name} is not base64: {e}")))
}

/// Associated data bound to a (user, participant) pair.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AssociatedData([u8; AD_LEN]);

impl AssociatedData {
    pub fn as_bytes(&self) -> &[u8; AD_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for AssociatedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssociatedData({})", hex::encode(self.0))
    }
}

/// HKDF-SHA256 over `"{user_id}-{participant_id}"`.
pub fn derive_associated_data(
    user_id: &str,
    participant_id: &str,
) -> Result<AssociatedData, CryptoError> {
    let ikm = format!("{user_id}-{participant_id}");
    let hk = Hkdf::<Sha256>::new(Some(AD_SALT), ikm.as_bytes());
    let mut ad = [0u8; AD_LEN];
    hk.expand(AD_INFO, &mut ad)
        .map_err(|e| CryptoError::KeyDerivation(format!("associated data: {e}")))?;
    Ok(AssociatedData(ad))
}

#[derive(Debug)]
struct Binding {
    user_id: String,
    participant_id: String,
    ad: AssociatedData,
}

/// Key plus identity binding for at-rest encryption.
#[derive(Debug, Default)]
pub struct LocalEncryptionContext {
    key: Option<LocalEncryptionKey>,
    binding: Option<Binding>,
}

impl LocalEncryptionContext {
    pub fn new(key: LocalEncryptionKey) -> Self {
        Self {
            key: Some(key),
            binding: None,
        }
    }

    pub fn set_key(&mut self, key: LocalEncryptionKey) {
        self.key = Some(key);
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Bind to a (user, participant) pair. The associated data is derived
    /// again only when either identifier differs from the current binding.
    pub fn bind(&mut self, user_id: &str, participant_id: &str) -> Result<(), CryptoError> {
        if let Some(binding) = &self.binding {
            if binding.user_id == user_id && binding.participant_id == participant_id {
                return Ok(());
            }
        }
        let ad = derive_associated_data(user_id, participant_id)?;
        self.binding = Some(Binding {
            user_id: user_id.to_owned(),
            participant_id: participant_id.to_owned(),
            ad,
        });
        Ok(())
    }

    pub fn associated_data(&self) -> Option<&AssociatedData> {
        self.binding.as_ref().map(|b| &b.ad)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let (cipher, ad) = self.parts()?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(&Nonce::from(iv), ad.as_bytes(), &mut buffer)
            .map_err(|_| CryptoError::EncryptionError("AES-GCM encryption failed".into()))?;

        let mut auth_tag = [0u8; AUTH_TAG_LEN];
        auth_tag.copy_from_slice(tag.as_slice());

        Ok(EncryptedBlob {
            cipher: buffer,
            iv,
            auth_tag,
        })
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, CryptoError> {
        let (cipher, ad) = self.parts()?;

        let mut buffer = blob.cipher.clone();
        cipher
            .decrypt_in_place_detached(
                &Nonce::from(blob.iv),
                ad.as_bytes(),
                &mut buffer,
                &Tag::from(blob.auth_tag),
            )
            .map_err(|_| CryptoError::DecryptionError("AES-GCM authentication failed".into()))?;
        Ok(buffer)
    }

    /// Encrypt and serialize in one step.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext)?.to_bytes()
    }

    /// Parse and decrypt in one step.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt(&EncryptedBlob::from_bytes(sealed)?)
    }

    fn parts(&self) -> Result<(Aes256Gcm, &AssociatedData), CryptoError> {
        let key = self
            .key
            .as_ref()
            .ok_or(CryptoError::MissingLocalEncryptionKey)?;
        let ad = self
            .associated_data()
            .ok_or(CryptoError::MissingAuthContext)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(format!("AES-256 key: {e}")))?;
        Ok((cipher, ad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_context() -> LocalEncryptionContext {
        let mut ctx = LocalEncryptionContext::new(LocalEncryptionKey::generate());
        ctx.bind("user-1", "42").unwrap();
        ctx
    }

    #[test]
    fn roundtrip_empty_and_nonempty() {
        let ctx = bound_context();
        for plaintext in [Vec::new(), vec![7u8; 100]] {
            let blob = ctx.encrypt(&plaintext).unwrap();
            assert_eq!(ctx.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn encrypting_twice_differs() {
        let ctx = bound_context();
        let a = ctx.encrypt(b"private key bytes").unwrap();
        let b = ctx.encrypt(b"private key bytes").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.cipher, b.cipher);
    }

    #[test]
    fn missing_key_fails_fast() {
        let mut ctx = LocalEncryptionContext::default();
        ctx.bind("user-1", "42").unwrap();
        assert!(matches!(
            ctx.encrypt(b"x"),
            Err(CryptoError::MissingLocalEncryptionKey)
        ));

        let sealed = bound_context().encrypt(b"x").unwrap();
        assert!(matches!(
            ctx.decrypt(&sealed),
            Err(CryptoError::MissingLocalEncryptionKey)
        ));
    }

    #[test]
    fn unbound_context_fails_fast() {
        let ctx = LocalEncryptionContext::new(LocalEncryptionKey::generate());
        assert!(matches!(ctx.encrypt(b"x"), Err(CryptoError::MissingAuthContext)));
    }

    #[test]
    fn ciphertext_is_bound_to_participant() {
        let key = LocalEncryptionKey::generate();
        let mut ctx = LocalEncryptionContext::new(key);
        ctx.bind("user-1", "42").unwrap();
        let blob = ctx.encrypt(b"secret").unwrap();

        ctx.bind("user-1", "43").unwrap();
        assert!(matches!(ctx.decrypt(&blob), Err(CryptoError::DecryptionError(_))));

        ctx.bind("user-1", "42").unwrap();
        assert_eq!(ctx.decrypt(&blob).unwrap(), b"secret");
    }

    #[test]
    fn rebinding_same_pair_keeps_associated_data() {
        let mut ctx = bound_context();
        let before = ctx.associated_data().cloned().unwrap();
        ctx.bind("user-1", "42").unwrap();
        assert_eq!(ctx.associated_data(), Some(&before));

        ctx.bind("user-2", "42").unwrap();
        assert_ne!(ctx.associated_data(), Some(&before));
    }

    #[test]
    fn associated_data_is_deterministic() {
        let a = derive_associated_data("u", "p").unwrap();
        let b = derive_associated_data("u", "p").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, derive_associated_data("u", "q").unwrap());
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let ctx = bound_context();
        let mut blob = ctx.encrypt(b"secret").unwrap();
        blob.auth_tag[0] ^= 1;
        assert!(ctx.decrypt(&blob).is_err());
    }

    #[test]
    fn sealed_blob_is_json_with_base64_fields() {
        let ctx = bound_context();
        let sealed = ctx.seal(b"secret").unwrap();

        let value: serde_json::Value = serde_json::from_slice(&sealed).unwrap();
        assert!(value["cipher"].is_string());
        assert!(value["iv"].is_string());
        assert!(value["authTag"].is_string());

        assert_eq!(ctx.open(&sealed).unwrap(), b"secret");
    }

    #[test]
    fn malformed_blob_is_a_decryption_error() {
        let ctx = bound_context();
        assert!(matches!(
            ctx.open(b"not json"),
            Err(CryptoError::DecryptionError(_))
        ));
        assert!(EncryptedBlob::from_bytes(br#"{"cipher":"","iv":"AAAA","authTag":""}"#).is_err());
    }
}
