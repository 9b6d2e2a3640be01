//! X25519 key-pair codec.
//!
//! Keys are plain 32-byte arrays wrapped in distinct public/private types so a
//! private scalar can never be handed to an API that expects a public point.
//! [`dh`] is the raw scalar multiplication every other component builds on,
//! and [`verify_key_pair`] reuses it as a self-test for key material read back
//! from storage.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length of every X25519 scalar, point and DH output.
pub const KEY_LEN: usize = 32;

/// An X25519 public point (Montgomery u-coordinate).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("public key is not base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    fn to_x25519(self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// An X25519 private scalar. Zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <[u8; KEY_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidKey(format!(
                "private key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw scalar bytes.
    ///
    /// # Security
    /// Only hand these to the local-encryption layer before persisting.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the matching public point.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*X25519Public::from(&self.to_static_secret()).as_bytes())
    }

    fn to_static_secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// A private scalar together with its public point.
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(*X25519Public::from(&secret).as_bytes());
        Self {
            private: PrivateKey(secret.to_bytes()),
            public,
        }
    }

    /// Rebuild a pair from a private scalar alone.
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Output of a single X25519 scalar multiplication.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; KEY_LEN]);

impl DhOutput {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for DhOutput {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for DhOutput {}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// Generate a cryptographically random X25519 key pair.
pub fn generate_key_pair() -> KeyPair {
    KeyPair::generate()
}

/// X25519 scalar multiplication of `private` with `public`.
pub fn dh(private: &PrivateKey, public: &PublicKey) -> DhOutput {
    let shared = private.to_static_secret().diffie_hellman(&public.to_x25519());
    DhOutput(*shared.as_bytes())
}

/// Check that `private` and `public` belong to the same key pair.
///
/// Runs a DH exchange against a throwaway pair `T` and compares
/// `dh(private, T.public)` with `dh(T.private, public)`; the two agree only
/// when `public` is the point derived from `private`.
pub fn verify_key_pair(private: &PrivateKey, public: &PublicKey) -> bool {
    let throwaway = generate_key_pair();
    dh(private, &throwaway.public) == dh(&throwaway.private, public)
}
