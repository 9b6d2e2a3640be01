//! XEdDSA signatures over X25519 key pairs.
//!
//! Follows "The XEdDSA and VXEdDSA Signature Schemes" (Perrin, rev. 1): the
//! Montgomery private scalar is mapped onto the twisted Edwards curve with the
//! sign bit of the public point forced to zero, so the signature verifies
//! against the birational image of the plain X25519 public key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keys::{PrivateKey, PublicKey};

/// XEdDSA signature length: `R || s`.
pub const SIGNATURE_LEN: usize = 64;

/// A 64-byte XEdDSA signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes = <[u8; SIGNATURE_LEN]>::try_from(bytes).map_err(|_| {
            CryptoError::InvalidSignature(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidSignature(format!("signature is not base64: {e}")))?;
        Self::from_slice(&bytes)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// Sign `message` with an X25519 private key.
///
/// Each call draws 64 fresh random bytes for the nonce, so signing the same
/// message twice yields two different (equally valid) signatures.
pub fn sign(message: &[u8], private_key: &PrivateKey) -> Signature {
    let mut k_bytes = *private_key.as_bytes();
    k_bytes[0] &= 248;
    k_bytes[31] &= 127;
    k_bytes[31] |= 64;
    let k = Scalar::from_bytes_mod_order(k_bytes);
    k_bytes.zeroize();

    // E = kB; flip the scalar when E has a negative x so that A = aB has sign 0.
    let e_compressed = EdwardsPoint::mul_base(&k).compress();
    let mut a = if e_compressed.as_bytes()[31] >> 7 == 1 {
        -k
    } else {
        k
    };
    let mut a_bytes = e_compressed.to_bytes();
    a_bytes[31] &= 0x7F;
    let a_compressed = CompressedEdwardsY(a_bytes);

    let mut random = [0u8; 64];
    OsRng.fill_bytes(&mut random);

    let mut r = nonce_scalar(&a, message, &random);
    let r_compressed = EdwardsPoint::mul_base(&r).compress();
    let h = challenge_scalar(&r_compressed, &a_compressed, message);
    let s = r + h * a;

    random.zeroize();
    r.zeroize();
    a.zeroize();

    let mut signature = [0u8; SIGNATURE_LEN];
    signature[..32].copy_from_slice(r_compressed.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    Signature(signature)
}

/// Verify an XEdDSA signature against an X25519 public key.
pub fn verify(signature: &Signature, message: &[u8], public_key: &PublicKey) -> bool {
    let u = public_key.as_bytes();
    // Canonical X25519 points never carry the top bit.
    if u[31] & 0x80 != 0 {
        return false;
    }
    let Some(a_point) = MontgomeryPoint(*u).to_edwards(0) else {
        return false;
    };
    if !a_point.is_torsion_free() {
        return false;
    }
    let a_compressed = a_point.compress();

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature.0[..32]);
    s_bytes.copy_from_slice(&signature.0[32..]);

    if s_bytes[31] & 0xE0 != 0 {
        return false;
    }
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes)) else {
        return false;
    };

    let h = challenge_scalar(&CompressedEdwardsY(r_bytes), &a_compressed, message);
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

    r_check.compress().as_bytes().ct_eq(&r_bytes).into()
}

/// r = hash1(a || M || Z) mod q
fn nonce_scalar(a: &Scalar, message: &[u8], random: &[u8; 64]) -> Scalar {
    let mut hasher = Sha512::new();
    // hash_1 prefix: 2^256 - 2 encoded little-endian
    hasher.update([0xFE]);
    hasher.update([0xFF; 31]);
    hasher.update(a.as_bytes());
    hasher.update(message);
    hasher.update(random);
    wide_scalar(&hasher.finalize())
}

/// h = hash(R || A || M) mod q
fn challenge_scalar(r: &CompressedEdwardsY, a: &CompressedEdwardsY, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r.as_bytes());
    hasher.update(a.as_bytes());
    hasher.update(message);
    wide_scalar(&hasher.finalize())
}

fn wide_scalar(digest: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(digest);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;

    #[test]
    fn sign_and_verify() {
        let identity = generate_key_pair();
        let message = generate_key_pair().public;

        let signature = sign(message.as_bytes(), &identity.private);
        assert!(verify(&signature, message.as_bytes(), &identity.public));
    }

    #[test]
    fn signatures_are_randomized() {
        let identity = generate_key_pair();
        let first = sign(b"same message", &identity.private);
        let second = sign(b"same message", &identity.private);

        assert_ne!(first, second);
        assert!(verify(&first, b"same message", &identity.public));
        assert!(verify(&second, b"same message", &identity.public));
    }

    #[test]
    fn rejects_wrong_public_key() {
        let identity = generate_key_pair();
        let other = generate_key_pair();
        let signature = sign(b"hello", &identity.private);
        assert!(!verify(&signature, b"hello", &other.public));
    }

    #[test]
    fn any_message_bit_flip_fails() {
        let identity = generate_key_pair();
        let message = *generate_key_pair().public.as_bytes();
        let signature = sign(&message, &identity.private);

        for byte in 0..message.len() {
            for bit in 0..8 {
                let mut flipped = message;
                flipped[byte] ^= 1 << bit;
                assert!(
                    !verify(&signature, &flipped, &identity.public),
                    "flip of message byte {byte} bit {bit} still verified"
                );
            }
        }
    }

    #[test]
    fn any_signature_bit_flip_fails() {
        let identity = generate_key_pair();
        let signature = sign(b"signed prekey", &identity.private);

        for byte in 0..SIGNATURE_LEN {
            for bit in 0..8 {
                let mut flipped = *signature.as_bytes();
                flipped[byte] ^= 1 << bit;
                assert!(
                    !verify(&Signature::from_bytes(flipped), b"signed prekey", &identity.public),
                    "flip of signature byte {byte} bit {bit} still verified"
                );
            }
        }
    }

    #[test]
    fn any_public_key_bit_flip_fails() {
        let identity = generate_key_pair();
        let signature = sign(b"signed prekey", &identity.private);

        for byte in 0..32 {
            for bit in 0..8 {
                let mut flipped = *identity.public.as_bytes();
                flipped[byte] ^= 1 << bit;
                assert!(
                    !verify(&signature, b"signed prekey", &PublicKey::from_bytes(flipped)),
                    "flip of public key byte {byte} bit {bit} still verified"
                );
            }
        }
    }

    #[test]
    fn rejects_non_canonical_s() {
        let identity = generate_key_pair();
        let mut bytes = *sign(b"msg", &identity.private).as_bytes();
        bytes[63] |= 0xE0;
        assert!(!verify(&Signature::from_bytes(bytes), b"msg", &identity.public));
    }

    #[test]
    fn signature_length_is_checked() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }
}
