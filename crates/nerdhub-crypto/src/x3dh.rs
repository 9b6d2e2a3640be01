//! Extended Triple Diffie-Hellman key agreement.
//!
//! Both roles feed `0xFF || DH1 || DH2 || DH3 [|| DH4]` into HKDF-SHA256 with a
//! 32-byte zero salt. DH4 is present exactly when the responder's bundle
//! carries a onetime prekey, so the two sides only agree when they agree on
//! that.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::bundle::{PrivatePreKeyBundle, PublicPreKeyBundle};
use crate::error::CryptoError;
use crate::keys::{dh, generate_key_pair, DhOutput, PrivateKey, PublicKey, KEY_LEN};

/// HKDF info string shared by both roles.
pub const X3DH_INFO: &[u8] = b"Nerdhub X3DH Protocol specific info";

const X3DH_SALT: [u8; 32] = [0u8; 32];

/// Single-byte Curve25519 domain-separation prefix.
const X25519_MARKER: [u8; 1] = [0xFF];

/// The 32-byte secret both parties end up with.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SharedSecret {}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Result of [`X3dh::initiate`]: the ephemeral public key goes to the
/// responder, the secret stays here.
#[derive(Debug)]
pub struct InitiatorOutput {
    pub ephemeral_public: PublicKey,
    pub secret: SharedSecret,
}

/// X3DH over a local private bundle.
pub struct X3dh {
    bundle: PrivatePreKeyBundle,
}

impl X3dh {
    pub fn new(bundle: PrivatePreKeyBundle) -> Self {
        Self { bundle }
    }

    /// Attach the onetime prekey the initiator consumed, for the responder side.
    pub fn with_onetime_prekey(mut self, onetime_prekey: PrivateKey) -> Self {
        self.bundle.onetime_prekey = Some(onetime_prekey);
        self
    }

    /// Derive the secret as the party starting the handshake.
    ///
    /// The peer's signed prekey signature is checked before any DH runs.
    pub fn derive_as_initiator(
        &self,
        ephemeral: &PrivateKey,
        peer: &PublicPreKeyBundle,
    ) -> Result<SharedSecret, CryptoError> {
        if !peer.verify_signature() {
            return Err(CryptoError::SignedPreKeyVerificationFailure);
        }

        let mut terms = vec![
            dh(&self.bundle.identity_key, &peer.signed_prekey),
            dh(ephemeral, &peer.identity_key),
            dh(ephemeral, &peer.signed_prekey),
        ];
        if let Some(onetime) = &peer.onetime_prekey {
            terms.push(dh(ephemeral, onetime));
        }

        derive_secret(&terms)
    }

    /// Derive the secret as the party whose bundle was fetched.
    pub fn derive_as_responder(
        &self,
        peer_identity: &PublicKey,
        peer_ephemeral: &PublicKey,
    ) -> Result<SharedSecret, CryptoError> {
        let mut terms = vec![
            dh(&self.bundle.signed_prekey, peer_identity),
            dh(&self.bundle.identity_key, peer_ephemeral),
            dh(&self.bundle.signed_prekey, peer_ephemeral),
        ];
        if let Some(onetime) = &self.bundle.onetime_prekey {
            terms.push(dh(onetime, peer_ephemeral));
        }

        derive_secret(&terms)
    }

    /// Generate an ephemeral key pair and derive as initiator.
    pub fn initiate(&self, peer: &PublicPreKeyBundle) -> Result<InitiatorOutput, CryptoError> {
        let ephemeral = generate_key_pair();
        let secret = self.derive_as_initiator(&ephemeral.private, peer)?;
        Ok(InitiatorOutput {
            ephemeral_public: ephemeral.public,
            secret,
        })
    }
}

fn derive_secret(terms: &[DhOutput]) -> Result<SharedSecret, CryptoError> {
    let mut ikm = Vec::with_capacity(X25519_MARKER.len() + terms.len() * KEY_LEN);
    ikm.extend_from_slice(&X25519_MARKER);
    for term in terms {
        ikm.extend_from_slice(term.as_bytes());
    }

    let hk = Hkdf::<Sha256>::new(Some(&X3DH_SALT), &ikm);
    let mut okm = [0u8; KEY_LEN];
    let expanded = hk.expand(X3DH_INFO, &mut okm);
    ikm.zeroize();
    expanded.map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;

    Ok(SharedSecret(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::create_prekey_bundle;
    use crate::keys::KeyPair;
    use crate::xeddsa::{self, Signature};

    #[test]
    fn initiator_and_responder_agree_without_onetime_prekey() {
        let alice = create_prekey_bundle(None);
        let bob = create_prekey_bundle(None);
        let ephemeral = generate_key_pair();

        let alice_secret = X3dh::new(alice.to_private())
            .derive_as_initiator(&ephemeral.private, &bob.to_public())
            .unwrap();
        let bob_secret = X3dh::new(bob.to_private())
            .derive_as_responder(&alice.identity_key.public, &ephemeral.public)
            .unwrap();

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn initiator_and_responder_agree_with_onetime_prekey() {
        let alice = create_prekey_bundle(None);
        let bob = create_prekey_bundle(Some(generate_key_pair()));
        let ephemeral = generate_key_pair();

        let alice_secret = X3dh::new(alice.to_private())
            .derive_as_initiator(&ephemeral.private, &bob.to_public())
            .unwrap();
        let bob_secret = X3dh::new(bob.to_private())
            .derive_as_responder(&alice.identity_key.public, &ephemeral.public)
            .unwrap();

        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn onetime_prekey_on_one_side_only_diverges() {
        let alice = create_prekey_bundle(None);
        let onetime = generate_key_pair();
        let bob = create_prekey_bundle(None);
        let ephemeral = generate_key_pair();

        // Alice saw no onetime prekey, Bob thinks one was consumed.
        let alice_secret = X3dh::new(alice.to_private())
            .derive_as_initiator(&ephemeral.private, &bob.to_public())
            .unwrap();
        let bob_secret = X3dh::new(bob.to_private())
            .with_onetime_prekey(onetime.private.clone())
            .derive_as_responder(&alice.identity_key.public, &ephemeral.public)
            .unwrap();
        assert_ne!(alice_secret, bob_secret);

        // And the other way round.
        let mut bob_public = bob.to_public();
        bob_public.onetime_prekey = Some(onetime.public);
        let alice_secret = X3dh::new(alice.to_private())
            .derive_as_initiator(&ephemeral.private, &bob_public)
            .unwrap();
        let bob_secret = X3dh::new(bob.to_private())
            .derive_as_responder(&alice.identity_key.public, &ephemeral.public)
            .unwrap();
        assert_ne!(alice_secret, bob_secret);
    }

    fn fixed_pair(byte: u8) -> KeyPair {
        KeyPair::from_private(PrivateKey::from_bytes([byte; KEY_LEN]))
    }

    /// Alice's identity key, Bob's bundle (identity, signed, onetime) and the ephemeral key.
    fn fixed_handshake() -> (KeyPair, PublicPreKeyBundle, KeyPair, KeyPair) {
        let alice_identity = fixed_pair(0x11);
        let bob_identity = fixed_pair(0x22);
        let bob_signed = fixed_pair(0x33);
        let bob_onetime = fixed_pair(0x44);
        let ephemeral = fixed_pair(0x55);

        let bob = PublicPreKeyBundle {
            identity_key: bob_identity.public,
            signed_prekey: bob_signed.public,
            signed_prekey_signature: xeddsa::sign(bob_signed.public.as_bytes(), &bob_identity.private),
            onetime_prekey: None,
        };
        (alice_identity, bob, bob_onetime, ephemeral)
    }

    fn alice_x3dh(identity: &KeyPair) -> X3dh {
        let filler = generate_key_pair();
        X3dh::new(PrivatePreKeyBundle {
            identity_key: identity.private.clone(),
            signed_prekey: filler.private,
            signed_prekey_signature: Signature::from_bytes([0u8; 64]),
            onetime_prekey: None,
        })
    }

    fn raw_dh(private: &KeyPair, public: &PublicKey) -> [u8; 32] {
        x25519_dalek::StaticSecret::from(*private.private.as_bytes())
            .diffie_hellman(&x25519_dalek::PublicKey::from(*public.as_bytes()))
            .to_bytes()
    }

    fn hkdf_by_hand(terms: &[[u8; 32]]) -> [u8; 32] {
        let mut ikm = vec![0xFF];
        for term in terms {
            ikm.extend_from_slice(term);
        }
        let mut okm = [0u8; 32];
        Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm)
            .expand(b"Nerdhub X3DH Protocol specific info", &mut okm)
            .unwrap();
        okm
    }

    #[test]
    fn three_terms_without_onetime_prekey() {
        let (alice_identity, bob, _, ephemeral) = fixed_handshake();
        let expected = hkdf_by_hand(&[
            raw_dh(&alice_identity, &bob.signed_prekey),
            raw_dh(&ephemeral, &bob.identity_key),
            raw_dh(&ephemeral, &bob.signed_prekey),
        ]);

        let secret = alice_x3dh(&alice_identity)
            .derive_as_initiator(&ephemeral.private, &bob)
            .unwrap();
        assert_eq!(secret.as_bytes(), &expected);
        assert_eq!(
            hex::encode(secret.as_bytes()),
            "eb414ab2d9b5eefb903384aef4b9c0cf9f253ba2c5ae2c22665cfcef03c727c2"
        );
    }

    #[test]
    fn four_terms_with_onetime_prekey() {
        let (alice_identity, mut bob, bob_onetime, ephemeral) = fixed_handshake();
        bob.onetime_prekey = Some(bob_onetime.public);
        let expected = hkdf_by_hand(&[
            raw_dh(&alice_identity, &bob.signed_prekey),
            raw_dh(&ephemeral, &bob.identity_key),
            raw_dh(&ephemeral, &bob.signed_prekey),
            raw_dh(&ephemeral, &bob_onetime.public),
        ]);

        let secret = alice_x3dh(&alice_identity)
            .derive_as_initiator(&ephemeral.private, &bob)
            .unwrap();
        assert_eq!(secret.as_bytes(), &expected);
        assert_eq!(
            hex::encode(secret.as_bytes()),
            "8d60889c4820e3c7ded2c6ca2389313d25e648b59b15e29c90bf7ecfc3a5dafd"
        );
    }

    #[test]
    fn bad_signature_aborts_handshake() {
        let alice = create_prekey_bundle(None);
        let bob = create_prekey_bundle(None);
        let mut peer = bob.to_public();
        peer.signed_prekey = generate_key_pair().public;

        let result = X3dh::new(alice.to_private()).initiate(&peer);
        assert!(matches!(result, Err(CryptoError::SignedPreKeyVerificationFailure)));
    }

    #[test]
    fn initiate_hands_out_usable_ephemeral_key() {
        let alice = create_prekey_bundle(None);
        let bob = create_prekey_bundle(Some(generate_key_pair()));

        let out = X3dh::new(alice.to_private()).initiate(&bob.to_public()).unwrap();
        let bob_secret = X3dh::new(bob.to_private())
            .derive_as_responder(&alice.identity_key.public, &out.ephemeral_public)
            .unwrap();

        assert_eq!(out.secret, bob_secret);
    }

    #[test]
    fn fresh_ephemeral_keys_give_fresh_secrets() {
        let alice = X3dh::new(create_prekey_bundle(None).to_private());
        let bob = create_prekey_bundle(None).to_public();

        let first = alice.initiate(&bob).unwrap();
        let second = alice.initiate(&bob).unwrap();
        assert_ne!(first.secret, second.secret);
    }
}
