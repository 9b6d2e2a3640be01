//! `PreKeyBundle` generation.
//!
//! A bundle holds the long-term identity key, the medium-term signed prekey
//! with its XEdDSA signature, and optionally a onetime prekey. Public halves
//! are what the directory publishes; private halves never leave the device
//! unencrypted.

use uuid::Uuid;

use crate::keys::{generate_key_pair, KeyPair, PrivateKey, PublicKey};
use crate::xeddsa::{self, Signature};

/// A complete bundle with both halves of every key.
#[derive(Clone, Debug)]
pub struct PreKeyBundle {
    pub identity_key: KeyPair,
    pub signed_prekey: KeyPair,
    pub signed_prekey_signature: Signature,
    pub onetime_prekey: Option<KeyPair>,
}

/// A bundle restricted to one half of every key pair.
///
/// The signature is public data and travels with both halves.
#[derive(Clone, Debug)]
pub struct OneSidedPreKeyBundle<K> {
    pub identity_key: K,
    pub signed_prekey: K,
    pub signed_prekey_signature: Signature,
    pub onetime_prekey: Option<K>,
}

/// What a peer fetches from the directory.
pub type PublicPreKeyBundle = OneSidedPreKeyBundle<PublicKey>;

/// The local secrets needed to run X3DH.
pub type PrivatePreKeyBundle = OneSidedPreKeyBundle<PrivateKey>;

impl PreKeyBundle {
    pub fn to_public(&self) -> PublicPreKeyBundle {
        OneSidedPreKeyBundle {
            identity_key: self.identity_key.public,
            signed_prekey: self.signed_prekey.public,
            signed_prekey_signature: self.signed_prekey_signature,
            onetime_prekey: self.onetime_prekey.as_ref().map(|k| k.public),
        }
    }

    pub fn to_private(&self) -> PrivatePreKeyBundle {
        OneSidedPreKeyBundle {
            identity_key: self.identity_key.private.clone(),
            signed_prekey: self.signed_prekey.private.clone(),
            signed_prekey_signature: self.signed_prekey_signature,
            onetime_prekey: self.onetime_prekey.as_ref().map(|k| k.private.clone()),
        }
    }

    pub fn verify_signature(&self) -> bool {
        verify_signed_prekey(
            &self.identity_key.public,
            &self.signed_prekey.public,
            &self.signed_prekey_signature,
        )
    }
}

impl PublicPreKeyBundle {
    /// Check the signed prekey signature against the identity key.
    pub fn verify_signature(&self) -> bool {
        verify_signed_prekey(
            &self.identity_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        )
    }
}

/// A signed prekey and the identity key's signature over its public bytes.
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    pub key_pair: KeyPair,
    pub signature: Signature,
}

/// A onetime prekey with its opaque identifier.
#[derive(Clone, Debug)]
pub struct OnetimePreKey {
    pub id: String,
    pub key_pair: KeyPair,
}

impl OnetimePreKey {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            key_pair: generate_key_pair(),
        }
    }
}

/// Generate a fresh bundle, optionally carrying a caller-supplied onetime prekey.
pub fn create_prekey_bundle(onetime_prekey: Option<KeyPair>) -> PreKeyBundle {
    let identity_key = generate_key_pair();
    let SignedPreKey {
        key_pair: signed_prekey,
        signature,
    } = create_signed_prekey(&identity_key.private);

    PreKeyBundle {
        identity_key,
        signed_prekey,
        signed_prekey_signature: signature,
        onetime_prekey,
    }
}

/// Generate a signed prekey under an existing identity key.
pub fn create_signed_prekey(identity_private: &PrivateKey) -> SignedPreKey {
    let key_pair = generate_key_pair();
    let signature = xeddsa::sign(key_pair.public.as_bytes(), identity_private);
    SignedPreKey {
        key_pair,
        signature,
    }
}

/// Generate `count` onetime prekeys, each with a fresh v4 UUID.
pub fn create_onetime_prekeys(count: usize) -> Vec<OnetimePreKey> {
    (0..count).map(|_| OnetimePreKey::generate()).collect()
}

fn verify_signed_prekey(identity: &PublicKey, signed_prekey: &PublicKey, signature: &Signature) -> bool {
    xeddsa::verify(signature, signed_prekey.as_bytes(), identity)
}
