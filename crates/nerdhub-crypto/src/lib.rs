pub mod bundle;
pub mod error;
pub mod key_container;
pub mod keys;
pub mod local_encryption;
pub mod x3dh;
pub mod xeddsa;

pub use bundle::{
    create_onetime_prekeys, create_prekey_bundle, create_signed_prekey, OneSidedPreKeyBundle,
    OnetimePreKey, PreKeyBundle, PrivatePreKeyBundle, PublicPreKeyBundle, SignedPreKey,
};
pub use error::CryptoError;
pub use keys::{dh, generate_key_pair, verify_key_pair, KeyPair, PrivateKey, PublicKey};
pub use local_encryption::{EncryptedBlob, LocalEncryptionContext, LocalEncryptionKey};
pub use x3dh::{SharedSecret, X3dh};
pub use xeddsa::Signature;
