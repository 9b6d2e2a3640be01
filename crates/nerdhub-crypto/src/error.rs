use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signed prekey verification failed")]
    SignedPreKeyVerificationFailure,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("no local encryption key in the session context")]
    MissingLocalEncryptionKey,

    #[error("no user/participant bound to the encryption context")]
    MissingAuthContext,

    #[error("malformed key container: {0}")]
    KeyContainerFormat(String),

    #[error("key container I/O failed: {0}")]
    KeyContainerIo(#[from] std::io::Error),
}
