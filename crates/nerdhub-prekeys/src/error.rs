use nerdhub_crypto::CryptoError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreKeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("local key material is corrupted: {0}")]
    LocalKeyCorruption(String),

    #[error("missing auth context: {0}")]
    MissingAuthContext(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PreKeyError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Failures talking to the remote participant directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// The access token was refused; callers re-authenticate rather than retry.
    #[error("directory refused the access token ({0}): {1}")]
    Unauthorized(StatusCode, String),

    #[error("HTTP status {0}: {1}")]
    Status(StatusCode, String),

    #[error("directory rejected the request: {0}")]
    Rejected(String),
}
