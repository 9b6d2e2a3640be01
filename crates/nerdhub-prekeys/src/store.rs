//! Storage contract for local prekey material.
//!
//! Public halves are stored as raw bytes. Private halves are stored as sealed
//! blobs produced by the local encryption context and are opaque here.

use async_trait::async_trait;

use crate::error::PreKeyError;

/// The single bundle row kept per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPreKeyBundle {
    pub user_id: String,
    pub pub_identity_key: Vec<u8>,
    pub priv_identity_key: Vec<u8>,
    pub pub_signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub priv_signed_prekey: Vec<u8>,
    pub is_published: bool,
    pub participant_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Columns written on bundle creation or reset.
#[derive(Debug, Clone)]
pub struct NewPreKeyBundle {
    pub pub_identity_key: Vec<u8>,
    pub priv_identity_key: Vec<u8>,
    pub pub_signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub priv_signed_prekey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOnetimePreKey {
    pub id: String,
    pub user_id: String,
    pub pub_key: Vec<u8>,
    pub priv_key: Vec<u8>,
    pub is_published: bool,
    pub participant_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewOnetimePreKey {
    pub id: String,
    pub pub_key: Vec<u8>,
    pub priv_key: Vec<u8>,
    pub participant_id: Option<String>,
}

/// Result of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    Conflict { current: u64 },
}

#[async_trait]
pub trait PreKeyBundleStore: Send + Sync {
    async fn find_bundle(&self, user_id: &str) -> Result<Option<StoredPreKeyBundle>, PreKeyError>;

    /// Insert the bundle row, replacing any existing one for the user.
    async fn create_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError>;

    /// Overwrite every key column and clear the published flag.
    async fn reset_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError>;

    async fn mark_bundle_published(&self, user_id: &str, participant_id: &str) -> Result<(), PreKeyError>;

    async fn delete_bundle(&self, user_id: &str) -> Result<(), PreKeyError>;
}

#[async_trait]
pub trait OnetimePreKeyStore: Send + Sync {
    /// Most recently created key, ties broken by insertion order.
    async fn find_latest(&self, user_id: &str) -> Result<Option<StoredOnetimePreKey>, PreKeyError>;

    async fn find_unpublished(&self, user_id: &str) -> Result<Vec<StoredOnetimePreKey>, PreKeyError>;

    async fn count(&self, user_id: &str) -> Result<usize, PreKeyError>;

    /// Version token for the user's collection. Changes on every append or delete.
    async fn version(&self, user_id: &str) -> Result<u64, PreKeyError>;

    /// Append `keys` only if the collection is still at `expected_version`.
    async fn compare_and_append(
        &self,
        user_id: &str,
        expected_version: u64,
        keys: &[NewOnetimePreKey],
    ) -> Result<CasOutcome, PreKeyError>;

    /// Drop every key for the user. Returns the number removed.
    async fn delete_all(&self, user_id: &str) -> Result<usize, PreKeyError>;

    /// Flag the given keys as published under `participant_id`.
    async fn mark_published(
        &self,
        user_id: &str,
        participant_id: &str,
        ids: &[String],
    ) -> Result<usize, PreKeyError>;

    /// Read-modify-write append that retries on version conflicts.
    async fn append_many(&self, user_id: &str, keys: &[NewOnetimePreKey]) -> Result<u64, PreKeyError> {
        loop {
            let expected = self.version(user_id).await?;
            match self.compare_and_append(user_id, expected, keys).await? {
                CasOutcome::Applied { version } => return Ok(version),
                CasOutcome::Conflict { current } => {
                    tracing::debug!(user_id, expected, current, "onetime prekey append conflict, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
