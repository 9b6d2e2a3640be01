//! In-memory implementations of the prekey storage traits.
//!
//! Used by tests and as a throwaway store. Data is lost on drop.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PreKeyError;
use crate::store::{
    timestamp_now, CasOutcome, NewOnetimePreKey, NewPreKeyBundle, OnetimePreKeyStore,
    PreKeyBundleStore, StoredOnetimePreKey, StoredPreKeyBundle,
};

#[derive(Default)]
pub struct MemoryPreKeyBundleStore {
    bundles: Mutex<HashMap<String, StoredPreKeyBundle>>,
}

impl MemoryPreKeyBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit a stored row in place. Lets tests tamper with key material.
    pub fn update_raw(&self, user_id: &str, f: impl FnOnce(&mut StoredPreKeyBundle)) -> bool {
        match self.bundles.lock().get_mut(user_id) {
            Some(row) => {
                f(row);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PreKeyBundleStore for MemoryPreKeyBundleStore {
    async fn find_bundle(&self, user_id: &str) -> Result<Option<StoredPreKeyBundle>, PreKeyError> {
        Ok(self.bundles.lock().get(user_id).cloned())
    }

    async fn create_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError> {
        let now = timestamp_now();
        self.bundles.lock().insert(
            user_id.to_string(),
            StoredPreKeyBundle {
                user_id: user_id.to_string(),
                pub_identity_key: bundle.pub_identity_key,
                priv_identity_key: bundle.priv_identity_key,
                pub_signed_prekey: bundle.pub_signed_prekey,
                signed_prekey_signature: bundle.signed_prekey_signature,
                priv_signed_prekey: bundle.priv_signed_prekey,
                is_published: false,
                participant_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn reset_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError> {
        let mut bundles = self.bundles.lock();
        let row = bundles
            .get_mut(user_id)
            .ok_or_else(|| PreKeyError::Storage(format!("no prekey bundle for user {user_id}")))?;
        row.pub_identity_key = bundle.pub_identity_key;
        row.priv_identity_key = bundle.priv_identity_key;
        row.pub_signed_prekey = bundle.pub_signed_prekey;
        row.signed_prekey_signature = bundle.signed_prekey_signature;
        row.priv_signed_prekey = bundle.priv_signed_prekey;
        row.is_published = false;
        row.updated_at = timestamp_now();
        Ok(())
    }

    async fn mark_bundle_published(&self, user_id: &str, participant_id: &str) -> Result<(), PreKeyError> {
        let mut bundles = self.bundles.lock();
        let row = bundles
            .get_mut(user_id)
            .ok_or_else(|| PreKeyError::Storage(format!("no prekey bundle for user {user_id}")))?;
        row.is_published = true;
        row.participant_id = Some(participant_id.to_string());
        row.updated_at = timestamp_now();
        Ok(())
    }

    async fn delete_bundle(&self, user_id: &str) -> Result<(), PreKeyError> {
        self.bundles.lock().remove(user_id);
        Ok(())
    }
}

#[derive(Default)]
struct Pool {
    version: u64,
    keys: Vec<StoredOnetimePreKey>,
}

#[derive(Default)]
pub struct MemoryOnetimePreKeyStore {
    pools: Mutex<HashMap<String, Pool>>,
}

impl MemoryOnetimePreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit the most recent key in place. Lets tests tamper with key material.
    pub fn update_latest_raw(&self, user_id: &str, f: impl FnOnce(&mut StoredOnetimePreKey)) -> bool {
        match self
            .pools
            .lock()
            .get_mut(user_id)
            .and_then(|pool| pool.keys.last_mut())
        {
            Some(key) => {
                f(key);
                true
            }
            None => false,
        }
    }

    pub fn all(&self, user_id: &str) -> Vec<StoredOnetimePreKey> {
        self.pools
            .lock()
            .get(user_id)
            .map(|pool| pool.keys.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OnetimePreKeyStore for MemoryOnetimePreKeyStore {
    async fn find_latest(&self, user_id: &str) -> Result<Option<StoredOnetimePreKey>, PreKeyError> {
        let pools = self.pools.lock();
        // Stable max: the last inserted key wins a created_at tie.
        Ok(pools.get(user_id).and_then(|pool| {
            pool.keys
                .iter()
                .enumerate()
                .max_by_key(|(i, k)| (k.created_at, *i))
                .map(|(_, k)| k.clone())
        }))
    }

    async fn find_unpublished(&self, user_id: &str) -> Result<Vec<StoredOnetimePreKey>, PreKeyError> {
        Ok(self
            .pools
            .lock()
            .get(user_id)
            .map(|pool| pool.keys.iter().filter(|k| !k.is_published).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, user_id: &str) -> Result<usize, PreKeyError> {
        Ok(self.pools.lock().get(user_id).map_or(0, |pool| pool.keys.len()))
    }

    async fn version(&self, user_id: &str) -> Result<u64, PreKeyError> {
        Ok(self.pools.lock().get(user_id).map_or(0, |pool| pool.version))
    }

    async fn compare_and_append(
        &self,
        user_id: &str,
        expected_version: u64,
        keys: &[NewOnetimePreKey],
    ) -> Result<CasOutcome, PreKeyError> {
        let mut pools = self.pools.lock();
        let pool = pools.entry(user_id.to_string()).or_default();
        if pool.version != expected_version {
            return Ok(CasOutcome::Conflict {
                current: pool.version,
            });
        }
        if let Some(dup) = keys.iter().find(|k| pool.keys.iter().any(|e| e.id == k.id)) {
            return Err(PreKeyError::Storage(format!(
                "duplicate onetime prekey id {}",
                dup.id
            )));
        }

        let now = timestamp_now();
        pool.keys.extend(keys.iter().map(|k| StoredOnetimePreKey {
            id: k.id.clone(),
            user_id: user_id.to_string(),
            pub_key: k.pub_key.clone(),
            priv_key: k.priv_key.clone(),
            is_published: false,
            participant_id: k.participant_id.clone(),
            created_at: now,
            updated_at: now,
        }));
        pool.version += 1;
        Ok(CasOutcome::Applied {
            version: pool.version,
        })
    }

    async fn delete_all(&self, user_id: &str) -> Result<usize, PreKeyError> {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.get_mut(user_id) else {
            return Ok(0);
        };
        let removed = pool.keys.len();
        pool.keys.clear();
        pool.version += 1;
        Ok(removed)
    }

    async fn mark_published(
        &self,
        user_id: &str,
        participant_id: &str,
        ids: &[String],
    ) -> Result<usize, PreKeyError> {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.get_mut(user_id) else {
            return Ok(0);
        };
        let now = timestamp_now();
        let mut marked = 0;
        for key in pool.keys.iter_mut().filter(|k| ids.contains(&k.id)) {
            key.is_published = true;
            key.participant_id = Some(participant_id.to_string());
            key.updated_at = now;
            marked += 1;
        }
        Ok(marked)
    }
}
