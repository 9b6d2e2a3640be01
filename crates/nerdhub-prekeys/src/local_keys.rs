//! Local encryption keys on disk, one container per user and participant.

use std::path::{Path, PathBuf};

use nerdhub_crypto::key_container::{key_path_for, retrieve_key, store_key};
use nerdhub_crypto::LocalEncryptionKey;
use tracing::info;

use crate::directory::ParticipantRecord;
use crate::error::PreKeyError;
use crate::lifecycle::RegistrationHook;

#[derive(Debug, Clone)]
pub struct KeyDirectory {
    root: PathBuf,
}

impl KeyDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, user_id: &str, participant_id: &str) -> Result<PathBuf, PreKeyError> {
        Ok(key_path_for(&self.root, user_id, participant_id)?)
    }

    /// The stored key for this participant, or `None` if none was ever written.
    pub fn load(
        &self,
        user_id: &str,
        participant_id: &str,
    ) -> Result<Option<LocalEncryptionKey>, PreKeyError> {
        let path = self.path(user_id, participant_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(retrieve_key(&path)?))
    }

    pub fn store(
        &self,
        user_id: &str,
        participant_id: &str,
        key: &LocalEncryptionKey,
    ) -> Result<PathBuf, PreKeyError> {
        let path = self.path(user_id, participant_id)?;
        store_key(key, &path)?;
        Ok(path)
    }
}

/// Writes a freshly generated key out as soon as its participant id exists.
///
/// Registered on a pass that creates the participant, so the key is on disk
/// before any local row is sealed under it.
pub struct PersistNewKey {
    keys: KeyDirectory,
    key: LocalEncryptionKey,
}

impl PersistNewKey {
    pub fn new(keys: KeyDirectory, key: LocalEncryptionKey) -> Self {
        Self { keys, key }
    }
}

impl RegistrationHook for PersistNewKey {
    fn participant_registered(
        &self,
        user_id: &str,
        participant: &ParticipantRecord,
    ) -> Result<(), PreKeyError> {
        let path = self.keys.store(user_id, &participant.id, &self.key)?;
        info!(user_id, participant_id = %participant.id, path = %path.display(), "stored local encryption key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> ParticipantRecord {
        ParticipantRecord {
            id: id.into(),
            user_id: "u".into(),
            device_id: "dev".into(),
            pub_identity_key: String::new(),
            pub_signed_prekey: String::new(),
            signed_prekey_signature: String::new(),
        }
    }

    #[test]
    fn absent_key_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyDirectory::new(dir.path());
        assert!(keys.load("u", "1").unwrap().is_none());
    }

    #[test]
    fn registration_stores_key_under_new_participant() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyDirectory::new(dir.path().join("keys"));
        let key = LocalEncryptionKey::generate();

        PersistNewKey::new(keys.clone(), key.clone())
            .participant_registered("u", &participant("7"))
            .unwrap();

        assert_eq!(keys.load("u", "7").unwrap(), Some(key));
        assert!(keys.load("u", "8").unwrap().is_none());
        assert!(keys.path("u", "7").unwrap().starts_with(keys.root()));
    }
}
