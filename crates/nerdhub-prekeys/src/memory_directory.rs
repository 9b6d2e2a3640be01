//! In-process directory used by tests and offline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::directory::{
    Credentials, Directory, OnetimePreKeyUpload, ParticipantRecord, PublishBundleRequest,
    PublishedOnetimePreKey, UploadMode,
};
use crate::error::DirectoryError;

#[derive(Default)]
struct State {
    next_id: u64,
    /// Participant per user.
    participants: HashMap<String, ParticipantRecord>,
    /// Onetime prekeys per participant id.
    onetime: HashMap<String, Vec<PublishedOnetimePreKey>>,
    writes: usize,
    offline: bool,
    reject_onetime: bool,
    tokens_issued: usize,
}

#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<State>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state-changing calls served so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn tokens_issued(&self) -> usize {
        self.state.lock().tokens_issued
    }

    pub fn participant(&self, user_id: &str) -> Option<ParticipantRecord> {
        self.state.lock().participants.get(user_id).cloned()
    }

    pub fn onetime_prekeys(&self, participant_id: &str) -> Vec<PublishedOnetimePreKey> {
        self.state
            .lock()
            .onetime
            .get(participant_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every call fail until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Make onetime prekey uploads fail while everything else keeps working.
    pub fn reject_onetime_uploads(&self, reject: bool) {
        self.state.lock().reject_onetime = reject;
    }

    /// Overwrite what the directory has on record for a user.
    pub fn replace_participant(&self, user_id: &str, record: ParticipantRecord) {
        self.state
            .lock()
            .participants
            .insert(user_id.to_string(), record);
    }
}

fn check_online(state: &State) -> Result<(), DirectoryError> {
    if state.offline {
        return Err(DirectoryError::Rejected("directory unreachable".into()));
    }
    Ok(())
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn create_participant(
        &self,
        creds: &Credentials,
        user_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError> {
        let mut state = self.state.lock();
        check_online(&state)?;
        state.next_id += 1;
        let record = ParticipantRecord {
            id: state.next_id.to_string(),
            user_id: user_id.to_string(),
            device_id: creds.device_hash.clone(),
            pub_identity_key: bundle.pub_identity_key.clone(),
            pub_signed_prekey: bundle.pub_signed_prekey.clone(),
            signed_prekey_signature: bundle.signed_prekey_signature.clone(),
        };
        state.participants.insert(user_id.to_string(), record.clone());
        state.writes += 1;
        Ok(record)
    }

    async fn update_prekey_bundle(
        &self,
        _creds: &Credentials,
        user_id: &str,
        participant_id: &str,
        bundle: &PublishBundleRequest,
    ) -> Result<ParticipantRecord, DirectoryError> {
        let mut state = self.state.lock();
        check_online(&state)?;
        let record = state
            .participants
            .get_mut(user_id)
            .filter(|p| p.id == participant_id)
            .ok_or_else(|| DirectoryError::Rejected(format!("unknown participant {participant_id}")))?;
        record.pub_identity_key.clone_from(&bundle.pub_identity_key);
        record.pub_signed_prekey.clone_from(&bundle.pub_signed_prekey);
        record
            .signed_prekey_signature
            .clone_from(&bundle.signed_prekey_signature);
        let record = record.clone();
        state.writes += 1;
        Ok(record)
    }

    async fn create_onetime_prekeys(
        &self,
        _creds: &Credentials,
        _user_id: &str,
        participant_id: &str,
        keys: &[OnetimePreKeyUpload],
        mode: UploadMode,
    ) -> Result<Vec<PublishedOnetimePreKey>, DirectoryError> {
        let mut state = self.state.lock();
        check_online(&state)?;
        if state.reject_onetime {
            return Err(DirectoryError::Rejected("onetime prekey upload refused".into()));
        }
        let set = state.onetime.entry(participant_id.to_string()).or_default();
        if mode == UploadMode::Flush {
            set.clear();
        }
        set.extend(keys.iter().map(|k| PublishedOnetimePreKey {
            id: k.id.clone(),
            pub_key: k.pub_key.clone(),
            created_at: None,
        }));
        let current = set.clone();
        state.writes += 1;
        Ok(current)
    }

    async fn fetch_access_token(&self, _creds: &Credentials) -> Result<String, DirectoryError> {
        let mut state = self.state.lock();
        check_online(&state)?;
        state.tokens_issued += 1;
        Ok(format!("token-{}", state.tokens_issued))
    }

    async fn fetch_participant(
        &self,
        creds: &Credentials,
    ) -> Result<Option<ParticipantRecord>, DirectoryError> {
        let state = self.state.lock();
        check_online(&state)?;
        Ok(state
            .participants
            .values()
            .find(|p| p.device_id == creds.device_hash)
            .cloned())
    }
}
