//! Caller-owned session state and the guards run before each lifecycle step.

use nerdhub_crypto::{CryptoError, LocalEncryptionContext, LocalEncryptionKey};

use crate::directory::{Credentials, ParticipantRecord};
use crate::error::PreKeyError;

/// Everything a reconciliation pass needs to know about the signed-in device.
#[derive(Debug)]
pub struct SessionContext {
    user_id: String,
    device_hash: String,
    access_token: Option<String>,
    participant: Option<ParticipantRecord>,
    encryption: LocalEncryptionContext,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, device_hash: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_hash: device_hash.into(),
            access_token: None,
            participant: None,
            encryption: LocalEncryptionContext::default(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_local_key(mut self, key: LocalEncryptionKey) -> Self {
        self.encryption.set_key(key);
        self
    }

    pub fn with_participant(mut self, participant: Option<ParticipantRecord>) -> Self {
        self.participant = participant;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_hash(&self) -> &str {
        &self.device_hash
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn set_access_token(&mut self, token: String) {
        self.access_token = Some(token);
    }

    pub fn participant(&self) -> Option<&ParticipantRecord> {
        self.participant.as_ref()
    }

    /// Replace the participant record and rebind the encryption context to it.
    pub fn set_participant(&mut self, participant: ParticipantRecord) -> Result<(), PreKeyError> {
        self.encryption.bind(&self.user_id, &participant.id)?;
        self.participant = Some(participant);
        Ok(())
    }

    pub fn set_local_key(&mut self, key: LocalEncryptionKey) {
        self.encryption.set_key(key);
    }

    pub fn encryption(&self) -> &LocalEncryptionContext {
        &self.encryption
    }

    /// Bind the encryption context to the current participant.
    pub fn bind_encryption(&mut self) -> Result<(), PreKeyError> {
        let participant_id = self
            .participant
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or(PreKeyError::MissingAuthContext("no e2ee participant"))?;
        self.encryption.bind(&self.user_id, &participant_id)?;
        Ok(())
    }

    pub fn credentials(&self) -> Result<Credentials, PreKeyError> {
        Guard::Authenticated.check(self)?;
        Ok(Credentials {
            access_token: self.access_token.clone().unwrap_or_default(),
            device_hash: self.device_hash.clone(),
        })
    }

    pub fn require_participant(&self) -> Result<&ParticipantRecord, PreKeyError> {
        self.participant
            .as_ref()
            .ok_or(PreKeyError::MissingAuthContext("no e2ee participant"))
    }
}

/// Preconditions checked at the start of a lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// A user id, a device hash and an access token are present.
    Authenticated,
    /// A local encryption key is loaded.
    LocalKey,
    /// A participant record exists.
    Participant,
}

impl Guard {
    pub fn check(self, ctx: &SessionContext) -> Result<(), PreKeyError> {
        match self {
            Guard::Authenticated => {
                if ctx.user_id.is_empty() {
                    return Err(PreKeyError::MissingAuthContext("no user id"));
                }
                if ctx.device_hash.is_empty() {
                    return Err(PreKeyError::MissingAuthContext("no device hash"));
                }
                if ctx.access_token.as_deref().unwrap_or_default().is_empty() {
                    return Err(PreKeyError::MissingAuthContext("no access token"));
                }
                Ok(())
            }
            Guard::LocalKey => {
                if ctx.encryption.has_key() {
                    Ok(())
                } else {
                    Err(CryptoError::MissingLocalEncryptionKey.into())
                }
            }
            Guard::Participant => ctx.require_participant().map(|_| ()),
        }
    }
}

/// Run `guards` in order, stopping at the first failure.
pub fn check_all(ctx: &SessionContext, guards: &[Guard]) -> Result<(), PreKeyError> {
    guards.iter().try_for_each(|guard| guard.check(ctx))
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
    fn guards_report_first_missing_piece() {
        let ctx = SessionContext::new("u", "dev");
        assert!(matches!(
            check_all(&ctx, &[Guard::Authenticated, Guard::LocalKey]),
            Err(PreKeyError::MissingAuthContext("no access token"))
        ));

        let ctx = ctx.with_access_token("tok");
        assert!(matches!(
            check_all(&ctx, &[Guard::Authenticated, Guard::LocalKey]),
            Err(PreKeyError::Crypto(CryptoError::MissingLocalEncryptionKey))
        ));

        let ctx = ctx.with_local_key(LocalEncryptionKey::generate());
        check_all(&ctx, &[Guard::Authenticated, Guard::LocalKey]).unwrap();
        assert!(Guard::Participant.check(&ctx).is_err());
    }

    #[test]
    fn empty_user_id_is_unauthenticated() {
        let ctx = SessionContext::new("", "dev").with_access_token("tok");
        assert!(matches!(
            Guard::Authenticated.check(&ctx),
            Err(PreKeyError::MissingAuthContext("no user id"))
        ));
    }

    #[test]
    fn setting_participant_binds_encryption() {
        let mut ctx = SessionContext::new("u", "dev")
            .with_access_token("tok")
            .with_local_key(LocalEncryptionKey::generate());
        assert!(ctx.encryption().associated_data().is_none());

        ctx.set_participant(participant("7")).unwrap();
        let first = ctx.encryption().associated_data().cloned();
        assert!(first.is_some());

        ctx.set_participant(participant("8")).unwrap();
        assert_ne!(ctx.encryption().associated_data().cloned(), first);
    }

    #[test]
    fn credentials_require_token() {
        let ctx = SessionContext::new("u", "dev");
        assert!(ctx.credentials().is_err());

        let creds = ctx.with_access_token("tok").credentials().unwrap();
        assert_eq!(creds.access_token, "tok");
        assert_eq!(creds.device_hash, "dev");
    }
}
