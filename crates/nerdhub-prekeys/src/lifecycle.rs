//! Reconciliation of local prekey material with the participant directory.
//!
//! One pass walks the bundle and the onetime prekey pool through their
//! health checks, regenerating and republishing whatever is missing, stale
//! or corrupted. A pass over already-consistent state performs no writes.

use std::sync::Arc;

use nerdhub_crypto::{
    create_onetime_prekeys, create_prekey_bundle, verify_key_pair, CryptoError, KeyPair,
    PreKeyBundle, PrivateKey, PublicKey, PublicPreKeyBundle, Signature, X3dh,
};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::PoolConfig;
use crate::context::{check_all, Guard, SessionContext};
use crate::directory::{
    Directory, OnetimePreKeyUpload, ParticipantRecord, PublishBundleRequest, UploadMode,
};
use crate::error::PreKeyError;
use crate::store::{
    NewOnetimePreKey, NewPreKeyBundle, OnetimePreKeyStore, PreKeyBundleStore, StoredOnetimePreKey,
    StoredPreKeyBundle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoParticipant,
    BundleMissing,
    BundleUnverified,
    BundleCorrupted,
    BundleHealthy,
    PoolLow,
    Ready,
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// States visited, in order.
    pub states: Vec<LifecycleState>,
    pub local_writes: usize,
    pub remote_writes: usize,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.local_writes + self.remote_writes
    }

    pub fn visited(&self, state: LifecycleState) -> bool {
        self.states.contains(&state)
    }

    fn enter(&mut self, state: LifecycleState) {
        debug!(?state, "prekey lifecycle transition");
        self.states.push(state);
    }
}

/// Decrypted bundle handed to the messaging layer after a pass.
#[derive(Debug, Clone)]
pub struct PreKeySession {
    user_id: String,
    participant_id: String,
    bundle: PreKeyBundle,
}

impl PreKeySession {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn bundle(&self) -> &PreKeyBundle {
        &self.bundle
    }

    /// The halves a peer may see.
    pub fn public_bundle(&self) -> PublicPreKeyBundle {
        self.bundle.to_public()
    }

    pub fn x3dh(&self) -> X3dh {
        X3dh::new(self.bundle.to_private())
    }
}

#[derive(Debug)]
pub struct Reconciled {
    pub session: PreKeySession,
    pub report: ReconcileReport,
}

/// Runs once a pass has created a participant, before anything is sealed
/// under its id. An error aborts the pass.
pub trait RegistrationHook: Send + Sync {
    fn participant_registered(
        &self,
        user_id: &str,
        participant: &ParticipantRecord,
    ) -> Result<(), PreKeyError>;
}

pub struct PreKeyLifecycleManager {
    bundles: Arc<dyn PreKeyBundleStore>,
    onetime: Arc<dyn OnetimePreKeyStore>,
    directory: Arc<dyn Directory>,
    pool: PoolConfig,
    on_register: Option<Arc<dyn RegistrationHook>>,
}

impl PreKeyLifecycleManager {
    pub fn new(
        bundles: Arc<dyn PreKeyBundleStore>,
        onetime: Arc<dyn OnetimePreKeyStore>,
        directory: Arc<dyn Directory>,
        pool: PoolConfig,
    ) -> Self {
        Self {
            bundles,
            onetime,
            directory,
            pool,
            on_register: None,
        }
    }

    pub fn with_registration_hook(mut self, hook: Arc<dyn RegistrationHook>) -> Self {
        self.on_register = Some(hook);
        self
    }

    /// Bring local and remote prekey state to `Ready`.
    ///
    /// Must not run concurrently for the same user. Any error leaves state
    /// that the next pass repairs, so callers retry by re-running the pass.
    pub async fn reconcile(&self, ctx: &mut SessionContext) -> Result<Reconciled, PreKeyError> {
        check_all(ctx, &[Guard::Authenticated, Guard::LocalKey])?;
        let mut report = ReconcileReport::default();

        let bundle = if ctx.participant().is_none() {
            report.enter(LifecycleState::NoParticipant);
            let bundle = self.register_participant(ctx, &mut report).await?;
            self.flush_pool(ctx, &mut report).await?;
            bundle
        } else {
            ctx.bind_encryption()?;
            let bundle = self.reconcile_bundle(ctx, &mut report).await?;
            self.reconcile_pool(ctx, &mut report).await?;
            bundle
        };

        report.enter(LifecycleState::Ready);
        let participant_id = ctx.require_participant()?.id.clone();
        info!(
            user_id = ctx.user_id(),
            participant_id,
            local_writes = report.local_writes,
            remote_writes = report.remote_writes,
            "prekeys ready"
        );

        Ok(Reconciled {
            session: PreKeySession {
                user_id: ctx.user_id().to_string(),
                participant_id,
                bundle,
            },
            report,
        })
    }

    async fn register_participant(
        &self,
        ctx: &mut SessionContext,
        report: &mut ReconcileReport,
    ) -> Result<PreKeyBundle, PreKeyError> {
        let creds = ctx.credentials()?;
        let user_id = ctx.user_id().to_string();
        let bundle = create_prekey_bundle(None);

        let record = self
            .directory
            .create_participant(&creds, &user_id, &publish_request(&bundle))
            .await?;
        report.remote_writes += 1;
        let participant_id = record.id.clone();
        info!(user_id, participant_id, "created e2ee participant");

        if let Some(hook) = &self.on_register {
            hook.participant_registered(&user_id, &record)?;
        }

        // The participant id is part of the associated data, so seal only after it exists.
        ctx.set_participant(record)?;
        self.bundles
            .create_bundle(&user_id, seal_bundle(ctx, &bundle)?)
            .await?;
        report.local_writes += 1;
        self.bundles
            .mark_bundle_published(&user_id, &participant_id)
            .await?;
        report.local_writes += 1;

        let token = self.directory.fetch_access_token(&ctx.credentials()?).await?;
        ctx.set_access_token(token);
        debug!(user_id, "refreshed access token after participant creation");

        Ok(bundle)
    }

    async fn reconcile_bundle(
        &self,
        ctx: &mut SessionContext,
        report: &mut ReconcileReport,
    ) -> Result<PreKeyBundle, PreKeyError> {
        check_all(ctx, &[Guard::Participant])?;
        let user_id = ctx.user_id().to_string();

        let Some(stored) = self.bundles.find_bundle(&user_id).await? else {
            report.enter(LifecycleState::BundleMissing);
            info!(user_id, "no local prekey bundle, generating");
            let bundle = create_prekey_bundle(None);
            self.bundles
                .create_bundle(&user_id, seal_bundle(ctx, &bundle)?)
                .await?;
            report.local_writes += 1;
            self.publish_bundle(ctx, &bundle, report).await?;
            return Ok(bundle);
        };

        report.enter(LifecycleState::BundleUnverified);
        match open_bundle(ctx, &stored) {
            Ok(bundle) => {
                report.enter(LifecycleState::BundleHealthy);
                let in_sync = ctx.require_participant()?.matches(&publish_request(&bundle));
                if !stored.is_published || !in_sync {
                    info!(
                        user_id,
                        is_published = stored.is_published,
                        in_sync,
                        "republishing prekey bundle"
                    );
                    self.publish_bundle(ctx, &bundle, report).await?;
                }
                Ok(bundle)
            }
            Err(PreKeyError::LocalKeyCorruption(reason)) => {
                report.enter(LifecycleState::BundleCorrupted);
                warn!(user_id, reason, "stored prekey bundle is corrupted, regenerating");
                let bundle = create_prekey_bundle(None);
                self.bundles
                    .reset_bundle(&user_id, seal_bundle(ctx, &bundle)?)
                    .await?;
                report.local_writes += 1;
                self.publish_bundle(ctx, &bundle, report).await?;
                Ok(bundle)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish_bundle(
        &self,
        ctx: &mut SessionContext,
        bundle: &PreKeyBundle,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        let creds = ctx.credentials()?;
        let user_id = ctx.user_id().to_string();
        let participant_id = ctx.require_participant()?.id.clone();

        let record = self
            .directory
            .update_prekey_bundle(&creds, &user_id, &participant_id, &publish_request(bundle))
            .await?;
        report.remote_writes += 1;
        ctx.set_participant(record)?;

        self.bundles
            .mark_bundle_published(&user_id, &participant_id)
            .await?;
        report.local_writes += 1;
        info!(user_id, participant_id, "published prekey bundle");
        Ok(())
    }

    async fn reconcile_pool(
        &self,
        ctx: &SessionContext,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        check_all(ctx, &[Guard::Participant])?;
        let user_id = ctx.user_id();

        if let Some(latest) = self.onetime.find_latest(user_id).await? {
            match verify_onetime(ctx, &latest) {
                Ok(()) if !latest.is_published => {
                    self.publish_unpublished(ctx, report).await?;
                }
                Ok(()) => {}
                Err(PreKeyError::LocalKeyCorruption(reason)) => {
                    report.enter(LifecycleState::PoolLow);
                    warn!(
                        user_id,
                        key_id = %latest.id,
                        reason,
                        "latest onetime prekey is corrupted, flushing pool"
                    );
                    self.flush_pool(ctx, report).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let count = self.onetime.count(user_id).await?;
        if count <= self.pool.stock_threshold {
            if !report.visited(LifecycleState::PoolLow) {
                report.enter(LifecycleState::PoolLow);
            }
            info!(
                user_id,
                count,
                threshold = self.pool.stock_threshold,
                "onetime prekey stock low, replenishing"
            );
            self.replenish(ctx, UploadMode::Append, report).await?;
        }
        Ok(())
    }

    /// Drop every local onetime prekey and replace the remote set with a fresh batch.
    async fn flush_pool(
        &self,
        ctx: &SessionContext,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        let removed = self.onetime.delete_all(ctx.user_id()).await?;
        report.local_writes += 1;
        debug!(user_id = ctx.user_id(), removed, "dropped local onetime prekeys");
        self.replenish(ctx, UploadMode::Flush, report).await
    }

    async fn replenish(
        &self,
        ctx: &SessionContext,
        mode: UploadMode,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        let participant_id = ctx.require_participant()?.id.clone();
        let batch = create_onetime_prekeys(self.pool.upload_batch_size);

        let mut rows = Vec::with_capacity(batch.len());
        let mut uploads = Vec::with_capacity(batch.len());
        for key in &batch {
            rows.push(NewOnetimePreKey {
                id: key.id.clone(),
                pub_key: key.key_pair.public.as_bytes().to_vec(),
                priv_key: ctx.encryption().seal(key.key_pair.private.as_bytes())?,
                participant_id: Some(participant_id.clone()),
            });
            uploads.push(OnetimePreKeyUpload {
                id: key.id.clone(),
                pub_key: key.key_pair.public.to_base64(),
            });
        }

        let version = self.onetime.append_many(ctx.user_id(), &rows).await?;
        report.local_writes += 1;
        debug!(user_id = ctx.user_id(), count = rows.len(), version, "stored onetime prekeys");

        self.upload_onetime(ctx, &uploads, mode, report).await
    }

    async fn publish_unpublished(
        &self,
        ctx: &SessionContext,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        let pending = self.onetime.find_unpublished(ctx.user_id()).await?;
        let uploads: Vec<_> = pending
            .iter()
            .filter_map(|key| match PublicKey::from_slice(&key.pub_key) {
                Ok(public) => Some(OnetimePreKeyUpload {
                    id: key.id.clone(),
                    pub_key: public.to_base64(),
                }),
                Err(e) => {
                    warn!(key_id = %key.id, error = %e, "skipping malformed onetime prekey");
                    None
                }
            })
            .collect();
        if uploads.is_empty() {
            return Ok(());
        }
        self.upload_onetime(ctx, &uploads, UploadMode::Append, report).await
    }

    async fn upload_onetime(
        &self,
        ctx: &SessionContext,
        uploads: &[OnetimePreKeyUpload],
        mode: UploadMode,
        report: &mut ReconcileReport,
    ) -> Result<(), PreKeyError> {
        let creds = ctx.credentials()?;
        let user_id = ctx.user_id();
        let participant_id = ctx.require_participant()?.id.clone();

        let published = self
            .directory
            .create_onetime_prekeys(&creds, user_id, &participant_id, uploads, mode)
            .await?;
        report.remote_writes += 1;

        let ids: Vec<String> = uploads.iter().map(|k| k.id.clone()).collect();
        let marked = self
            .onetime
            .mark_published(user_id, &participant_id, &ids)
            .await?;
        report.local_writes += 1;
        info!(
            user_id,
            participant_id,
            count = marked,
            remote_total = published.len(),
            ?mode,
            "published onetime prekeys"
        );
        Ok(())
    }
}

fn publish_request(bundle: &PreKeyBundle) -> PublishBundleRequest {
    PublishBundleRequest::new(
        &bundle.identity_key.public,
        &bundle.signed_prekey.public,
        &bundle.signed_prekey_signature,
    )
}

fn seal_bundle(ctx: &SessionContext, bundle: &PreKeyBundle) -> Result<NewPreKeyBundle, PreKeyError> {
    let encryption = ctx.encryption();
    Ok(NewPreKeyBundle {
        pub_identity_key: bundle.identity_key.public.as_bytes().to_vec(),
        priv_identity_key: encryption.seal(bundle.identity_key.private.as_bytes())?,
        pub_signed_prekey: bundle.signed_prekey.public.as_bytes().to_vec(),
        signed_prekey_signature: bundle.signed_prekey_signature.as_bytes().to_vec(),
        priv_signed_prekey: encryption.seal(bundle.signed_prekey.private.as_bytes())?,
    })
}

/// Decrypt a stored bundle and self-test every key in it.
fn open_bundle(ctx: &SessionContext, stored: &StoredPreKeyBundle) -> Result<PreKeyBundle, PreKeyError> {
    let identity_key = open_key_pair(
        ctx,
        &stored.priv_identity_key,
        &stored.pub_identity_key,
        "identity key",
    )?;
    let signed_prekey = open_key_pair(
        ctx,
        &stored.priv_signed_prekey,
        &stored.pub_signed_prekey,
        "signed prekey",
    )?;
    let signed_prekey_signature = Signature::from_slice(&stored.signed_prekey_signature)
        .map_err(|e| corrupted("signed prekey signature", e))?;

    let bundle = PreKeyBundle {
        identity_key,
        signed_prekey,
        signed_prekey_signature,
        onetime_prekey: None,
    };
    if !bundle.verify_signature() {
        return Err(PreKeyError::LocalKeyCorruption(
            "signed prekey signature does not verify".into(),
        ));
    }
    Ok(bundle)
}

fn verify_onetime(ctx: &SessionContext, stored: &StoredOnetimePreKey) -> Result<(), PreKeyError> {
    open_key_pair(ctx, &stored.priv_key, &stored.pub_key, "onetime prekey").map(|_| ())
}

fn open_key_pair(
    ctx: &SessionContext,
    sealed: &[u8],
    public: &[u8],
    what: &str,
) -> Result<KeyPair, PreKeyError> {
    let public = PublicKey::from_slice(public).map_err(|e| corrupted(what, e))?;
    let plaintext = Zeroizing::new(ctx.encryption().open(sealed).map_err(|e| corrupted(what, e))?);
    let private = PrivateKey::from_slice(&plaintext).map_err(|e| corrupted(what, e))?;
    if !verify_key_pair(&private, &public) {
        return Err(PreKeyError::LocalKeyCorruption(format!(
            "{what} fails the key pair self-test"
        )));
    }
    Ok(KeyPair { private, public })
}

/// Missing session state stays fatal; anything else about the bytes is corruption.
fn corrupted(what: &str, err: CryptoError) -> PreKeyError {
    match err {
        CryptoError::MissingLocalEncryptionKey | CryptoError::MissingAuthContext => err.into(),
        other => PreKeyError::LocalKeyCorruption(format!("{what}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use nerdhub_crypto::LocalEncryptionKey;

    use super::*;

    fn bound_context() -> SessionContext {
        let mut ctx = SessionContext::new("u", "dev")
            .with_access_token("tok")
            .with_local_key(LocalEncryptionKey::generate());
        ctx.set_participant(ParticipantRecord {
            id: "1".into(),
            user_id: "u".into(),
            device_id: "dev".into(),
            pub_identity_key: String::new(),
            pub_signed_prekey: String::new(),
            signed_prekey_signature: String::new(),
        })
        .unwrap();
        ctx
    }

    fn stored(sealed: NewPreKeyBundle) -> StoredPreKeyBundle {
        StoredPreKeyBundle {
            user_id: "u".into(),
            pub_identity_key: sealed.pub_identity_key,
            priv_identity_key: sealed.priv_identity_key,
            pub_signed_prekey: sealed.pub_signed_prekey,
            signed_prekey_signature: sealed.signed_prekey_signature,
            priv_signed_prekey: sealed.priv_signed_prekey,
            is_published: true,
            participant_id: Some("1".into()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn sealed_bundle_opens_to_same_keys() {
        let ctx = bound_context();
        let bundle = create_prekey_bundle(None);
        let opened = open_bundle(&ctx, &stored(seal_bundle(&ctx, &bundle).unwrap())).unwrap();
        assert_eq!(opened.identity_key.public, bundle.identity_key.public);
        assert_eq!(opened.signed_prekey.public, bundle.signed_prekey.public);
        assert_eq!(
            opened.identity_key.private.as_bytes(),
            bundle.identity_key.private.as_bytes()
        );
    }

    #[test]
    fn swapped_public_key_is_corruption() {
        let ctx = bound_context();
        let bundle = create_prekey_bundle(None);
        let mut row = stored(seal_bundle(&ctx, &bundle).unwrap());
        row.pub_identity_key = KeyPair::generate().public.as_bytes().to_vec();
        assert!(matches!(
            open_bundle(&ctx, &row),
            Err(PreKeyError::LocalKeyCorruption(_))
        ));
    }

    #[test]
    fn bad_signature_is_corruption() {
        let ctx = bound_context();
        let bundle = create_prekey_bundle(None);
        let mut row = stored(seal_bundle(&ctx, &bundle).unwrap());
        row.signed_prekey_signature[0] ^= 0x01;
        assert!(matches!(
            open_bundle(&ctx, &row),
            Err(PreKeyError::LocalKeyCorruption(_))
        ));
    }

    #[test]
    fn garbage_blob_is_corruption() {
        let ctx = bound_context();
        let bundle = create_prekey_bundle(None);
        let mut row = stored(seal_bundle(&ctx, &bundle).unwrap());
        row.priv_signed_prekey = b"not json".to_vec();
        assert!(matches!(
            open_bundle(&ctx, &row),
            Err(PreKeyError::LocalKeyCorruption(_))
        ));
    }

    #[test]
    fn missing_key_is_not_corruption() {
        let err = corrupted("identity key", CryptoError::MissingLocalEncryptionKey);
        assert!(matches!(
            err,
            PreKeyError::Crypto(CryptoError::MissingLocalEncryptionKey)
        ));
    }

    #[test]
    fn report_counts_writes() {
        let mut report = ReconcileReport::default();
        report.enter(LifecycleState::BundleUnverified);
        report.local_writes = 2;
        report.remote_writes = 1;
        assert_eq!(report.writes(), 3);
        assert!(report.visited(LifecycleState::BundleUnverified));
        assert!(!report.visited(LifecycleState::PoolLow));
    }
}
