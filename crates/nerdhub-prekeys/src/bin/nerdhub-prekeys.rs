use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nerdhub_crypto::key_container::generate_key;
use nerdhub_prekeys::device::device_hash;
use nerdhub_prekeys::{
    Config, Credentials, Directory, HttpDirectory, KeyDirectory, PersistNewKey,
    PreKeyLifecycleManager, SessionContext, SqliteStore,
};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Reconcile this device's prekeys with the participant directory.
#[derive(Parser, Debug)]
#[command(name = "nerdhub-prekeys", version)]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    user_id: String,

    #[arg(long, env = "NERDHUB_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// Create a new local encryption key if none is stored for the participant.
    #[arg(long)]
    generate_key: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(server = %config.server_url, "nerdhub-prekeys starting");

    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let remote = Url::parse(&config.server_url)?;
    let directory = Arc::new(HttpDirectory::new(&remote)?);
    let device = device_hash();

    let creds = Credentials {
        access_token: args.access_token.clone(),
        device_hash: device.clone(),
    };
    let participant = directory.fetch_participant(&creds).await?;

    let mut ctx = SessionContext::new(&args.user_id, &device)
        .with_access_token(&args.access_token)
        .with_participant(participant.clone());

    let keys = KeyDirectory::new(&config.keys_dir);
    let mut manager = PreKeyLifecycleManager::new(store.clone(), store, directory, config.prekeys);

    match &participant {
        Some(record) => match keys.load(&args.user_id, &record.id)? {
            Some(key) => ctx.set_local_key(key),
            None if args.generate_key => {
                let path = keys.path(&args.user_id, &record.id)?;
                tracing::warn!(path = %path.display(), "no local encryption key, generating a new one");
                let key = generate_key();
                keys.store(&args.user_id, &record.id, &key)?;
                ctx.set_local_key(key);
            }
            None => anyhow::bail!(
                "no local encryption key at {} (pass --generate-key to create one)",
                keys.path(&args.user_id, &record.id)?.display()
            ),
        },
        None => {
            // Written as soon as the directory assigns the participant id.
            let key = generate_key();
            ctx.set_local_key(key.clone());
            manager = manager.with_registration_hook(Arc::new(PersistNewKey::new(keys, key)));
        }
    }

    let reconciled = manager.reconcile(&mut ctx).await?;

    let report = &reconciled.report;
    tracing::info!(
        participant_id = reconciled.session.participant_id(),
        states = ?report.states,
        local_writes = report.local_writes,
        remote_writes = report.remote_writes,
        "reconciliation complete"
    );
    Ok(())
}
