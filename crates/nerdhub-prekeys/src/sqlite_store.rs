use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::PreKeyError;
use crate::store::{
    timestamp_now, CasOutcome, NewOnetimePreKey, NewPreKeyBundle, OnetimePreKeyStore,
    PreKeyBundleStore, StoredOnetimePreKey, StoredPreKeyBundle,
};

/// Local schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS e2ee_participant_prekey_bundles (
    user_id TEXT NOT NULL PRIMARY KEY,
    pub_identity_key BLOB NOT NULL,
    priv_identity_key BLOB NOT NULL,
    pub_signed_prekey BLOB NOT NULL,
    signed_prekey_signature BLOB NOT NULL,
    priv_signed_prekey BLOB NOT NULL,
    is_published INTEGER NOT NULL DEFAULT 0,
    participant_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS e2ee_participant_onetime_prekeys (
    id TEXT NOT NULL PRIMARY KEY,
    user_id TEXT NOT NULL,
    pub_key BLOB NOT NULL,
    priv_key BLOB NOT NULL,
    is_published INTEGER NOT NULL DEFAULT 0,
    participant_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_onetime_prekeys_published
    ON e2ee_participant_onetime_prekeys(user_id, is_published);

CREATE INDEX IF NOT EXISTS idx_onetime_prekeys_created
    ON e2ee_participant_onetime_prekeys(user_id, created_at);

-- Version token per user for conditional appends
CREATE TABLE IF NOT EXISTS e2ee_onetime_prekey_versions (
    user_id TEXT NOT NULL PRIMARY KEY,
    version INTEGER NOT NULL
);
";

/// SQLite-backed store for both the bundle row and the onetime prekey pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self, PreKeyError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PreKeyError::Storage(format!("failed to create db dir: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| PreKeyError::Storage(format!("failed to open db: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| PreKeyError::Storage(format!("failed to set WAL mode: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PreKeyError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PreKeyError::Storage(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, PreKeyError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, PreKeyError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PreKeyError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| PreKeyError::Storage(format!("database task failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> Result<(), PreKeyError> {
    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != SCHEMA_VERSION {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SCHEMA_VERSION,
                "local schema version mismatch, recreating"
            );
            drop_all_tables(conn)?;
        }
        conn.execute_batch(SCHEMA)
            .map_err(|e| PreKeyError::Storage(format!("failed to run schema: {e}")))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| PreKeyError::Storage(format!("failed to set schema version: {e}")))?;
    }
    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<(), PreKeyError> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }
    Ok(())
}

fn bundle_from_row(row: &Row<'_>) -> rusqlite::Result<StoredPreKeyBundle> {
    Ok(StoredPreKeyBundle {
        user_id: row.get("user_id")?,
        pub_identity_key: row.get("pub_identity_key")?,
        priv_identity_key: row.get("priv_identity_key")?,
        pub_signed_prekey: row.get("pub_signed_prekey")?,
        signed_prekey_signature: row.get("signed_prekey_signature")?,
        priv_signed_prekey: row.get("priv_signed_prekey")?,
        is_published: row.get("is_published")?,
        participant_id: row.get("participant_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn onetime_from_row(row: &Row<'_>) -> rusqlite::Result<StoredOnetimePreKey> {
    Ok(StoredOnetimePreKey {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        pub_key: row.get("pub_key")?,
        priv_key: row.get("priv_key")?,
        is_published: row.get("is_published")?,
        participant_id: row.get("participant_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn read_version(conn: &Connection, user_id: &str) -> Result<u64, PreKeyError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM e2ee_onetime_prekey_versions WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
}

fn write_version(conn: &Connection, user_id: &str, version: u64) -> Result<(), PreKeyError> {
    let version = i64::try_from(version)
        .map_err(|_| PreKeyError::Storage("onetime prekey version overflow".into()))?;
    conn.execute(
        "INSERT INTO e2ee_onetime_prekey_versions (user_id, version) VALUES (?1, ?2)
         ON CONFLICT(user_id) DO UPDATE SET version = excluded.version",
        params![user_id, version],
    )?;
    Ok(())
}

#[async_trait]
impl PreKeyBundleStore for SqliteStore {
    async fn find_bundle(&self, user_id: &str) -> Result<Option<StoredPreKeyBundle>, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT * FROM e2ee_participant_prekey_bundles WHERE user_id = ?1",
                    [&user_id],
                    bundle_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn create_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO e2ee_participant_prekey_bundles (
                    user_id, pub_identity_key, priv_identity_key, pub_signed_prekey,
                    signed_prekey_signature, priv_signed_prekey, is_published,
                    participant_id, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7, ?7)",
                params![
                    user_id,
                    bundle.pub_identity_key,
                    bundle.priv_identity_key,
                    bundle.pub_signed_prekey,
                    bundle.signed_prekey_signature,
                    bundle.priv_signed_prekey,
                    timestamp_now(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn reset_bundle(&self, user_id: &str, bundle: NewPreKeyBundle) -> Result<(), PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE e2ee_participant_prekey_bundles
                 SET pub_identity_key = ?2, priv_identity_key = ?3, pub_signed_prekey = ?4,
                     signed_prekey_signature = ?5, priv_signed_prekey = ?6,
                     is_published = 0, updated_at = ?7
                 WHERE user_id = ?1",
                params![
                    user_id,
                    bundle.pub_identity_key,
                    bundle.priv_identity_key,
                    bundle.pub_signed_prekey,
                    bundle.signed_prekey_signature,
                    bundle.priv_signed_prekey,
                    timestamp_now(),
                ],
            )?;
            if changed == 0 {
                return Err(PreKeyError::Storage(format!("no prekey bundle for user {user_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn mark_bundle_published(&self, user_id: &str, participant_id: &str) -> Result<(), PreKeyError> {
        let user_id = user_id.to_string();
        let participant_id = participant_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE e2ee_participant_prekey_bundles
                 SET is_published = 1, participant_id = ?2, updated_at = ?3
                 WHERE user_id = ?1",
                params![user_id, participant_id, timestamp_now()],
            )?;
            if changed == 0 {
                return Err(PreKeyError::Storage(format!("no prekey bundle for user {user_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn delete_bundle(&self, user_id: &str) -> Result<(), PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM e2ee_participant_prekey_bundles WHERE user_id = ?1",
                [&user_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl OnetimePreKeyStore for SqliteStore {
    async fn find_latest(&self, user_id: &str) -> Result<Option<StoredOnetimePreKey>, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT * FROM e2ee_participant_onetime_prekeys
                     WHERE user_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1",
                    [&user_id],
                    onetime_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn find_unpublished(&self, user_id: &str) -> Result<Vec<StoredOnetimePreKey>, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM e2ee_participant_onetime_prekeys
                 WHERE user_id = ?1 AND is_published = 0
                 ORDER BY created_at, rowid",
            )?;
            let rows = stmt
                .query_map([&user_id], onetime_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count(&self, user_id: &str) -> Result<usize, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(id) FROM e2ee_participant_onetime_prekeys WHERE user_id = ?1",
                [&user_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn version(&self, user_id: &str) -> Result<u64, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| read_version(conn, &user_id)).await
    }

    async fn compare_and_append(
        &self,
        user_id: &str,
        expected_version: u64,
        keys: &[NewOnetimePreKey],
    ) -> Result<CasOutcome, PreKeyError> {
        let user_id = user_id.to_string();
        let keys = keys.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;

            let current = read_version(&tx, &user_id)?;
            if current != expected_version {
                return Ok(CasOutcome::Conflict { current });
            }

            let now = timestamp_now();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO e2ee_participant_onetime_prekeys
                        (id, user_id, pub_key, priv_key, is_published, participant_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
                )?;
                for key in &keys {
                    stmt.execute(params![
                        key.id,
                        user_id,
                        key.pub_key,
                        key.priv_key,
                        key.participant_id,
                        now
                    ])?;
                }
            }

            let version = current + 1;
            write_version(&tx, &user_id, version)?;
            tx.commit()?;
            Ok(CasOutcome::Applied { version })
        })
        .await
    }

    async fn delete_all(&self, user_id: &str) -> Result<usize, PreKeyError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM e2ee_participant_onetime_prekeys WHERE user_id = ?1",
                [&user_id],
            )?;
            let version = read_version(&tx, &user_id)? + 1;
            write_version(&tx, &user_id, version)?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn mark_published(
        &self,
        user_id: &str,
        participant_id: &str,
        ids: &[String],
    ) -> Result<usize, PreKeyError> {
        let user_id = user_id.to_string();
        let participant_id = participant_id.to_string();
        let ids = ids.to_vec();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let now = timestamp_now();
            let mut marked = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE e2ee_participant_onetime_prekeys
                     SET is_published = 1, participant_id = ?3, updated_at = ?4
                     WHERE user_id = ?1 AND id = ?2",
                )?;
                for id in &ids {
                    marked += stmt.execute(params![user_id, id, participant_id, now])?;
                }
            }
            tx.commit()?;
            Ok(marked)
        })
        .await
    }
}
