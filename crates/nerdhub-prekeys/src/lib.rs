pub mod config;
pub mod context;
pub mod device;
pub mod directory;
pub mod error;
pub mod http_directory;
pub mod lifecycle;
pub mod local_keys;
pub mod memory_directory;
pub mod memory_store;
pub mod sqlite_store;
pub mod store;

pub use config::{Config, PoolConfig};
pub use context::{check_all, Guard, SessionContext};
pub use directory::{Credentials, Directory, ParticipantRecord, UploadMode};
pub use error::{DirectoryError, PreKeyError};
pub use http_directory::HttpDirectory;
pub use lifecycle::{
    LifecycleState, PreKeyLifecycleManager, PreKeySession, ReconcileReport, Reconciled,
    RegistrationHook,
};
pub use local_keys::{KeyDirectory, PersistNewKey};
pub use memory_directory::MemoryDirectory;
pub use memory_store::{MemoryOnetimePreKeyStore, MemoryPreKeyBundleStore};
pub use sqlite_store::SqliteStore;
pub use store::{OnetimePreKeyStore, PreKeyBundleStore};
