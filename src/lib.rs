//! GraniteDB: transaction, locking and crash-recovery core
//!
//! ## Components
//! - [`concurrency`]: lock table, wait-for graph and the
//!   [`TransactionManager`] implementing strict two-phase locking
//! - [`recovery`]: the write-ahead log and the [`RecoveryManager`]
//!   (checkpoint, rollback, redo/undo replay, startup priming)
//! - [`index`]: the capabilities the core needs from storage
//! - [`storage`]: a reference in-memory storage implementation
//! - [`handler`]: the client path tying lock, log and apply together
//!
//! ## Startup
//! 1. Prime the data directory (restore it from the recovery snapshot)
//! 2. Open storage, the transaction manager and the recovery manager
//! 3. Replay the WAL
//! 4. Checkpoint so the replayed state becomes the new snapshot

use std::path::PathBuf;
use std::sync::Arc;

use log::info;

pub mod concurrency;
pub mod error;
pub mod handler;
pub mod index;
pub mod recovery;
pub mod storage;
pub mod types;

pub use concurrency::TransactionManager;
pub use error::{GraniteError, IndexError, Result};
pub use handler::TransactionalHandler;
pub use recovery::{PrimeOutcome, RecoveryManager, RecoveryReport, SyncMode};
pub use types::{Action, ClientId, Entry, Key, LockType, Resource, TableKind, Value};

use crate::storage::MemoryDatabase;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Live database directory
    pub data_dir: PathBuf,
    /// WAL file; defaults to `<data_dir>.wal` beside the live directory
    pub wal_path: Option<PathBuf>,
    /// Appended to the live directory name to form the snapshot directory
    pub snapshot_suffix: String,
    pub sync: SyncMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_path: None,
            snapshot_suffix: "-recovery".to_string(),
            sync: SyncMode::Data,
        }
    }
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Full `fsync` (contents and metadata) on every append
    pub fn full_sync(mut self) -> Self {
        self.sync = SyncMode::Full;
        self
    }

    /// The WAL lives outside the live directory so restoring that directory
    /// from the snapshot never touches the log.
    pub fn wal_path(&self) -> PathBuf {
        match &self.wal_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self
                    .data_dir
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| "data".into());
                name.push(".wal");
                self.data_dir.with_file_name(name)
            }
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        recovery::snapshot_path(&self.data_dir, &self.snapshot_suffix)
    }
}

/// A primed, recovered engine over the reference storage
pub struct Engine {
    db: Arc<MemoryDatabase>,
    recovery: Arc<RecoveryManager>,
    handler: TransactionalHandler,
    prime_outcome: PrimeOutcome,
    report: RecoveryReport,
}

impl Engine {
    /// Prime, open, recover and checkpoint.
    pub fn open(config: &Config) -> Result<Self> {
        let prime_outcome = recovery::prime(&config.data_dir, &config.snapshot_suffix)?;

        let db = Arc::new(MemoryDatabase::open(&config.data_dir)?);
        let tm = Arc::new(TransactionManager::new());
        let recovery = Arc::new(RecoveryManager::open(db.clone(), Arc::clone(&tm), config)?);

        let report = recovery.recover()?;
        recovery.checkpoint()?;
        info!(
            "engine ready at '{}' ({:?}, {} records replayed)",
            config.data_dir.display(),
            prime_outcome,
            report.redone
        );

        let handler = TransactionalHandler::new(Arc::clone(&recovery));
        Ok(Self {
            db,
            recovery,
            handler,
            prime_outcome,
            report,
        })
    }

    pub fn handler(&self) -> &TransactionalHandler {
        &self.handler
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        self.recovery.transaction_manager()
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn prime_outcome(&self) -> PrimeOutcome {
        self.prime_outcome
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_config_derived_paths() {
        let config = Config::new("/srv/granite/data");
        assert_eq!(config.wal_path(), Path::new("/srv/granite/data.wal"));
        assert_eq!(config.snapshot_dir(), Path::new("/srv/granite/data-recovery"));

        let config = Config {
            wal_path: Some(PathBuf::from("/logs/g.wal")),
            ..Config::new("/srv/granite/data")
        }
        .full_sync();
        assert_eq!(config.wal_path(), Path::new("/logs/g.wal"));
        assert_eq!(config.sync, SyncMode::Full);
    }
}
