//! Write-ahead logging, checkpointing and crash recovery

pub mod log;
pub mod manager;
pub mod prime;
pub mod wal;

pub use self::log::{EditLog, LogRecord};
pub use manager::{RecoveryManager, RecoveryReport, CHECKPOINT_MARKER};
pub use prime::{prime, publish_snapshot, snapshot_path, PrimeOutcome};
pub use wal::{SyncMode, WalReader, WalScan, WalWriter};
