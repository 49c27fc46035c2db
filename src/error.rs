//! Error types for GraniteDB
//!
//! One error enum covers the lock table, the transaction table, the WAL and
//! the storage collaborators. Lock and commit failures are returned to the
//! caller synchronously; recovery decides per error whether it is benign
//! redundancy (see [`GraniteError::is_benign_redundancy`]) or fatal.

use std::io;

use thiserror::Error;

use crate::types::{ClientId, Key, LockType, Resource};

/// Failures reported by an [`Index`](crate::index::Index) or
/// [`Database`](crate::index::Database) collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// Insert of a key that is already present
    #[error("key {key} already exists in table '{table}'")]
    DuplicateKey { table: String, key: Key },
    /// Update or delete of a key that is absent
    #[error("key {key} not found in table '{table}'")]
    KeyNotFound { table: String, key: Key },
    /// Create of a table name that is already registered
    #[error("table '{0}' already exists")]
    TableExists(String),
    /// Reference to a table the database does not know
    #[error("table '{0}' doesn't exist")]
    UnknownTable(String),
    /// Anything else the storage layer could not do
    #[error("storage error: {0}")]
    Storage(String),
}

/// Unified error type for GraniteDB operations
#[derive(Debug, Error)]
pub enum GraniteError {
    /// Begin called for a client that already has a running transaction
    #[error("transaction for client {0} already began")]
    AlreadyActive(ClientId),

    /// No running transaction for the client
    #[error("no transaction running for client {0}")]
    TransactionNotFound(ClientId),

    /// Unlock of a resource the transaction does not hold
    #[error("resource {0} could not be found")]
    ResourceNotFound(Resource),

    /// Unlock with a lock type other than the one held
    #[error("lock type mismatch on {resource}: held {held}, requested {requested}")]
    LockTypeMismatch {
        resource: Resource,
        held: LockType,
        requested: LockType,
    },

    /// Shared -> Exclusive upgrade requested; caller must unlock and re-lock
    #[error("cannot upgrade lock on {0} from shared to exclusive")]
    UpgradeNotSupported(Resource),

    /// Granting the lock would close a cycle in the wait-for graph
    #[error("deadlock detected: client {client} waiting on {resource}")]
    DeadlockDetected { client: ClientId, resource: Resource },

    /// The log or an undo stack violates the logging protocol
    #[error("malformed log: {0}")]
    MalformedLog(String),

    /// I/O failure (WAL append, fsync, snapshot copy)
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// Failure reported by the storage collaborator
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl GraniteError {
    /// True for replay failures that only mean the effect is already present
    /// (or already gone) on disk.
    pub fn is_benign_redundancy(&self) -> bool {
        matches!(
            self,
            GraniteError::Index(
                IndexError::DuplicateKey { .. }
                    | IndexError::KeyNotFound { .. }
                    | IndexError::TableExists(_)
            )
        )
    }

    /// True when the caller should abort (roll back) its transaction.
    pub fn requires_abort(&self) -> bool {
        matches!(self, GraniteError::DeadlockDetected { .. })
    }
}

impl From<bincode::Error> for GraniteError {
    fn from(e: bincode::Error) -> Self {
        GraniteError::MalformedLog(e.to_string())
    }
}

impl From<serde_json::Error> for GraniteError {
    fn from(e: serde_json::Error) -> Self {
        GraniteError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Result type alias for GraniteDB operations
pub type Result<T> = std::result::Result<T, GraniteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_redundancy_classification() {
        let dup = GraniteError::from(IndexError::DuplicateKey {
            table: "users".into(),
            key: 5,
        });
        let missing = GraniteError::from(IndexError::KeyNotFound {
            table: "users".into(),
            key: 5,
        });
        let exists = GraniteError::from(IndexError::TableExists("users".into()));
        assert!(dup.is_benign_redundancy());
        assert!(missing.is_benign_redundancy());
        assert!(exists.is_benign_redundancy());

        let unknown = GraniteError::from(IndexError::UnknownTable("users".into()));
        assert!(!unknown.is_benign_redundancy());
        assert!(!GraniteError::MalformedLog("bad".into()).is_benign_redundancy());
    }

    #[test]
    fn test_deadlock_requires_abort() {
        let err = GraniteError::DeadlockDetected {
            client: ClientId::new(),
            resource: Resource::new("users", 1),
        };
        assert!(err.requires_abort());
        assert!(!GraniteError::TransactionNotFound(ClientId::new()).requires_abort());
    }

    #[test]
    fn test_error_messages() {
        let err = GraniteError::LockTypeMismatch {
            resource: Resource::new("users", 7),
            held: LockType::Shared,
            requested: LockType::Exclusive,
        };
        assert_eq!(
            err.to_string(),
            "lock type mismatch on users:7: held shared, requested exclusive"
        );

        let err = GraniteError::from(IndexError::UnknownTable("orders".into()));
        assert_eq!(err.to_string(), "table 'orders' doesn't exist");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err: GraniteError = io_err.into();
        assert!(matches!(err, GraniteError::Io(_)));
    }
}
