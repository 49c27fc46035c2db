//! Transactional handler for GraniteDB
//!
//! Every row operation follows the same order:
//! 1. Lock the row in the [`TransactionManager`] (exclusive to write, shared to read)
//! 2. Read the current image
//! 3. Append the edit to the WAL through the [`RecoveryManager`]
//! 4. Apply it to the table
//!
//! Commit logs the commit record before releasing locks; rollback undoes the
//! logged edits newest first.

use std::sync::Arc;

use log::debug;

use crate::concurrency::TransactionManager;
use crate::error::{GraniteError, IndexError, Result};
use crate::index::{Database, Index};
use crate::recovery::RecoveryManager;
use crate::types::{Action, ClientId, Key, LockType, Resource, TableKind, Value};

/// Transactional client path.
///
/// Responsibilities:
/// - Taking the row lock before touching a row (exclusive to write, shared to read)
/// - Logging every mutation to the WAL before applying it to the table
/// - Ending transactions in both managers
///
/// A `DeadlockDetected` error from any operation is returned untouched; the
/// caller is expected to [`rollback`](Self::rollback) and may retry.
pub struct TransactionalHandler {
    recovery: Arc<RecoveryManager>,
}

impl TransactionalHandler {
    pub fn new(recovery: Arc<RecoveryManager>) -> Self {
        Self { recovery }
    }

    fn tm(&self) -> &TransactionManager {
        self.recovery.transaction_manager()
    }

    fn db(&self) -> &Arc<dyn Database> {
        self.recovery.database()
    }

    pub fn begin(&self, client: ClientId) -> Result<()> {
        self.tm().begin(client)?;
        if let Err(e) = self.recovery.start(client) {
            self.tm().abort(client)?;
            return Err(e);
        }
        Ok(())
    }

    /// Create a table. Table creation is logged but not part of any transaction.
    pub fn create_table(&self, kind: TableKind, name: &str) -> Result<Arc<dyn Index>> {
        self.recovery.create_table(kind, name)
    }

    pub fn insert(&self, client: ClientId, table: &str, key: Key, value: Value) -> Result<()> {
        let index = self.lock_row(client, table, key, LockType::Exclusive)?;
        if index.find(key)?.is_some() {
            return Err(IndexError::DuplicateKey {
                table: table.to_string(),
                key,
            }
            .into());
        }
        self.recovery
            .edit(client, table, Action::Insert, key, None, Some(value))?;
        index.insert(key, value)
    }

    pub fn update(&self, client: ClientId, table: &str, key: Key, value: Value) -> Result<()> {
        let index = self.lock_row(client, table, key, LockType::Exclusive)?;
        let old = existing(&*index, table, key)?;
        self.recovery
            .edit(client, table, Action::Update, key, Some(old), Some(value))?;
        index.update(key, value)
    }

    pub fn delete(&self, client: ClientId, table: &str, key: Key) -> Result<()> {
        let index = self.lock_row(client, table, key, LockType::Exclusive)?;
        let old = existing(&*index, table, key)?;
        self.recovery
            .edit(client, table, Action::Delete, key, Some(old), None)?;
        index.delete(key)
    }

    pub fn find(&self, client: ClientId, table: &str, key: Key) -> Result<Option<Value>> {
        let index = self.lock_row(client, table, key, LockType::Shared)?;
        index.find(key)
    }

    /// Make the transaction durable, then release its locks.
    pub fn commit(&self, client: ClientId) -> Result<()> {
        if !self.tm().is_active(client) {
            return Err(GraniteError::TransactionNotFound(client));
        }
        self.recovery.commit(client)?;
        self.tm().commit(client)?;
        debug!("committed client {}", client);
        Ok(())
    }

    /// Undo the transaction's edits and release its locks.
    pub fn rollback(&self, client: ClientId) -> Result<()> {
        self.recovery.rollback(client)
    }

    fn lock_row(
        &self,
        client: ClientId,
        table: &str,
        key: Key,
        lock_type: LockType,
    ) -> Result<Arc<dyn Index>> {
        self.tm()
            .lock(client, &Resource::new(table, key), lock_type)?;
        self.db()
            .table(table)
            .ok_or_else(|| IndexError::UnknownTable(table.to_string()).into())
    }
}

fn existing(index: &dyn Index, table: &str, key: Key) -> Result<Value> {
    index.find(key)?.ok_or_else(|| {
        IndexError::KeyNotFound {
            table: table.to_string(),
            key,
        }
        .into()
    })
}
