//! Recovery Manager for GraniteDB
//!
//! ### Write-ahead discipline
//! Every catalog or row mutation is appended to the WAL (and synced) before it
//! is applied to its index. One mutex guards both the append and the
//! per-transaction undo stacks, so the file order is the logical order.
//!
//! ### Checkpoint
//! 1. Under the WAL mutex, freeze updates on every table's pager. Tables are
//!    created under the same mutex, so the set frozen matches the log
//! 2. Flush all pages
//! 3. Append a checkpoint record listing the active transactions, and record
//!    its ordinal in `checkpoint.json` inside the live directory
//! 4. Unfreeze
//! 5. Publish a copy of the live directory as the recovery snapshot
//!
//! ### Recovery
//! 1. Find the checkpoint the on-disk state corresponds to (`checkpoint.json`)
//! 2. Replay every table record logged before the redo start point
//! 3. Redo table and edit records from the earlier of that checkpoint and the
//!    first record of any transaction active at it, tolerating effects that
//!    are already present
//! 4. Undo, newest first, every edit of transactions that never committed,
//!    logging each inverse as a compensation record, then log their commit

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::log::{EditLog, LogRecord};
use super::prime;
use super::wal::{WalReader, WalWriter};
use crate::concurrency::TransactionManager;
use crate::error::{GraniteError, IndexError, Result};
use crate::index::{Database, Index, Pager};
use crate::types::{Action, ClientId, Key, TableKind, Value};
use crate::Config;

/// File in the live directory naming the checkpoint its contents reflect
pub const CHECKPOINT_MARKER: &str = "checkpoint.json";

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointMarker {
    /// 1-based ordinal of the checkpoint record among all checkpoint records
    checkpoint: u64,
}

/// Counters reported by [`RecoveryManager::recover`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    /// Index of the first record redo looked at
    pub redo_from: usize,
    pub redone: usize,
    /// Redo or undo steps whose effect was already present
    pub skipped: usize,
    pub undone_transactions: Vec<ClientId>,
    pub compensated_edits: usize,
}

struct WalState {
    writer: WalWriter,
    /// Records logged by each running transaction since its start record
    tx_stacks: HashMap<ClientId, Vec<LogRecord>>,
    checkpoints: u64,
}

/// The Recovery Manager
pub struct RecoveryManager {
    db: Arc<dyn Database>,
    tm: Arc<TransactionManager>,
    wal_path: PathBuf,
    snapshot_dir: PathBuf,
    wal: Mutex<WalState>,
    checkpointing: Mutex<()>,
}

impl RecoveryManager {
    /// Open the WAL named by `config` for appending.
    pub fn open(
        db: Arc<dyn Database>,
        tm: Arc<TransactionManager>,
        config: &Config,
    ) -> Result<Self> {
        let wal_path = config.wal_path();
        let checkpoints = WalReader::read_all(&wal_path)?
            .iter()
            .filter(|r| matches!(r, LogRecord::Checkpoint { .. }))
            .count() as u64;
        let writer = WalWriter::open(&wal_path, config.sync)?;

        Ok(Self {
            db,
            tm,
            wal_path,
            snapshot_dir: config.snapshot_dir(),
            wal: Mutex::new(WalState {
                writer,
                tx_stacks: HashMap::new(),
                checkpoints,
            }),
            checkpointing: Mutex::new(()),
        })
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Log a table creation.
    pub fn table(&self, kind: TableKind, name: &str) -> Result<()> {
        self.append(&LogRecord::Table {
            kind,
            name: name.to_string(),
        })
    }

    /// Log a table creation and create the table before anything else can
    /// reach the log, so no checkpoint falls between the two.
    pub fn create_table(&self, kind: TableKind, name: &str) -> Result<Arc<dyn Index>> {
        let mut wal = self.wal.lock();
        if self.db.table(name).is_some() {
            return Err(IndexError::TableExists(name.to_string()).into());
        }
        wal.writer.append(&LogRecord::Table {
            kind,
            name: name.to_string(),
        })?;
        self.db.create_table(kind, name)
    }

    /// Log a row mutation and push it on the client's undo stack.
    pub fn edit(
        &self,
        client: ClientId,
        table: &str,
        action: Action,
        key: Key,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<()> {
        self.log_edit(EditLog {
            client,
            table: table.to_string(),
            action,
            key,
            old,
            new,
        })
    }

    pub fn log_edit(&self, edit: EditLog) -> Result<()> {
        let client = edit.client;
        let record = LogRecord::Edit(edit);
        let mut wal = self.wal.lock();
        wal.writer.append(&record)?;
        wal.tx_stacks.entry(client).or_default().push(record);
        Ok(())
    }

    /// Log a transaction start; the undo stack restarts from it.
    pub fn start(&self, client: ClientId) -> Result<()> {
        let record = LogRecord::Start { client };
        let mut wal = self.wal.lock();
        wal.writer.append(&record)?;
        wal.tx_stacks.insert(client, vec![record]);
        Ok(())
    }

    /// Log a commit. Once this returns the transaction is durable.
    pub fn commit(&self, client: ClientId) -> Result<()> {
        let mut wal = self.wal.lock();
        wal.writer.append(&LogRecord::Commit { client })?;
        wal.tx_stacks.remove(&client);
        Ok(())
    }

    fn append(&self, record: &LogRecord) -> Result<()> {
        self.wal.lock().writer.append(record)?;
        Ok(())
    }

    /// Flush every table, log a checkpoint and publish the recovery snapshot.
    pub fn checkpoint(&self) -> Result<()> {
        let _checkpointing = self.checkpointing.lock();

        let active = {
            let mut wal = self.wal.lock();
            let pagers = distinct_pagers(&self.db.tables());
            for pager in &pagers {
                pager.lock_all_updates();
            }
            let result = self.flush_and_log(&mut wal, &pagers);
            for pager in &pagers {
                pager.unlock_all_updates();
            }
            result?
        };

        self.publish_snapshot()?;
        info!("checkpoint complete ({} active transactions)", active);
        Ok(())
    }

    /// Steps run while updates are frozen. Returns the number of active transactions.
    fn flush_and_log(&self, wal: &mut WalState, pagers: &[Arc<dyn Pager>]) -> Result<usize> {
        for pager in pagers {
            pager.flush_all_pages()?;
        }

        let mut active: Vec<ClientId> = wal.tx_stacks.keys().copied().collect();
        active.sort();
        let count = active.len();
        wal.writer.append(&LogRecord::Checkpoint { active })?;
        wal.checkpoints += 1;
        write_marker(self.db.base_path(), wal.checkpoints)?;
        Ok(count)
    }

    /// Replace the recovery snapshot with a copy of the live directory.
    pub fn publish_snapshot(&self) -> Result<()> {
        prime::publish_snapshot(self.db.base_path(), &self.snapshot_dir)
    }

    /// Undo every edit of `client` newest first, then end the transaction.
    pub fn rollback(&self, client: ClientId) -> Result<()> {
        let stack = self
            .wal
            .lock()
            .tx_stacks
            .get(&client)
            .cloned()
            .unwrap_or_default();

        if let Some(first) = stack.first() {
            if !matches!(first, LogRecord::Start { .. }) {
                return Err(GraniteError::MalformedLog(format!(
                    "undo stack for client {} begins with a {} record",
                    client,
                    first.kind_name()
                )));
            }
            let mut undone = 0;
            for record in stack.iter().rev() {
                if let LogRecord::Edit(edit) = record {
                    self.compensate(edit)?;
                    undone += 1;
                }
            }
            debug!("rolled back {} edits for client {}", undone, client);
        }

        self.commit(client)?;
        if self.tm.is_active(client) {
            self.tm.abort(client)?;
        }
        Ok(())
    }

    /// Log the inverse of `edit`, then apply it.
    fn compensate(&self, edit: &EditLog) -> Result<bool> {
        let inverse = edit.inverse();
        self.append(&LogRecord::Edit(inverse.clone()))?;
        self.apply_edit(&inverse)
    }

    /// Reapply a logged table creation or edit. Effects already present are
    /// tolerated, so replaying a record twice is harmless.
    pub fn redo(&self, record: &LogRecord) -> Result<()> {
        self.apply_redo(record).map(|_| ())
    }

    /// Apply the inverse of a logged edit.
    pub fn undo(&self, record: &LogRecord) -> Result<()> {
        match record {
            LogRecord::Edit(edit) => self.apply_edit(&edit.inverse()).map(|_| ()),
            other => Err(GraniteError::MalformedLog(format!(
                "cannot undo a {} record",
                other.kind_name()
            ))),
        }
    }

    /// Ok(false) when the record's effect was already present.
    fn apply_redo(&self, record: &LogRecord) -> Result<bool> {
        match record {
            LogRecord::Table { kind, name } => tolerate(self.db.create_table(*kind, name).map(|_| ())),
            LogRecord::Edit(edit) => self.apply_edit(edit),
            other => Err(GraniteError::MalformedLog(format!(
                "cannot redo a {} record",
                other.kind_name()
            ))),
        }
    }

    /// Apply an edit tolerantly: insert over an existing key updates it,
    /// update of a missing key inserts it, delete of a missing key is a no-op.
    fn apply_edit(&self, edit: &EditLog) -> Result<bool> {
        let index = self
            .db
            .table(&edit.table)
            .ok_or_else(|| IndexError::UnknownTable(edit.table.clone()))?;

        match edit.action {
            Action::Insert => {
                let value = image(edit, edit.new, "new")?;
                match index.insert(edit.key, value) {
                    Err(GraniteError::Index(IndexError::DuplicateKey { .. })) => {
                        tolerate(index.update(edit.key, value))
                    }
                    other => tolerate(other),
                }
            }
            Action::Update => {
                let value = image(edit, edit.new, "new")?;
                match index.update(edit.key, value) {
                    Err(GraniteError::Index(IndexError::KeyNotFound { .. })) => {
                        tolerate(index.insert(edit.key, value))
                    }
                    other => tolerate(other),
                }
            }
            Action::Delete => tolerate(index.delete(edit.key)),
        }
    }

    /// Replay the WAL against the database.
    ///
    /// Run after [`prime`](super::prime::prime) and before serving clients.
    /// Every transaction found unfinished is undone and logged as finished;
    /// callers should checkpoint afterwards.
    pub fn recover(&self) -> Result<RecoveryReport> {
        info!("starting recovery from '{}'", self.wal_path.display());
        let records = WalReader::read_all(&self.wal_path)?;
        let mut report = RecoveryReport {
            records_scanned: records.len(),
            ..Default::default()
        };

        let checkpoint = self.trusted_checkpoint(&records)?;
        let (scan_from, mut active) = match checkpoint {
            Some(pos) => match &records[pos] {
                LogRecord::Checkpoint { active } => {
                    (pos + 1, active.iter().copied().collect::<HashSet<_>>())
                }
                _ => (0, HashSet::new()),
            },
            None => (0, HashSet::new()),
        };

        // edits of transactions active at the checkpoint may have been
        // logged before it without reaching the flushed pages
        report.redo_from = match checkpoint {
            Some(pos) => earliest_start(&records[..pos], &active).unwrap_or(pos),
            None => 0,
        };

        // a table logged before the checkpoint may still be missing from the
        // flushed catalog
        for record in records[..report.redo_from]
            .iter()
            .filter(|r| matches!(r, LogRecord::Table { .. }))
        {
            if self.apply_redo(record)? {
                report.redone += 1;
            } else {
                report.skipped += 1;
            }
        }

        for (pos, record) in records.iter().enumerate().skip(report.redo_from) {
            match record {
                LogRecord::Table { .. } | LogRecord::Edit(_) => {
                    if self.apply_redo(record)? {
                        report.redone += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                LogRecord::Start { client } if pos >= scan_from => {
                    active.insert(*client);
                }
                LogRecord::Commit { client } if pos >= scan_from => {
                    active.remove(client);
                }
                _ => {}
            }
        }
        debug!(
            "redo applied {} records ({} already present) from record {}",
            report.redone, report.skipped, report.redo_from
        );

        let mut unfinished = active.clone();
        for record in records.iter().rev() {
            if unfinished.is_empty() {
                break;
            }
            match record {
                LogRecord::Edit(edit) if unfinished.contains(&edit.client) => {
                    if !self.compensate(edit)? {
                        report.skipped += 1;
                    }
                    report.compensated_edits += 1;
                }
                LogRecord::Start { client } => {
                    unfinished.remove(client);
                }
                _ => {}
            }
        }

        let mut undone: Vec<ClientId> = active.into_iter().collect();
        undone.sort();
        for &client in &undone {
            self.commit(client)?;
        }
        report.undone_transactions = undone;

        info!(
            "recovery complete: {} records scanned, {} redone, {} undone transactions",
            report.records_scanned,
            report.redone,
            report.undone_transactions.len()
        );
        Ok(report)
    }

    /// Position of the checkpoint record the live directory reflects.
    fn trusted_checkpoint(&self, records: &[LogRecord]) -> Result<Option<usize>> {
        let ordinal = match read_marker(self.db.base_path())? {
            Some(n) => n,
            None => return Ok(None),
        };
        let position = records
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, LogRecord::Checkpoint { .. }))
            .nth(ordinal.saturating_sub(1) as usize)
            .map(|(pos, _)| pos);
        if position.is_none() {
            warn!(
                "checkpoint {} not found in WAL, replaying from the beginning",
                ordinal
            );
        }
        Ok(position)
    }

    /// Copy of the records logged by `client` since its start record
    pub fn undo_stack(&self, client: ClientId) -> Vec<LogRecord> {
        self.wal
            .lock()
            .tx_stacks
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    /// Clients with a start record and no commit yet
    pub fn active_transactions(&self) -> Vec<ClientId> {
        let mut active: Vec<ClientId> = self.wal.lock().tx_stacks.keys().copied().collect();
        active.sort();
        active
    }
}

/// Ok(true) if applied, Ok(false) if the error only means the effect is
/// already there.
fn tolerate(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_benign_redundancy() => {
            warn!("skipping redundant replay: {}", e);
            Ok(false)
        }
        Err(e) => {
            error!("replay failed: {}", e);
            Err(e)
        }
    }
}

fn image(edit: &EditLog, value: Option<Value>, which: &str) -> Result<Value> {
    value.ok_or_else(|| {
        GraniteError::MalformedLog(format!(
            "{} edit of {}:{} has no {} value",
            edit.action, edit.table, edit.key, which
        ))
    })
}

/// Earliest start record, within `records`, of any client in `active`
fn earliest_start(records: &[LogRecord], active: &HashSet<ClientId>) -> Option<usize> {
    let mut missing = active.clone();
    let mut earliest = None;
    for (pos, record) in records.iter().enumerate().rev() {
        if missing.is_empty() {
            break;
        }
        if let LogRecord::Start { client } = record {
            if missing.remove(client) {
                earliest = Some(pos);
            }
        }
    }
    earliest
}

/// Tables can share a pager; freeze and flush each one once.
fn distinct_pagers(tables: &[Arc<dyn Index>]) -> Vec<Arc<dyn Pager>> {
    let mut pagers: Vec<Arc<dyn Pager>> = Vec::new();
    for table in tables {
        let pager = table.pager();
        if !pagers.iter().any(|p| Arc::ptr_eq(p, &pager)) {
            pagers.push(pager);
        }
    }
    pagers
}

fn write_marker(dir: &Path, checkpoint: u64) -> Result<()> {
    let bytes = serde_json::to_vec(&CheckpointMarker { checkpoint })?;
    let mut file = File::create(dir.join(CHECKPOINT_MARKER))?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

fn read_marker(dir: &Path) -> Result<Option<u64>> {
    let path = dir.join(CHECKPOINT_MARKER);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)?;
    match serde_json::from_str::<CheckpointMarker>(&contents) {
        Ok(marker) => Ok(Some(marker.checkpoint)),
        Err(e) => {
            warn!("unreadable checkpoint marker '{}': {}", path.display(), e);
            Ok(None)
        }
    }
}
