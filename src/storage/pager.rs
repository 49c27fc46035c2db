//! File pager for the reference tables
//!
//! Each table has one pager. Rows live in memory and reach disk only when the
//! pager is flushed; the table file is rewritten in full through a temporary
//! file and a rename, so a crash leaves either the old or the new contents.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::Result;
use crate::index::Pager;
use crate::types::{Entry, Key, Value};

#[derive(Debug, Default)]
struct GateState {
    in_flight: usize,
    frozen: bool,
}

/// Admission gate for table mutations.
///
/// Mutations pass through [`enter`](Self::enter); [`freeze`](Self::freeze)
/// closes the gate and waits for the mutations already inside to leave.
#[derive(Debug, Default)]
pub struct UpdateGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Held for the duration of one mutation
pub struct GateGuard<'a> {
    gate: &'a UpdateGate,
}

impl UpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait while frozen, then register a mutation.
    pub fn enter(&self) -> GateGuard<'_> {
        let mut state = self.state.lock();
        while state.frozen {
            self.changed.wait(&mut state);
        }
        state.in_flight += 1;
        GateGuard { gate: self }
    }

    /// Close the gate and wait until no mutation is in flight.
    pub fn freeze(&self) {
        let mut state = self.state.lock();
        while state.frozen {
            self.changed.wait(&mut state);
        }
        state.frozen = true;
        while state.in_flight > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn thaw(&self) {
        let mut state = self.state.lock();
        state.frozen = false;
        self.changed.notify_all();
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.changed.notify_all();
        }
    }
}

/// In-memory rows of one table, shared by the table and its pager
#[derive(Debug)]
pub(crate) struct TableStore {
    pub(crate) name: String,
    pub(crate) rows: RwLock<std::collections::BTreeMap<Key, Value>>,
    dirty: AtomicBool,
}

impl TableStore {
    pub(crate) fn new(name: String, rows: std::collections::BTreeMap<Key, Value>, dirty: bool) -> Self {
        Self {
            name,
            rows: RwLock::new(rows),
            dirty: AtomicBool::new(dirty),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// Pager writing a table's rows to `<name>.table` as JSON lines
#[derive(Debug)]
pub struct FilePager {
    path: PathBuf,
    store: Arc<TableStore>,
    gate: UpdateGate,
}

impl FilePager {
    pub(crate) fn new(path: PathBuf, store: Arc<TableStore>) -> Self {
        Self {
            path,
            store,
            gate: UpdateGate::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn gate(&self) -> &UpdateGate {
        &self.gate
    }

    pub fn is_dirty(&self) -> bool {
        self.store.dirty.load(Ordering::Acquire)
    }

    fn write_rows(&self) -> Result<usize> {
        let temp_path = self.path.with_extension("table.tmp");
        let rows = self.store.rows.read();

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        for (&key, &value) in rows.iter() {
            let line = serde_json::to_string(&Entry { key, value })?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;
        Ok(rows.len())
    }
}

impl Pager for FilePager {
    fn flush_all_pages(&self) -> Result<()> {
        if !self.store.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        match self.write_rows() {
            Ok(count) => {
                debug!("flushed {} rows of '{}'", count, self.store.name);
                Ok(())
            }
            Err(e) => {
                self.store.mark_dirty();
                Err(e)
            }
        }
    }

    fn lock_all_updates(&self) {
        self.gate.freeze();
    }

    fn unlock_all_updates(&self) {
        self.gate.thaw();
    }
}
