//! Reference keyed table

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use super::pager::{FilePager, TableStore};
use crate::error::{GraniteError, IndexError, Result};
use crate::index::{Cursor, Index, Pager};
use crate::types::{Entry, Key, TableKind, Value};

/// Ordered in-memory table persisted by its [`FilePager`].
///
/// Both table kinds share this implementation; the kind is only recorded in
/// the catalog.
#[derive(Debug)]
pub struct MemoryTable {
    kind: TableKind,
    store: Arc<TableStore>,
    pager: Arc<FilePager>,
}

impl MemoryTable {
    /// A new, empty table that will be written on the next flush.
    pub fn create(dir: &Path, kind: TableKind, name: &str) -> Self {
        Self::with_rows(dir, kind, name, BTreeMap::new(), true)
    }

    /// Load `<name>.table` from `dir`; a missing file is an empty table.
    pub fn load(dir: &Path, kind: TableKind, name: &str) -> Result<Self> {
        let path = table_path(dir, name);
        let mut rows = BTreeMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: Entry = serde_json::from_str(&line).map_err(|e| {
                    IndexError::Storage(format!(
                        "failed to parse row in '{}', line {}: {}",
                        path.display(),
                        idx + 1,
                        e
                    ))
                })?;
                rows.insert(entry.key, entry.value);
            }
        }
        Ok(Self::with_rows(dir, kind, name, rows, false))
    }

    fn with_rows(
        dir: &Path,
        kind: TableKind,
        name: &str,
        rows: BTreeMap<Key, Value>,
        dirty: bool,
    ) -> Self {
        let store = Arc::new(TableStore::new(name.to_string(), rows, dirty));
        let pager = Arc::new(FilePager::new(table_path(dir, name), Arc::clone(&store)));
        Self { kind, store, pager }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.store.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_pager(&self) -> &Arc<FilePager> {
        &self.pager
    }

    fn duplicate(&self, key: Key) -> GraniteError {
        IndexError::DuplicateKey {
            table: self.store.name.clone(),
            key,
        }
        .into()
    }

    fn missing(&self, key: Key) -> GraniteError {
        IndexError::KeyNotFound {
            table: self.store.name.clone(),
            key,
        }
        .into()
    }
}

pub(crate) fn table_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join(format!("{}.table", name))
}

impl Index for MemoryTable {
    fn name(&self) -> &str {
        &self.store.name
    }

    fn insert(&self, key: Key, value: Value) -> Result<()> {
        let _guard = self.pager.gate().enter();
        let mut rows = self.store.rows.write();
        if rows.contains_key(&key) {
            return Err(self.duplicate(key));
        }
        rows.insert(key, value);
        self.store.mark_dirty();
        Ok(())
    }

    fn update(&self, key: Key, value: Value) -> Result<()> {
        let _guard = self.pager.gate().enter();
        let mut rows = self.store.rows.write();
        match rows.get_mut(&key) {
            Some(slot) => *slot = value,
            None => return Err(self.missing(key)),
        }
        self.store.mark_dirty();
        Ok(())
    }

    fn delete(&self, key: Key) -> Result<()> {
        let _guard = self.pager.gate().enter();
        if self.store.rows.write().remove(&key).is_none() {
            return Err(self.missing(key));
        }
        self.store.mark_dirty();
        Ok(())
    }

    fn find(&self, key: Key) -> Result<Option<Value>> {
        Ok(self.store.rows.read().get(&key).copied())
    }

    fn table_start(&self) -> Result<Cursor> {
        let entries = self
            .store
            .rows
            .read()
            .iter()
            .map(|(&key, &value)| Entry { key, value })
            .collect();
        Ok(Cursor::new(entries))
    }

    fn pager(&self) -> Arc<dyn Pager> {
        self.pager.clone()
    }
}
