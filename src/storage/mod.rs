//! Reference storage for GraniteDB
//!
//! ## Directory layout
//! ```text
//! data/
//! ├── catalog.json       # table name -> table kind
//! ├── checkpoint.json    # last checkpoint reflected here (written by recovery)
//! ├── users.table        # rows of 'users', one JSON entry per line
//! └── ...
//! ```
//!
//! Tables are held in memory. The catalog is written when a table is created;
//! rows are written only when a table's pager is flushed, so dropping the
//! database without a checkpoint behaves like a crash.

mod pager;
mod table;

pub use pager::{FilePager, GateGuard, UpdateGate};
pub use table::MemoryTable;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::index::{Database, Index, Pager};
use crate::types::TableKind;

/// Catalog file storing table kinds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    tables: BTreeMap<String, TableKind>,
}

/// A directory of [`MemoryTable`]s
#[derive(Debug)]
pub struct MemoryDatabase {
    base: PathBuf,
    tables: RwLock<BTreeMap<String, Arc<MemoryTable>>>,
}

impl MemoryDatabase {
    /// Open the database in `dir`, loading every cataloged table.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let base = dir.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;

        let catalog = load_catalog(&base)?;
        let mut tables = BTreeMap::new();
        for (name, kind) in &catalog.tables {
            let table = MemoryTable::load(&base, *kind, name)?;
            tables.insert(name.clone(), Arc::new(table));
        }
        info!("opened '{}' with {} tables", base.display(), tables.len());

        Ok(Self {
            base,
            tables: RwLock::new(tables),
        })
    }

    /// Flush every table.
    pub fn flush_all(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.pager().flush_all_pages()?;
        }
        Ok(())
    }

    pub fn memory_table(&self, name: &str) -> Option<Arc<MemoryTable>> {
        self.tables.read().get(name).cloned()
    }

    fn save_catalog(&self, tables: &BTreeMap<String, Arc<MemoryTable>>) -> Result<()> {
        let catalog = Catalog {
            tables: tables.iter().map(|(n, t)| (n.clone(), t.kind())).collect(),
        };
        let path = catalog_path(&self.base);
        let temp_path = path.with_extension("json.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &catalog)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        fs::rename(temp_path, path)?;
        Ok(())
    }
}

impl Database for MemoryDatabase {
    fn base_path(&self) -> &Path {
        &self.base
    }

    fn tables(&self) -> Vec<Arc<dyn Index>> {
        self.tables
            .read()
            .values()
            .map(|t| t.clone() as Arc<dyn Index>)
            .collect()
    }

    fn table(&self, name: &str) -> Option<Arc<dyn Index>> {
        self.memory_table(name).map(|t| t as Arc<dyn Index>)
    }

    fn create_table(&self, kind: TableKind, name: &str) -> Result<Arc<dyn Index>> {
        validate_table_name(name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(IndexError::TableExists(name.to_string()).into());
        }
        let table = Arc::new(MemoryTable::create(&self.base, kind, name));
        tables.insert(name.to_string(), Arc::clone(&table));
        self.save_catalog(&tables)?;
        Ok(table)
    }
}

fn catalog_path(dir: &Path) -> PathBuf {
    dir.join("catalog.json")
}

fn load_catalog(dir: &Path) -> Result<Catalog> {
    let path = catalog_path(dir);
    if !path.exists() {
        return Ok(Catalog::default());
    }
    let file = File::open(&path)?;
    serde_json::from_reader(file).map_err(|e| {
        IndexError::Storage(format!("failed to parse catalog '{}': {}", path.display(), e)).into()
    })
}

/// Table names become file names: letters, digits and underscores only.
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(IndexError::Storage(format!("invalid table name '{}'", name)).into());
    }
    Ok(())
}
