//! Storage collaborator capabilities
//!
//! The transaction and recovery core never looks inside an index. It only
//! needs the capability sets below: row mutation and lookup on an [`Index`],
//! flush and update-freeze on its [`Pager`], and table enumeration/creation on
//! the [`Database`] that owns them.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Entry, Key, TableKind, Value};

/// Page cache operations used by checkpointing
pub trait Pager: Send + Sync {
    /// Write every dirty page to durable storage
    fn flush_all_pages(&self) -> Result<()>;

    /// Block new page mutations and wait for in-flight ones to finish
    fn lock_all_updates(&self);

    /// Re-admit page mutations
    fn unlock_all_updates(&self);
}

/// A keyed table
pub trait Index: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `DuplicateKey` if `key` is present
    fn insert(&self, key: Key, value: Value) -> Result<()>;

    /// Fails with `KeyNotFound` if `key` is absent
    fn update(&self, key: Key, value: Value) -> Result<()>;

    /// Fails with `KeyNotFound` if `key` is absent
    fn delete(&self, key: Key) -> Result<()>;

    fn find(&self, key: Key) -> Result<Option<Value>>;

    /// Cursor positioned at the first entry
    fn table_start(&self) -> Result<Cursor>;

    fn pager(&self) -> Arc<dyn Pager>;
}

impl std::fmt::Debug for dyn Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").field("name", &self.name()).finish()
    }
}

/// Set of tables rooted at one directory
pub trait Database: Send + Sync {
    /// Live database directory
    fn base_path(&self) -> &Path;

    fn tables(&self) -> Vec<Arc<dyn Index>>;

    fn table(&self, name: &str) -> Option<Arc<dyn Index>>;

    /// Fails with `TableExists` if the name is taken
    fn create_table(&self, kind: TableKind, name: &str) -> Result<Arc<dyn Index>>;
}

/// Forward cursor over a table's entries in key order.
///
/// The cursor owns a snapshot of the entries taken when it was opened.
#[derive(Debug)]
pub struct Cursor {
    entries: std::vec::IntoIter<Entry>,
}

impl Cursor {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }

    /// True once every entry has been yielded
    pub fn is_end(&self) -> bool {
        self.entries.len() == 0
    }
}

impl Iterator for Cursor {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        self.entries.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_yields_in_order_then_ends() {
        let mut cursor = Cursor::new(vec![
            Entry { key: 1, value: 10 },
            Entry { key: 2, value: 20 },
        ]);
        assert!(!cursor.is_end());
        assert_eq!(cursor.next(), Some(Entry { key: 1, value: 10 }));
        assert_eq!(cursor.next(), Some(Entry { key: 2, value: 20 }));
        assert!(cursor.is_end());
        assert_eq!(cursor.next(), None);
    }
}
