//! Core types for GraniteDB
//!
//! Identities, lockable resources, lock modes and the vocabulary shared by the
//! lock table and the write-ahead log.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row key within a table
pub type Key = i64;

/// Row value stored under a key
pub type Value = i64;

/// Identity of a client session; at most one transaction per client runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// A fresh random client identity
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        ClientId(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One logical row: a key within a named table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub table: String,
    pub key: Key,
}

impl Resource {
    pub fn new(table: impl Into<String>, key: Key) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}

/// Lock mode on a resource.
///
/// ```text
///              │ Shared │ Exclusive │
/// ─────────────┼────────┼───────────┤
///   Shared     │   ✓    │     ✗     │
///   Exclusive  │   ✗    │     ✗     │
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Read lock
    Shared,
    /// Write lock
    Exclusive,
}

impl LockType {
    /// Whether two owners may hold `self` and `other` on one resource at once.
    pub fn is_compatible_with(self, other: LockType) -> bool {
        matches!((self, other), (LockType::Shared, LockType::Shared))
    }

    /// Whether holding `self` already satisfies a request for `requested`.
    pub fn covers(self, requested: LockType) -> bool {
        match self {
            LockType::Exclusive => true,
            LockType::Shared => requested == LockType::Shared,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockType::Shared => write!(f, "shared"),
            LockType::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Kind of row mutation carried by an edit log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Index structure backing a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TableKind {
    #[default]
    BTree,
    Hash,
}

impl TableKind {
    /// Parse a table kind from its name (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "btree" => Some(TableKind::BTree),
            "hash" => Some(TableKind::Hash),
            _ => None,
        }
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::BTree => write!(f, "btree"),
            TableKind::Hash => write!(f, "hash"),
        }
    }
}

/// A key/value pair yielded by a table cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: Key,
    pub value: Value,
}
