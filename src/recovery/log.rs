//! WAL log record structures

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Action, ClientId, Key, TableKind, Value};

/// A row mutation carrying both images, so one record supports redo and undo.
///
/// `old` is `None` for an insert, `new` is `None` for a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLog {
    pub client: ClientId,
    pub table: String,
    pub action: Action,
    pub key: Key,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl EditLog {
    pub fn insert(client: ClientId, table: impl Into<String>, key: Key, value: Value) -> Self {
        Self {
            client,
            table: table.into(),
            action: Action::Insert,
            key,
            old: None,
            new: Some(value),
        }
    }

    pub fn update(
        client: ClientId,
        table: impl Into<String>,
        key: Key,
        old: Value,
        new: Value,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            action: Action::Update,
            key,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(client: ClientId, table: impl Into<String>, key: Key, old: Value) -> Self {
        Self {
            client,
            table: table.into(),
            action: Action::Delete,
            key,
            old: Some(old),
            new: None,
        }
    }

    /// The edit that erases this one:
    /// insert becomes delete, delete becomes insert of the old value,
    /// update becomes update back to the old value.
    pub fn inverse(&self) -> Self {
        let action = match self.action {
            Action::Insert => Action::Delete,
            Action::Delete => Action::Insert,
            Action::Update => Action::Update,
        };
        Self {
            client: self.client,
            table: self.table.clone(),
            action,
            key: self.key,
            old: self.new,
            new: self.old,
        }
    }
}

/// One record in the write-ahead log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Table created
    Table { kind: TableKind, name: String },
    /// Row inserted, updated or deleted
    Edit(EditLog),
    /// Transaction started
    Start { client: ClientId },
    /// Transaction finished (committed, or rolled back and compensated)
    Commit { client: ClientId },
    /// Pages flushed; lists the transactions active at that instant
    Checkpoint { active: Vec<ClientId> },
}

impl LogRecord {
    /// Client the record belongs to, if it is transaction-scoped
    pub fn client(&self) -> Option<ClientId> {
        match self {
            LogRecord::Edit(edit) => Some(edit.client),
            LogRecord::Start { client } | LogRecord::Commit { client } => Some(*client),
            LogRecord::Table { .. } | LogRecord::Checkpoint { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LogRecord::Table { .. } => "table",
            LogRecord::Edit(_) => "edit",
            LogRecord::Start { .. } => "start",
            LogRecord::Commit { .. } => "commit",
            LogRecord::Checkpoint { .. } => "checkpoint",
        }
    }
}

struct Image(Option<Value>);

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "-"),
        }
    }
}

impl fmt::Display for LogRecord {
    /// `dump-wal` line format. Absent old/new images render as `-`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { kind, name } => write!(f, "table {} {}", kind, name),
            LogRecord::Edit(e) => write!(
                f,
                "edit {} {} {} {} {} {}",
                e.client,
                e.action,
                e.table,
                e.key,
                Image(e.old),
                Image(e.new)
            ),
            LogRecord::Start { client } => write!(f, "start {}", client),
            LogRecord::Commit { client } => write!(f, "commit {}", client),
            LogRecord::Checkpoint { active } => {
                let ids: Vec<String> = active.iter().map(ToString::to_string).collect();
                write!(f, "checkpoint {}", ids.join(", "))
            }
        }
    }
}
