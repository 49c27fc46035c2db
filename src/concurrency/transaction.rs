//! Per-client transaction state

use std::collections::HashMap;
use std::fmt;

use parking_lot::{Mutex, RwLock};

use crate::types::{ClientId, LockType, Resource};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// A running transaction.
///
/// The resource map has its own lock: conflict discovery reads it, lock grant
/// and release write it. Each resource maps to exactly one lock type.
#[derive(Debug)]
pub struct Transaction {
    client_id: ClientId,
    resources: RwLock<HashMap<Resource, LockType>>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            resources: RwLock::new(HashMap::new()),
            state: Mutex::new(TransactionState::Active),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Lock type held on `resource`, if any
    pub fn held(&self, resource: &Resource) -> Option<LockType> {
        self.resources.read().get(resource).copied()
    }

    /// Copy of every held resource and its lock type
    pub fn resources(&self) -> Vec<(Resource, LockType)> {
        self.resources
            .read()
            .iter()
            .map(|(r, t)| (r.clone(), *t))
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.resources.read().len()
    }

    pub(crate) fn record_grant(&self, resource: Resource, lock_type: LockType) {
        self.resources.write().insert(resource, lock_type);
    }

    pub(crate) fn remove(&self, resource: &Resource) -> Option<LockType> {
        self.resources.write().remove(resource)
    }

    /// Empty the resource map, returning what was held.
    pub(crate) fn drain(&self) -> Vec<(Resource, LockType)> {
        self.resources.write().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_creation() {
        let client = ClientId::new();
        let txn = Transaction::new(client);
        assert_eq!(txn.client_id(), client);
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.lock_count(), 0);
    }

    #[test]
    fn test_one_lock_type_per_resource() {
        let txn = Transaction::new(ClientId::new());
        let r = Resource::new("users", 1);
        txn.record_grant(r.clone(), LockType::Shared);
        txn.record_grant(r.clone(), LockType::Exclusive);
        assert_eq!(txn.lock_count(), 1);
        assert_eq!(txn.held(&r), Some(LockType::Exclusive));

        let drained = txn.drain();
        assert_eq!(drained, vec![(r.clone(), LockType::Exclusive)]);
        assert_eq!(txn.held(&r), None);
    }

    #[test]
    fn test_transaction_state_transitions() {
        let txn = Transaction::new(ClientId::new());
        txn.set_state(TransactionState::Aborted);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.state().to_string(), "aborted");
    }
}
