//! Transaction Manager for GraniteDB
//!
//! Mediates client transactions against the lock table and the wait-for graph.
//!
//! ### Locking protocol (strict two-phase)
//! 1. BEGIN: register an `Active` transaction for the client
//! 2. LOCK: scan every other transaction for conflicting holders and for
//!    conflicting requests already queued on the resource, add
//!    `requester -> holder` edges, refuse the request if that closes a cycle,
//!    otherwise queue it and block until it is granted
//! 3. UNLOCK: release one held lock (only used to re-lock at another strength)
//! 4. COMMIT / ABORT: release everything and drop the transaction
//!
//! ### Lock ordering
//! `waits` mutex, then the transaction table, then a transaction's resource
//! map, then the lock table's internal mutex. A blocked requester holds none
//! of these while it sleeps.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use parking_lot::{Mutex, RwLock};

use super::graph::WaitForGraph;
use super::lock::LockManager;
use super::transaction::{Transaction, TransactionState};
use crate::error::{GraniteError, Result};
use crate::types::{ClientId, LockType, Resource};

/// Wait-for graph plus every request that is queued but not yet recorded as
/// held. Both only change under the same mutex.
#[derive(Debug, Default)]
struct WaitState {
    graph: WaitForGraph,
    pending: HashMap<ClientId, (Resource, LockType)>,
}

/// The Transaction Manager
///
/// One instance is shared (behind an `Arc`) by every client session.
#[derive(Debug, Default)]
pub struct TransactionManager {
    transactions: RwLock<HashMap<ClientId, Arc<Transaction>>>,
    waits: Mutex<WaitState>,
    lock_manager: LockManager,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction for `client`.
    pub fn begin(&self, client: ClientId) -> Result<()> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&client) {
            return Err(GraniteError::AlreadyActive(client));
        }
        transactions.insert(client, Arc::new(Transaction::new(client)));
        debug!("began transaction for client {}", client);
        Ok(())
    }

    /// Acquire `lock_type` on `resource` for `client`, blocking while a
    /// conflicting lock is held or queued ahead.
    ///
    /// Fails immediately with `DeadlockDetected` if waiting would close a
    /// cycle; the caller must then roll back.
    pub fn lock(&self, client: ClientId, resource: &Resource, lock_type: LockType) -> Result<()> {
        let txn = self
            .transaction(client)
            .ok_or(GraniteError::TransactionNotFound(client))?;

        match txn.held(resource) {
            Some(held) if held.covers(lock_type) => return Ok(()),
            Some(_) => return Err(GraniteError::UpgradeNotSupported(resource.clone())),
            None => {}
        }

        let ticket = {
            let mut waits = self.waits.lock();
            let blockers = self.blockers(&waits, client, resource, lock_type);

            let added: Vec<ClientId> = blockers
                .iter()
                .copied()
                .filter(|&holder| waits.graph.add_edge(client, holder))
                .collect();

            if waits.graph.detect_cycle_from(client) {
                for holder in added {
                    waits.graph.remove_edge(client, holder);
                }
                debug!(
                    "refusing {} lock on {} for client {}: deadlock",
                    lock_type, resource, client
                );
                return Err(GraniteError::DeadlockDetected {
                    client,
                    resource: resource.clone(),
                });
            }

            waits.pending.insert(client, (resource.clone(), lock_type));
            self.lock_manager.enqueue(resource, lock_type)
        };

        self.lock_manager.wait(ticket);

        let mut waits = self.waits.lock();
        txn.record_grant(resource.clone(), lock_type);
        waits.pending.remove(&client);
        waits.graph.clear_waits(client);
        Ok(())
    }

    /// Release the exact `lock_type` held on `resource`.
    pub fn unlock(&self, client: ClientId, resource: &Resource, lock_type: LockType) -> Result<()> {
        let txn = self
            .transaction(client)
            .ok_or(GraniteError::TransactionNotFound(client))?;

        let mut waits = self.waits.lock();
        match txn.held(resource) {
            None => return Err(GraniteError::ResourceNotFound(resource.clone())),
            Some(held) if held != lock_type => {
                return Err(GraniteError::LockTypeMismatch {
                    resource: resource.clone(),
                    held,
                    requested: lock_type,
                })
            }
            Some(_) => {}
        }

        txn.remove(resource);
        self.lock_manager.unlock(resource, lock_type)?;

        // whoever queued on this resource no longer waits on us through it
        let waiters: Vec<ClientId> = waits
            .pending
            .iter()
            .filter(|(_, (r, _))| r == resource)
            .map(|(&waiter, _)| waiter)
            .collect();
        for waiter in waiters {
            waits.graph.remove_edge(waiter, client);
        }
        Ok(())
    }

    /// Release every lock and end the transaction.
    pub fn commit(&self, client: ClientId) -> Result<()> {
        self.finish(client, TransactionState::Committed)
    }

    /// Same release semantics as [`commit`](Self::commit), but the transaction
    /// ends `Aborted`. Used once its logged edits have been undone.
    pub fn abort(&self, client: ClientId) -> Result<()> {
        self.finish(client, TransactionState::Aborted)
    }

    fn finish(&self, client: ClientId, state: TransactionState) -> Result<()> {
        let mut waits = self.waits.lock();
        let txn = self
            .transactions
            .write()
            .remove(&client)
            .ok_or(GraniteError::TransactionNotFound(client))?;

        for (resource, lock_type) in txn.drain() {
            if let Err(e) = self.lock_manager.unlock(&resource, lock_type) {
                error!("releasing {} for client {}: {}", resource, client, e);
            }
        }

        waits.graph.remove_node(client);
        waits.pending.remove(&client);
        txn.set_state(state);
        debug!("transaction for client {} {}", client, state);
        Ok(())
    }

    /// Active transactions other than `requester` holding a lock on
    /// `resource` that conflicts with `lock_type`.
    pub fn discover_conflicts(
        &self,
        requester: ClientId,
        resource: &Resource,
        lock_type: LockType,
    ) -> Vec<ClientId> {
        self.transactions
            .read()
            .values()
            .filter(|txn| txn.client_id() != requester)
            .filter(|txn| {
                txn.held(resource)
                    .map_or(false, |held| !held.is_compatible_with(lock_type))
            })
            .map(|txn| txn.client_id())
            .collect()
    }

    /// Conflicting holders plus conflicting requests queued ahead. Every
    /// pending request was queued before this one, so all of them are ahead.
    fn blockers(
        &self,
        waits: &WaitState,
        requester: ClientId,
        resource: &Resource,
        lock_type: LockType,
    ) -> Vec<ClientId> {
        let mut blockers = self.discover_conflicts(requester, resource, lock_type);
        for (&waiter, (r, requested)) in &waits.pending {
            if waiter != requester
                && r == resource
                && !requested.is_compatible_with(lock_type)
                && !blockers.contains(&waiter)
            {
                blockers.push(waiter);
            }
        }
        blockers
    }

    pub fn transaction(&self, client: ClientId) -> Option<Arc<Transaction>> {
        self.transactions.read().get(&client).cloned()
    }

    pub fn is_active(&self, client: ClientId) -> bool {
        self.transactions.read().contains_key(&client)
    }

    pub fn active_clients(&self) -> Vec<ClientId> {
        self.transactions.read().keys().copied().collect()
    }

    /// Every transaction holding a lock on `resource`, with its lock type
    pub fn holders_of(&self, resource: &Resource) -> Vec<(ClientId, LockType)> {
        self.transactions
            .read()
            .values()
            .filter_map(|txn| txn.held(resource).map(|t| (txn.client_id(), t)))
            .collect()
    }

    /// Clients `client` is currently recorded as waiting on
    pub fn waits_for(&self, client: ClientId) -> Vec<ClientId> {
        self.waits.lock().graph.edges_from(client)
    }

    pub fn wait_edge_count(&self) -> usize {
        self.waits.lock().graph.edge_count()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }
}
