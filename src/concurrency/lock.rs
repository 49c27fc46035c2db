//! Per-resource lock table
//!
//! The lock manager is a bookkeeping ledger of grants: for every resource it
//! counts shared holders, flags an exclusive holder, and keeps a FIFO queue of
//! pending requests. It knows nothing about transactions; the
//! [`TransactionManager`](super::TransactionManager) decides whether a request
//! is safe to queue and tracks who holds what.
//!
//! A queued request is granted once it is compatible with the current holders
//! and nothing incompatible was queued ahead of it:
//!
//! ```text
//! queue: [S1, S2, X3, S4]   holders: none
//!   S1, S2 granted together; X3 waits for both; S4 waits behind X3
//! ```

use std::collections::{HashMap, VecDeque};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::error::{GraniteError, Result};
use crate::types::{LockType, Resource};

/// Handle for a queued lock request
#[derive(Debug)]
#[must_use = "a queued request must be waited on or it blocks the queue forever"]
pub struct LockTicket {
    id: u64,
    resource: Resource,
    lock_type: LockType,
}

impl LockTicket {
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

/// Snapshot of one resource's entry in the lock table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub shared_holders: usize,
    pub exclusive: bool,
    pub waiting: usize,
}

#[derive(Debug, Default)]
struct ResourceLock {
    shared_holders: usize,
    exclusive: bool,
    queue: VecDeque<(u64, LockType)>,
}

impl ResourceLock {
    fn admits(&self, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Shared => !self.exclusive,
            LockType::Exclusive => !self.exclusive && self.shared_holders == 0,
        }
    }

    fn is_grantable(&self, ticket: u64, lock_type: LockType) -> bool {
        if !self.admits(lock_type) {
            return false;
        }
        for &(id, ahead) in &self.queue {
            if id == ticket {
                return true;
            }
            if !ahead.is_compatible_with(lock_type) {
                return false;
            }
        }
        false
    }

    fn is_idle(&self) -> bool {
        self.shared_holders == 0 && !self.exclusive && self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    next_ticket: u64,
    resources: HashMap<Resource, ResourceLock>,
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request to the resource's queue without waiting for it.
    pub fn enqueue(&self, resource: &Resource, lock_type: LockType) -> LockTicket {
        let mut table = self.table.lock();
        table.next_ticket += 1;
        let id = table.next_ticket;
        table
            .resources
            .entry(resource.clone())
            .or_default()
            .queue
            .push_back((id, lock_type));
        LockTicket {
            id,
            resource: resource.clone(),
            lock_type,
        }
    }

    /// Block until the ticket is grantable, then record the grant.
    pub fn wait(&self, ticket: LockTicket) {
        let mut table = self.table.lock();
        let mut waited = false;
        loop {
            let grantable = table
                .resources
                .get(&ticket.resource)
                .map_or(false, |entry| entry.is_grantable(ticket.id, ticket.lock_type));
            if grantable {
                break;
            }
            if !waited {
                debug!("waiting for {} lock on {}", ticket.lock_type, ticket.resource);
                waited = true;
            }
            self.released.wait(&mut table);
        }

        if let Some(entry) = table.resources.get_mut(&ticket.resource) {
            entry.queue.retain(|&(id, _)| id != ticket.id);
            match ticket.lock_type {
                LockType::Shared => entry.shared_holders += 1,
                LockType::Exclusive => entry.exclusive = true,
            }
        }
        debug!("granted {} lock on {}", ticket.lock_type, ticket.resource);

        // the next queued request may be a compatible shared one
        self.released.notify_all();
    }

    /// Queue and wait in one step.
    pub fn lock(&self, resource: &Resource, lock_type: LockType) {
        let ticket = self.enqueue(resource, lock_type);
        self.wait(ticket);
    }

    /// Release one grant of `lock_type` on `resource`.
    pub fn unlock(&self, resource: &Resource, lock_type: LockType) -> Result<()> {
        let mut table = self.table.lock();
        let entry = table
            .resources
            .get_mut(resource)
            .ok_or_else(|| GraniteError::ResourceNotFound(resource.clone()))?;

        match lock_type {
            LockType::Exclusive if entry.exclusive => entry.exclusive = false,
            LockType::Shared if entry.shared_holders > 0 => entry.shared_holders -= 1,
            _ => {
                let held = if entry.exclusive {
                    LockType::Exclusive
                } else if entry.shared_holders > 0 {
                    LockType::Shared
                } else {
                    return Err(GraniteError::ResourceNotFound(resource.clone()));
                };
                return Err(GraniteError::LockTypeMismatch {
                    resource: resource.clone(),
                    held,
                    requested: lock_type,
                });
            }
        }

        if entry.is_idle() {
            table.resources.remove(resource);
        }
        debug!("released {} lock on {}", lock_type, resource);
        self.released.notify_all();
        Ok(())
    }

    pub fn holders(&self, resource: &Resource) -> Option<LockState> {
        let table = self.table.lock();
        table.resources.get(resource).map(|entry| LockState {
            shared_holders: entry.shared_holders,
            exclusive: entry.exclusive,
            waiting: entry.queue.len(),
        })
    }

    /// Number of resources with a holder or a waiter
    pub fn resource_count(&self) -> usize {
        self.table.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resource_count() == 0
    }
}
