//! Concurrency control: two-phase locking with wait-for-graph deadlock detection

pub mod graph;
pub mod lock;
pub mod manager;
pub mod transaction;

pub use graph::WaitForGraph;
pub use lock::{LockManager, LockState, LockTicket};
pub use manager::TransactionManager;
pub use transaction::{Transaction, TransactionState};
