//! Transactions and concurrency control
//!
//! - `lock`: shared/exclusive row locks with timeout-based deadlock
//!   avoidance
//! - `manager`: transaction lifecycle, savepoints, undo

pub mod lock;
pub mod manager;

pub use lock::LockManager;
pub use manager::{Savepoint, TransactionManager, Txn, TxnState};
