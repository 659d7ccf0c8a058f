//! Row-level lock manager
//!
//! Shared/exclusive locks keyed by the stringified RID. One mutex
//! guards the whole table; waiters park on a condition variable and
//! give up after a fixed deadline, which is the only deadlock-avoidance
//! mechanism (no waits-for graph).

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::wal::{Rid, TxnId};

/// How long an acquire may block before failing with `LockTimeout`.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct LockState {
    /// Exclusive owner; 0 means none.
    exclusive_owner: TxnId,
    shared_owners: HashSet<TxnId>,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<String, LockState>,
    /// Reverse map so release_all only touches held keys.
    owned: HashMap<TxnId, HashSet<String>>,
}

impl LockTable {
    fn try_shared(&mut self, txn_id: TxnId, key: &str) -> bool {
        let state = self.locks.entry(key.to_string()).or_default();
        if state.exclusive_owner != 0 && state.exclusive_owner != txn_id {
            return false;
        }
        state.shared_owners.insert(txn_id);
        self.owned.entry(txn_id).or_default().insert(key.to_string());
        true
    }

    fn try_exclusive(&mut self, txn_id: TxnId, key: &str) -> bool {
        let state = self.locks.entry(key.to_string()).or_default();
        if state.exclusive_owner == txn_id {
            self.owned.entry(txn_id).or_default().insert(key.to_string());
            return true;
        }
        if state.exclusive_owner != 0 {
            return false;
        }
        if !state.shared_owners.is_empty() {
            // Upgrade is allowed only for the sole shared owner.
            if state.shared_owners.len() == 1 && state.shared_owners.contains(&txn_id) {
                state.shared_owners.clear();
            } else {
                return false;
            }
        }
        state.exclusive_owner = txn_id;
        self.owned.entry(txn_id).or_default().insert(key.to_string());
        true
    }
}

/// Blocking S/X lock manager shared by every session thread.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    waiters: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock, blocking while another txn holds the key
    /// exclusively. Times out after [`LOCK_TIMEOUT`].
    pub fn lock_shared(&self, txn_id: TxnId, rid: &Rid) -> Result<()> {
        self.acquire(txn_id, rid, false)
    }

    /// Acquire an exclusive lock, blocking until no other owner
    /// remains (the sole shared owner upgrades in place).
    pub fn lock_exclusive(&self, txn_id: TxnId, rid: &Rid) -> Result<()> {
        self.acquire(txn_id, rid, true)
    }

    fn acquire(&self, txn_id: TxnId, rid: &Rid, exclusive: bool) -> Result<()> {
        let key = rid.lock_key();
        let deadline = Instant::now() + LOCK_TIMEOUT;
        let mut table = self.table.lock().unwrap();
        loop {
            let granted = if exclusive {
                table.try_exclusive(txn_id, &key)
            } else {
                table.try_shared(txn_id, &key)
            };
            if granted {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(txn = txn_id, %key, exclusive, "lock timeout");
                return Err(Error::LockTimeout(key));
            }
            debug!(txn = txn_id, %key, exclusive, "waiting for lock");
            let (guard, wait) = self
                .waiters
                .wait_timeout(table, deadline - now)
                .unwrap();
            table = guard;
            if wait.timed_out() {
                // One last attempt before reporting the timeout.
                let granted = if exclusive {
                    table.try_exclusive(txn_id, &key)
                } else {
                    table.try_shared(txn_id, &key)
                };
                if granted {
                    return Ok(());
                }
                warn!(txn = txn_id, %key, exclusive, "lock timeout");
                return Err(Error::LockTimeout(key));
            }
        }
    }

    /// Drop one shared hold; used when a SELECT finishes under
    /// read-committed.
    pub fn release_shared(&self, txn_id: TxnId, rid: &Rid) {
        let key = rid.lock_key();
        let mut table = self.table.lock().unwrap();
        if let Some(state) = table.locks.get_mut(&key) {
            state.shared_owners.remove(&txn_id);
            let still_held = state.exclusive_owner == txn_id;
            if !still_held {
                if let Some(owned) = table.owned.get_mut(&txn_id) {
                    owned.remove(&key);
                    if owned.is_empty() {
                        table.owned.remove(&txn_id);
                    }
                }
            }
        }
        self.waiters.notify_all();
    }

    /// End the transaction's participation on every held key. Called
    /// at commit or abort.
    pub fn release_all(&self, txn_id: TxnId) {
        let mut table = self.table.lock().unwrap();
        if let Some(keys) = table.owned.remove(&txn_id) {
            for key in keys {
                if let Some(state) = table.locks.get_mut(&key) {
                    if state.exclusive_owner == txn_id {
                        state.exclusive_owner = 0;
                    }
                    state.shared_owners.remove(&txn_id);
                    if state.exclusive_owner == 0 && state.shared_owners.is_empty() {
                        table.locks.remove(&key);
                    }
                }
            }
        }
        self.waiters.notify_all();
    }

    /// Test hook: is this key held exclusively by anyone?
    #[cfg(test)]
    fn exclusive_owner(&self, rid: &Rid) -> TxnId {
        let table = self.table.lock().unwrap();
        table
            .locks
            .get(&rid.lock_key())
            .map(|s| s.exclusive_owner)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn rid() -> Rid {
        Rid::new("t", 42)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        lm.lock_shared(1, &rid()).unwrap();
        lm.lock_shared(2, &rid()).unwrap();
        lm.release_all(1);
        lm.release_all(2);
    }

    #[test]
    fn test_exclusive_blocks_then_times_out() {
        let lm = LockManager::new();
        lm.lock_exclusive(1, &rid()).unwrap();
        let start = Instant::now();
        let err = lm.lock_exclusive(2, &rid()).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(start.elapsed() >= LOCK_TIMEOUT);
        lm.release_all(1);
    }

    #[test]
    fn test_reentrant_exclusive() {
        let lm = LockManager::new();
        lm.lock_exclusive(1, &rid()).unwrap();
        lm.lock_exclusive(1, &rid()).unwrap();
        lm.lock_shared(1, &rid()).unwrap();
        lm.release_all(1);
        assert_eq!(lm.exclusive_owner(&rid()), 0);
    }

    #[test]
    fn test_sole_shared_owner_upgrades() {
        let lm = LockManager::new();
        lm.lock_shared(1, &rid()).unwrap();
        lm.lock_exclusive(1, &rid()).unwrap();
        assert_eq!(lm.exclusive_owner(&rid()), 1);
        lm.release_all(1);
    }

    #[test]
    fn test_shared_blocks_upgrade_of_other() {
        let lm = LockManager::new();
        lm.lock_shared(1, &rid()).unwrap();
        lm.lock_shared(2, &rid()).unwrap();
        let err = lm.lock_exclusive(1, &rid()).unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        lm.release_all(1);
        lm.release_all(2);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lm = Arc::new(LockManager::new());
        lm.lock_exclusive(1, &rid()).unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || lm2.lock_exclusive(2, &rid()));

        thread::sleep(Duration::from_millis(50));
        lm.release_all(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(lm.exclusive_owner(&rid()), 2);
        lm.release_all(2);
    }

    #[test]
    fn test_no_overlapping_exclusive_holds() {
        let lm = Arc::new(LockManager::new());
        let held = Arc::new(Mutex::new(0u64));
        let mut handles = Vec::new();
        for txn in 1..=4u64 {
            let lm = Arc::clone(&lm);
            let held = Arc::clone(&held);
            handles.push(thread::spawn(move || {
                lm.lock_exclusive(txn, &rid()).unwrap();
                {
                    let mut owner = held.lock().unwrap();
                    assert_eq!(*owner, 0, "overlapping exclusive owners");
                    *owner = txn;
                }
                thread::sleep(Duration::from_millis(10));
                {
                    let mut owner = held.lock().unwrap();
                    assert_eq!(*owner, txn);
                    *owner = 0;
                }
                lm.release_all(txn);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
