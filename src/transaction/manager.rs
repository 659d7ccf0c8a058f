//! Transaction manager
//!
//! Owns the txn-id counter and one WAL handle per database. DML code
//! appends change records through the txn's database log and pushes
//! the LSNs onto the undo chain; rollback walks that chain backwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::paths::DbPaths;
use crate::storage::wal::{LogManager, LogRecord, LogType, Lsn, TxnId};
use crate::storage::StorageEngine;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A savepoint marks how long the undo chain was when it was created.
#[derive(Debug, Clone)]
pub struct Savepoint {
    pub name: String,
    pub undo_len: usize,
}

/// Transaction context handed to the DML layer.
#[derive(Debug)]
pub struct Txn {
    pub id: TxnId,
    pub state: TxnState,
    pub db_name: String,
    /// LSNs to reverse on rollback, in append order.
    pub undo_chain: Vec<Lsn>,
    pub savepoints: Vec<Savepoint>,
    /// Tables whose indexes must be rebuilt after commit or rollback.
    pub touched_tables: Vec<String>,
}

impl Txn {
    /// Record a mutated table for the post-commit index rebuild.
    pub fn touch(&mut self, table: &str) {
        if !self
            .touched_tables
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
        {
            self.touched_tables.push(table.to_string());
        }
    }
}

/// Creates transactions and drives commit/rollback through the WAL.
pub struct TransactionManager {
    root: PathBuf,
    engine: StorageEngine,
    next_txn_id: AtomicU64,
    logs: Mutex<HashMap<String, Arc<LogManager>>>,
    lsn_seeds: Mutex<HashMap<String, Lsn>>,
}

impl TransactionManager {
    /// `next_txn_id` and `lsn_seeds` come from recovery so new
    /// assignments never collide with replayed history.
    pub fn new(root: impl Into<PathBuf>, next_txn_id: TxnId, lsn_seeds: HashMap<String, Lsn>) -> Self {
        Self {
            root: root.into(),
            engine: StorageEngine::new(),
            next_txn_id: AtomicU64::new(next_txn_id.max(1)),
            logs: Mutex::new(HashMap::new()),
            lsn_seeds: Mutex::new(lsn_seeds),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The WAL handle for a database, created lazily.
    pub fn log_for(&self, db: &str) -> Arc<LogManager> {
        let mut logs = self.logs.lock().unwrap();
        if let Some(log) = logs.get(db) {
            return Arc::clone(log);
        }
        let seed = self
            .lsn_seeds
            .lock()
            .unwrap()
            .get(db)
            .copied()
            .unwrap_or(1);
        let paths = DbPaths::new(&self.root, db);
        let log = Arc::new(LogManager::new(paths.wal, seed));
        logs.insert(db.to_string(), Arc::clone(&log));
        log
    }

    /// Start a transaction: assign an id and write BEGIN.
    pub fn begin(&self, db: &str) -> Result<Txn> {
        if db.is_empty() {
            return Err(Error::TxnState("database name required for BEGIN".into()));
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let log = self.log_for(db);
        log.append(LogRecord::control(id, LogType::Begin))?;
        debug!(txn = id, db, "begin");
        Ok(Txn {
            id,
            state: TxnState::Active,
            db_name: db.to_string(),
            undo_chain: Vec::new(),
            savepoints: Vec::new(),
            touched_tables: Vec::new(),
        })
    }

    /// Append COMMIT and force the WAL to disk; only then is the
    /// transaction reported committed.
    pub fn commit(&self, txn: &mut Txn) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::TxnState("no active transaction".into()));
        }
        let log = self.log_for(&txn.db_name);
        let lsn = log.append(LogRecord::control(txn.id, LogType::Commit))?;
        log.flush(lsn)?;
        txn.state = TxnState::Committed;
        debug!(txn = txn.id, "committed");
        Ok(())
    }

    /// Undo the chain in reverse, then append ABORT.
    pub fn rollback(&self, txn: &mut Txn) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::TxnState("no active transaction".into()));
        }
        let log = self.log_for(&txn.db_name);
        for lsn in txn.undo_chain.iter().rev() {
            if let Some(rec) = log.record(*lsn) {
                self.undo_record(&txn.db_name, &rec)?;
            }
        }
        log.append(LogRecord::control(txn.id, LogType::Abort))?;
        txn.state = TxnState::Aborted;
        debug!(txn = txn.id, "rolled back");
        Ok(())
    }

    /// Remember the current undo-chain length under a name.
    pub fn savepoint(&self, txn: &mut Txn, name: &str) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::TxnState("no active transaction".into()));
        }
        txn.savepoints.push(Savepoint {
            name: name.to_string(),
            undo_len: txn.undo_chain.len(),
        });
        Ok(())
    }

    /// Undo back to the newest savepoint with this name, keeping the
    /// savepoint itself.
    pub fn rollback_to_savepoint(&self, txn: &mut Txn, name: &str) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::TxnState("no active transaction".into()));
        }
        let target = txn
            .savepoints
            .iter()
            .rev()
            .find(|sp| sp.name == name)
            .map(|sp| sp.undo_len)
            .ok_or_else(|| Error::SavepointNotFound(name.to_string()))?;
        let log = self.log_for(&txn.db_name);
        while txn.undo_chain.len() > target {
            let lsn = txn.undo_chain.pop().expect("undo chain longer than target");
            if let Some(rec) = log.record(lsn) {
                self.undo_record(&txn.db_name, &rec)?;
                // Compensation record: a later COMMIT makes the
                // original change redo-able, so the undo must be
                // redo-able too.
                let clr = match rec.log_type {
                    LogType::Insert => LogRecord::change(
                        txn.id,
                        LogType::Delete,
                        rec.rid.clone(),
                        rec.after.clone(),
                        Vec::new(),
                    ),
                    LogType::Update => LogRecord::change(
                        txn.id,
                        LogType::Update,
                        rec.rid.clone(),
                        rec.after.clone(),
                        rec.before.clone(),
                    ),
                    LogType::Delete => LogRecord::change(
                        txn.id,
                        LogType::Insert,
                        rec.rid.clone(),
                        Vec::new(),
                        rec.before.clone(),
                    ),
                    _ => continue,
                };
                log.append(clr)?;
            }
        }
        Ok(())
    }

    /// Forget the newest savepoint with this name without undoing.
    pub fn release_savepoint(&self, txn: &mut Txn, name: &str) -> Result<()> {
        if txn.state != TxnState::Active {
            return Err(Error::TxnState("no active transaction".into()));
        }
        let pos = txn
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| Error::SavepointNotFound(name.to_string()))?;
        txn.savepoints.remove(pos);
        Ok(())
    }

    fn undo_record(&self, db: &str, rec: &LogRecord) -> Result<()> {
        let paths = DbPaths::new(&self.root, db);
        match rec.log_type {
            LogType::Insert => {
                if rec.after.is_empty() {
                    return Ok(());
                }
                let mut bytes = rec.after.clone();
                bytes[0] = 0;
                self.engine
                    .write_record_bytes_at(&paths.dat, rec.rid.offset, &bytes)
            }
            LogType::Update | LogType::Delete => {
                self.engine
                    .write_record_bytes_at(&paths.dat, rec.rid.offset, &rec.before)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Field, Record, TableSchema};
    use crate::storage::wal::Rid;
    use tempfile::TempDir;

    fn setup(root: &Path) -> (StorageEngine, DbPaths, TableSchema, TransactionManager) {
        let engine = StorageEngine::new();
        engine.create_database(root, "db").unwrap();
        let paths = DbPaths::new(root, "db");
        let mut schema = TableSchema::new("t");
        schema.fields.push(Field::new("id", "int").key());
        schema.fields.push(Field::new("name", "char[8]"));
        engine.append_schema(&paths.dbf, &schema).unwrap();
        let txns = TransactionManager::new(root, 1, HashMap::new());
        (engine, paths, schema, txns)
    }

    fn logged_insert(
        engine: &StorageEngine,
        paths: &DbPaths,
        schema: &TableSchema,
        txns: &TransactionManager,
        txn: &mut Txn,
        record: &Record,
    ) -> u64 {
        let log = txns.log_for(&txn.db_name);
        let offset = engine
            .compute_append_record_offset(&paths.dat, schema)
            .unwrap();
        let after = engine.serialize_record(schema, record).unwrap();
        let lsn = log
            .append(LogRecord::change(
                txn.id,
                LogType::Insert,
                Rid::new(&schema.name, offset),
                Vec::new(),
                after,
            ))
            .unwrap();
        txn.undo_chain.push(lsn);
        txn.touch(&schema.name);
        engine.append_record(&paths.dat, schema, record).unwrap()
    }

    #[test]
    fn test_txn_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let (_, _, _, txns) = setup(dir.path());
        let a = txns.begin("db").unwrap();
        let b = txns.begin("db").unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_commit_requires_active() {
        let dir = TempDir::new().unwrap();
        let (_, _, _, txns) = setup(dir.path());
        let mut txn = txns.begin("db").unwrap();
        txns.commit(&mut txn).unwrap();
        assert_eq!(txn.state, TxnState::Committed);
        let err = txns.commit(&mut txn).unwrap_err();
        assert!(matches!(err, Error::TxnState(_)));
    }

    #[test]
    fn test_rollback_reverses_insert() {
        let dir = TempDir::new().unwrap();
        let (engine, paths, schema, txns) = setup(dir.path());
        let mut txn = txns.begin("db").unwrap();
        logged_insert(
            &engine,
            &paths,
            &schema,
            &txns,
            &mut txn,
            &Record::from_strs(&["1", "a"]),
        );
        assert_eq!(
            engine
                .read_records_with_offsets(&paths.dat, &schema)
                .unwrap()
                .len(),
            1
        );

        txns.rollback(&mut txn).unwrap();
        assert!(engine
            .read_records_with_offsets(&paths.dat, &schema)
            .unwrap()
            .is_empty());
        assert_eq!(txn.state, TxnState::Aborted);
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let dir = TempDir::new().unwrap();
        let (engine, paths, schema, txns) = setup(dir.path());
        let mut txn = txns.begin("db").unwrap();
        logged_insert(
            &engine,
            &paths,
            &schema,
            &txns,
            &mut txn,
            &Record::from_strs(&["1", "a"]),
        );
        txns.savepoint(&mut txn, "sp1").unwrap();
        logged_insert(
            &engine,
            &paths,
            &schema,
            &txns,
            &mut txn,
            &Record::from_strs(&["2", "b"]),
        );

        txns.rollback_to_savepoint(&mut txn, "sp1").unwrap();
        let rows = engine
            .read_records_with_offsets(&paths.dat, &schema)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.values[0], "1");

        // The savepoint survives a rollback to it.
        txns.rollback_to_savepoint(&mut txn, "sp1").unwrap();
        txns.release_savepoint(&mut txn, "sp1").unwrap();
        let err = txns.release_savepoint(&mut txn, "sp1").unwrap_err();
        assert!(matches!(err, Error::SavepointNotFound(_)));
        txns.commit(&mut txn).unwrap();
    }

    #[test]
    fn test_touch_dedupes_tables() {
        let dir = TempDir::new().unwrap();
        let (_, _, _, txns) = setup(dir.path());
        let mut txn = txns.begin("db").unwrap();
        txn.touch("t");
        txn.touch("T");
        assert_eq!(txn.touched_tables.len(), 1);
    }
}
