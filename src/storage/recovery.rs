//! Crash recovery
//!
//! On startup every database's WAL is replayed: redo of committed
//! transactions in LSN order, then undo of losers in reverse order.
//! The highest CHECKPOINT payload bounds how far back replay reaches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use tracing::{info, warn};

use crate::catalog::TableSchema;
use crate::error::Result;
use crate::storage::paths::{self, DbPaths};
use crate::storage::wal::{self, LogRecord, LogType, Lsn, TxnId};
use crate::storage::StorageEngine;

/// Counters observed while replaying one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub max_txn_id: TxnId,
    pub max_lsn: Lsn,
}

/// Aggregate over all databases, used to seed the in-memory counters.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub next_txn_id: TxnId,
    pub next_lsn_by_db: HashMap<String, Lsn>,
}

struct SchemaCache<'a> {
    engine: &'a StorageEngine,
    paths: &'a DbPaths,
    cache: HashMap<String, TableSchema>,
}

impl<'a> SchemaCache<'a> {
    fn new(engine: &'a StorageEngine, paths: &'a DbPaths) -> Self {
        Self {
            engine,
            paths,
            cache: HashMap::new(),
        }
    }

    fn get(&mut self, table: &str) -> Result<&TableSchema> {
        let key = table.to_ascii_lowercase();
        if !self.cache.contains_key(&key) {
            let schema = self.engine.load_schema(&self.paths.dbf, table)?;
            self.cache.insert(key.clone(), schema);
        }
        Ok(&self.cache[&key])
    }
}

fn apply_redo(
    engine: &StorageEngine,
    paths: &DbPaths,
    schemas: &mut SchemaCache<'_>,
    rec: &LogRecord,
) -> Result<()> {
    match rec.log_type {
        LogType::Insert => {
            let schema = schemas.get(&rec.rid.table)?.clone();
            engine.write_insert_block_at(&paths.dat, &schema, rec.rid.offset, &rec.after)
        }
        LogType::Update => engine.write_record_bytes_at(&paths.dat, rec.rid.offset, &rec.after),
        LogType::Delete => {
            if rec.before.is_empty() {
                return Ok(());
            }
            let mut bytes = rec.before.clone();
            bytes[0] = 0;
            engine.write_record_bytes_at(&paths.dat, rec.rid.offset, &bytes)
        }
        _ => Ok(()),
    }
}

fn apply_undo(engine: &StorageEngine, paths: &DbPaths, rec: &LogRecord) -> Result<()> {
    match rec.log_type {
        LogType::Insert => {
            if rec.after.is_empty() {
                return Ok(());
            }
            let mut bytes = rec.after.clone();
            bytes[0] = 0;
            engine.write_record_bytes_at(&paths.dat, rec.rid.offset, &bytes)
        }
        LogType::Update | LogType::Delete => {
            engine.write_record_bytes_at(&paths.dat, rec.rid.offset, &rec.before)
        }
        _ => Ok(()),
    }
}

/// Replay one database's WAL and return the counters observed.
pub fn recover_database(root: &Path, db: &str) -> Result<RecoveryOutcome> {
    let engine = StorageEngine::new();
    let paths = DbPaths::new(root, db);
    let records = wal::read_log_records(&paths.wal)?;

    let mut outcome = RecoveryOutcome::default();
    let mut min_lsn: Lsn = 0;
    for rec in &records {
        outcome.max_txn_id = outcome.max_txn_id.max(rec.txn_id);
        outcome.max_lsn = outcome.max_lsn.max(rec.lsn);
        if rec.log_type != LogType::Checkpoint {
            continue;
        }
        match wal::decode_checkpoint_meta(&rec.after) {
            Some(meta) if meta.checkpoint_lsn != 0 => {
                min_lsn = min_lsn.max(meta.checkpoint_lsn);
            }
            _ => min_lsn = min_lsn.max(rec.lsn),
        }
    }

    let mut committed: HashSet<TxnId> = HashSet::new();
    let mut active: HashSet<TxnId> = HashSet::new();
    // BTreeMap keeps losers in txn order so undo output is deterministic.
    let mut per_txn: BTreeMap<TxnId, Vec<&LogRecord>> = BTreeMap::new();

    for rec in &records {
        if min_lsn != 0 && rec.lsn < min_lsn {
            continue;
        }
        if rec.log_type == LogType::Checkpoint {
            continue;
        }
        per_txn.entry(rec.txn_id).or_default().push(rec);
        match rec.log_type {
            LogType::Begin => {
                active.insert(rec.txn_id);
            }
            LogType::Commit => {
                committed.insert(rec.txn_id);
                active.remove(&rec.txn_id);
            }
            LogType::Abort => {
                active.remove(&rec.txn_id);
            }
            _ => {}
        }
    }

    let mut schemas = SchemaCache::new(&engine, &paths);
    let mut failed_redo: HashSet<TxnId> = HashSet::new();
    for rec in &records {
        if min_lsn != 0 && rec.lsn < min_lsn {
            continue;
        }
        if !committed.contains(&rec.txn_id) || failed_redo.contains(&rec.txn_id) {
            continue;
        }
        if let Err(e) = apply_redo(&engine, &paths, &mut schemas, rec) {
            warn!(db, txn = rec.txn_id, lsn = rec.lsn, error = %e, "redo failed, skipping rest of txn");
            failed_redo.insert(rec.txn_id);
        }
    }

    for (txn_id, logs) in &per_txn {
        if !active.contains(txn_id) {
            continue;
        }
        for rec in logs.iter().rev() {
            if let Err(e) = apply_undo(&engine, &paths, rec) {
                warn!(db, txn = *txn_id, lsn = rec.lsn, error = %e, "undo failed, abandoning txn replay");
                break;
            }
        }
    }

    if !records.is_empty() {
        info!(
            db,
            records = records.len(),
            committed = committed.len(),
            losers = active.len(),
            min_lsn,
            "recovery replayed wal"
        );
    }
    Ok(outcome)
}

/// Recover every database under the root and aggregate the counters.
pub fn recover_all(root: &Path) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        next_txn_id: 1,
        next_lsn_by_db: HashMap::new(),
    };
    for db in paths::list_databases(root)? {
        let outcome = recover_database(root, &db)?;
        report.next_txn_id = report.next_txn_id.max(outcome.max_txn_id + 1);
        report
            .next_lsn_by_db
            .insert(db.clone(), outcome.max_lsn + 1);
    }
    Ok(report)
}
