//! Write-Ahead Log
//!
//! Append-only file per database. Appends are serialized by the log
//! manager's internal mutex, which also assigns LSNs and keeps an
//! in-memory cache of appended records for rollback.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::codec;

/// Log sequence number, strictly monotonic per database.
pub type Lsn = u64;
/// Transaction identifier, monotonic across the engine.
pub type TxnId = u64;

/// Physical record identity: table plus byte offset of the valid byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rid {
    pub table: String,
    pub offset: u64,
}

impl Rid {
    pub fn new(table: impl Into<String>, offset: u64) -> Self {
        Self {
            table: table.into(),
            offset,
        }
    }

    /// Key used by the lock table.
    pub fn lock_key(&self) -> String {
        format!("{}#{}", self.table, self.offset)
    }
}

/// Log record type. The wire encoding is the discriminant as u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Begin,
    Insert,
    Update,
    Delete,
    Commit,
    Abort,
    Checkpoint,
}

impl LogType {
    fn as_u32(self) -> u32 {
        match self {
            LogType::Begin => 0,
            LogType::Insert => 1,
            LogType::Update => 2,
            LogType::Delete => 3,
            LogType::Commit => 4,
            LogType::Abort => 5,
            LogType::Checkpoint => 6,
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(LogType::Begin),
            1 => Some(LogType::Insert),
            2 => Some(LogType::Update),
            3 => Some(LogType::Delete),
            4 => Some(LogType::Commit),
            5 => Some(LogType::Abort),
            6 => Some(LogType::Checkpoint),
            _ => None,
        }
    }
}

/// One WAL entry. `before`/`after` carry serialized record images.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub log_type: LogType,
    pub rid: Rid,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

impl LogRecord {
    /// A control record (BEGIN/COMMIT/ABORT) with no payload.
    pub fn control(txn_id: TxnId, log_type: LogType) -> Self {
        Self {
            lsn: 0,
            txn_id,
            log_type,
            rid: Rid::new("", 0),
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// A data record carrying before/after images.
    pub fn change(
        txn_id: TxnId,
        log_type: LogType,
        rid: Rid,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Self {
        Self {
            lsn: 0,
            txn_id,
            log_type,
            rid,
            before,
            after,
        }
    }
}

/// CHECKPOINT payload carried in the after-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub version: u32,
    /// Lower bound for recovery: records below this LSN are covered.
    pub checkpoint_lsn: Lsn,
    pub unix_seconds: u64,
}

const CHECKPOINT_MAGIC: &[u8; 4] = b"CKPT";
/// Current checkpoint payload version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Encode a checkpoint payload for a CHECKPOINT record's after-image.
pub fn encode_checkpoint_meta(meta: &CheckpointMeta) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + 8 + 8);
    out.extend_from_slice(CHECKPOINT_MAGIC);
    codec::put_u32(&mut out, meta.version);
    codec::put_u64(&mut out, meta.checkpoint_lsn);
    codec::put_u64(&mut out, meta.unix_seconds);
    out
}

/// Decode a checkpoint payload; `None` when the image is not one.
pub fn decode_checkpoint_meta(after: &[u8]) -> Option<CheckpointMeta> {
    if after.len() < 4 + 4 + 8 + 8 || &after[0..4] != CHECKPOINT_MAGIC {
        return None;
    }
    let mut cur = codec::Cursor::new(&after[4..]);
    let version = cur.u32().ok()?;
    let checkpoint_lsn = cur.u64().ok()?;
    let unix_seconds = cur.u64().ok()?;
    Some(CheckpointMeta {
        version,
        checkpoint_lsn,
        unix_seconds,
    })
}

struct LogState {
    next_lsn: Lsn,
    cache: HashMap<Lsn, LogRecord>,
}

/// Manages one database's WAL file.
pub struct LogManager {
    wal_path: PathBuf,
    state: Mutex<LogState>,
}

impl LogManager {
    /// `start_lsn` is the first LSN to hand out; recovery seeds it with
    /// `max_lsn + 1` so post-recovery records never collide.
    pub fn new(wal_path: impl Into<PathBuf>, start_lsn: Lsn) -> Self {
        Self {
            wal_path: wal_path.into(),
            state: Mutex::new(LogState {
                next_lsn: start_lsn.max(1),
                cache: HashMap::new(),
            }),
        }
    }

    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Assign the next LSN, append the record, and cache it in memory.
    pub fn append(&self, mut record: LogRecord) -> Result<Lsn> {
        let mut state = self.state.lock().unwrap();
        record.lsn = state.next_lsn;
        state.next_lsn += 1;
        self.write_record(&record)?;
        let lsn = record.lsn;
        debug!(lsn, txn = record.txn_id, ?record.log_type, "wal append");
        state.cache.insert(lsn, record);
        Ok(lsn)
    }

    /// Append a CHECKPOINT record whose payload names its own LSN as
    /// the recovery lower bound.
    pub fn append_checkpoint(&self) -> Result<Lsn> {
        let mut state = self.state.lock().unwrap();
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        let unix_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut record = LogRecord::control(0, LogType::Checkpoint);
        record.lsn = lsn;
        record.after = encode_checkpoint_meta(&CheckpointMeta {
            version: CHECKPOINT_VERSION,
            checkpoint_lsn: lsn,
            unix_seconds,
        });
        self.write_record(&record)?;
        state.cache.insert(lsn, record);
        info!(lsn, "wal checkpoint appended");
        Ok(lsn)
    }

    fn write_record(&self, record: &LogRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)?;
        codec::write_u64(&mut file, record.lsn)?;
        codec::write_u64(&mut file, record.txn_id)?;
        codec::write_u32(&mut file, record.log_type.as_u32())?;
        codec::write_string(&mut file, &record.rid.table)?;
        codec::write_u64(&mut file, record.rid.offset)?;
        codec::write_bytes(&mut file, &record.before)?;
        codec::write_bytes(&mut file, &record.after)?;
        Ok(())
    }

    /// Force the WAL to durable storage. COMMIT requires this to
    /// succeed before the transaction is reported committed.
    pub fn flush(&self, _lsn: Lsn) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)?;
        file.sync_all()?;
        Ok(())
    }

    /// Copy the current WAL to `<wal>.bak`, truncate it, and reset the
    /// LSN counter. Called after a CHECKPOINT record is durable.
    pub fn truncate_with_backup(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.wal_path.is_file() {
            let mut bak = self.wal_path.as_os_str().to_owned();
            bak.push(".bak");
            std::fs::copy(&self.wal_path, PathBuf::from(bak))?;
        }
        File::create(&self.wal_path)?;
        state.cache.clear();
        state.next_lsn = 1;
        info!(path = %self.wal_path.display(), "wal truncated with backup");
        Ok(())
    }

    /// A previously appended record, from the in-memory cache.
    pub fn record(&self, lsn: Lsn) -> Option<LogRecord> {
        self.state.lock().unwrap().cache.get(&lsn).cloned()
    }

    /// All records currently in the WAL file.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        read_log_records(&self.wal_path)
    }
}

/// Read a WAL file from disk. A missing file yields no records; a
/// truncated trailing record ends the scan (the torn tail of a crash),
/// while a malformed header mid-stream is corruption.
pub fn read_log_records(path: &Path) -> Result<Vec<LogRecord>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut cur = codec::Cursor::new(&data);
    let mut out = Vec::new();
    while !cur.is_at_end() {
        if cur.remaining() < 8 + 8 + 4 {
            break; // torn tail
        }
        let lsn = cur.u64()?;
        let txn_id = cur.u64()?;
        let type_code = cur.u32()?;
        let log_type = match LogType::from_u32(type_code) {
            Some(t) => t,
            None => {
                return Err(Error::Corruption {
                    file: path.display().to_string(),
                    detail: format!("unknown log record type {type_code} at lsn {lsn}"),
                })
            }
        };
        let (table, offset, before, after) = match (|| -> Result<_> {
            let table = cur.string()?;
            let offset = cur.u64()?;
            let before = cur.bytes()?;
            let after = cur.bytes()?;
            Ok((table, offset, before, after))
        })() {
            Ok(parts) => parts,
            Err(_) => break, // torn tail inside the payload
        };
        out.push(LogRecord {
            lsn,
            txn_id,
            log_type,
            rid: Rid::new(table, offset),
            before,
            after,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_assigns_monotonic_lsns() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path().join("t.wal"), 1);

        let l1 = log.append(LogRecord::control(1, LogType::Begin)).unwrap();
        let l2 = log
            .append(LogRecord::change(
                1,
                LogType::Insert,
                Rid::new("t", 42),
                Vec::new(),
                vec![1, 2, 3],
            ))
            .unwrap();
        let l3 = log.append(LogRecord::control(1, LogType::Commit)).unwrap();
        assert!(l1 < l2 && l2 < l3);

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].rid, Rid::new("t", 42));
        assert_eq!(records[1].after, vec![1, 2, 3]);
        for pair in records.windows(2) {
            assert!(pair[1].lsn > pair[0].lsn);
        }
    }

    #[test]
    fn test_cache_returns_appended_records() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path().join("t.wal"), 5);
        let lsn = log
            .append(LogRecord::change(
                9,
                LogType::Update,
                Rid::new("t", 7),
                vec![1],
                vec![2],
            ))
            .unwrap();
        assert_eq!(lsn, 5);
        let rec = log.record(lsn).unwrap();
        assert_eq!(rec.before, vec![1]);
        assert!(log.record(99).is_none());
    }

    #[test]
    fn test_checkpoint_meta_roundtrip() {
        let meta = CheckpointMeta {
            version: CHECKPOINT_VERSION,
            checkpoint_lsn: 12,
            unix_seconds: 1_700_000_000,
        };
        let bytes = encode_checkpoint_meta(&meta);
        assert_eq!(decode_checkpoint_meta(&bytes), Some(meta));
        assert_eq!(decode_checkpoint_meta(b"nope"), None);
    }

    #[test]
    fn test_append_checkpoint_names_own_lsn() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(dir.path().join("t.wal"), 1);
        log.append(LogRecord::control(1, LogType::Begin)).unwrap();
        let lsn = log.append_checkpoint().unwrap();
        let records = log.read_all().unwrap();
        let meta = decode_checkpoint_meta(&records.last().unwrap().after).unwrap();
        assert_eq!(meta.checkpoint_lsn, lsn);
    }

    #[test]
    fn test_truncate_with_backup_resets() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("t.wal");
        let log = LogManager::new(&wal, 1);
        log.append(LogRecord::control(1, LogType::Begin)).unwrap();
        log.append(LogRecord::control(1, LogType::Commit)).unwrap();

        log.truncate_with_backup().unwrap();
        assert!(log.read_all().unwrap().is_empty());
        let bak = read_log_records(&dir.path().join("t.wal.bak")).unwrap();
        assert_eq!(bak.len(), 2);

        // LSN counter restarted.
        let lsn = log.append(LogRecord::control(2, LogType::Begin)).unwrap();
        assert_eq!(lsn, 1);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let wal = dir.path().join("t.wal");
        let log = LogManager::new(&wal, 1);
        log.append(LogRecord::control(1, LogType::Begin)).unwrap();
        log.append(LogRecord::change(
            1,
            LogType::Insert,
            Rid::new("t", 10),
            Vec::new(),
            vec![1, 1, 1],
        ))
        .unwrap();

        // Chop bytes off the last record.
        let bytes = std::fs::read(&wal).unwrap();
        std::fs::write(&wal, &bytes[..bytes.len() - 5]).unwrap();

        let records = read_log_records(&wal).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].log_type, LogType::Begin);
    }
}
