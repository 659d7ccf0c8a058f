//! On-disk storage for quilldb
//!
//! - `paths`: data-root resolution and per-database file layout
//! - `codec`: length-prefixed binary primitives shared by every format
//! - `engine`: `.dbf` / `.dat` / `.idx` reading and writing
//! - `wal`: the append-only write-ahead log
//! - `recovery`: ARIES-style redo/undo replay at startup

pub mod codec;
pub mod engine;
pub mod paths;
pub mod recovery;
pub mod wal;

pub use engine::StorageEngine;
pub use paths::DbPaths;
pub use recovery::{recover_all, recover_database, RecoveryOutcome, RecoveryReport};
pub use wal::{LogManager, LogRecord, LogType, Lsn, Rid, TxnId};
