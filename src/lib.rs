//! quilldb - a small relational database engine written in Rust
//!
//! This library provides the transactional core of a SQL database:
//! - On-disk schema catalog, record heap and single-column indexes
//! - Write-ahead log with redo/undo crash recovery
//! - Row-level shared/exclusive locking with timeout semantics
//! - Transactions with savepoints and autocommit
//! - A SQL parser producing a typed command tree
//! - Query execution with joins, aggregation, subqueries and views
//! - DDL that maintains indexes and foreign-key integrity
//!
//! The outer layers (HTTP routing, JSON envelopes, authentication,
//! backups) sit above [`Dispatcher`], which accepts a session token
//! and raw SQL and returns row sets, statuses, or delegated commands.

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use dispatcher::{Dispatcher, Outcome, Session};
pub use error::{Error, ErrorKind, Result};
