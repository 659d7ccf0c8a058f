//! Command dispatcher and sessions
//!
//! The boundary the outer layers call: a session token plus raw SQL
//! in, row sets or statuses out. Runs recovery at open, owns the lock
//! manager and transaction manager, enforces autocommit and the
//! DDL-outside-transactions rule, and rebuilds indexes for touched
//! tables after every commit or rollback.
//!
//! User/privilege and backup commands belong to layers above the
//! engine; they come back as [`Outcome::Delegated`] so those layers
//! can act on the parsed command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::{Record, ReferentialAction};
use crate::error::{Error, Result};
use crate::executor::{DdlService, DmlService, QueryContext, QueryOutput, QueryService};
use crate::sql::ast::{AlterOp, Command};
use crate::sql::Parser;
use crate::storage::paths::{self, DbPaths};
use crate::storage::recovery;
use crate::storage::StorageEngine;
use crate::transaction::{LockManager, TransactionManager, Txn};

/// Database used when the session has not issued USE.
pub const DEFAULT_DB: &str = "default";

/// Per-token session state.
#[derive(Debug)]
pub struct Session {
    pub current_db: String,
    pub autocommit: bool,
    pub txn: Option<Txn>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            current_db: DEFAULT_DB.to_string(),
            autocommit: true,
            txn: None,
        }
    }
}

/// Result of one statement.
#[derive(Debug, Serialize)]
pub enum Outcome {
    /// A row set from SELECT / SHOW.
    Rows(QueryOutput),
    /// A status with the affected-row count.
    Status {
        message: String,
        affected_rows: usize,
    },
    /// A command owned by an outer layer (auth, backup copier).
    Delegated(Command),
}

impl Outcome {
    fn status(message: impl Into<String>) -> Self {
        Outcome::Status {
            message: message.into(),
            affected_rows: 0,
        }
    }

    fn affected(message: impl Into<String>, affected_rows: usize) -> Self {
        Outcome::Status {
            message: message.into(),
            affected_rows,
        }
    }
}

/// The engine facade: sessions keyed by opaque caller token.
pub struct Dispatcher {
    root: PathBuf,
    engine: StorageEngine,
    locks: Arc<LockManager>,
    txns: TransactionManager,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Dispatcher {
    /// Open the engine over a data root, replaying every database's
    /// WAL before accepting commands.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let report = recovery::recover_all(&root)?;
        info!(root = %root.display(), next_txn = report.next_txn_id, "engine opened");
        Ok(Self {
            engine: StorageEngine::new(),
            locks: Arc::new(LockManager::new()),
            txns: TransactionManager::new(root.clone(), report.next_txn_id, report.next_lsn_by_db),
            sessions: Mutex::new(HashMap::new()),
            root,
        })
    }

    /// Open over the `DBMS_DATA_DIR` root (or `./data`).
    pub fn open_default() -> Result<Self> {
        Self::open(paths::data_root())
    }

    /// Parse a statement or script and execute it under the given
    /// session token. Statements run in order; the first error stops
    /// the script.
    pub fn execute(&self, token: &str, sql: &str) -> Result<Vec<Outcome>> {
        let commands = Parser::parse_script(sql)?;
        let mut session = self
            .sessions
            .lock()
            .unwrap()
            .remove(token)
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(commands.len());
        let mut failure = None;
        for cmd in commands {
            match self.execute_command(&mut session, cmd) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.sessions
            .lock()
            .unwrap()
            .insert(token.to_string(), session);
        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    fn paths_for(&self, db: &str) -> DbPaths {
        DbPaths::new(&self.root, db)
    }

    fn require_no_txn(&self, session: &Session, what: &str) -> Result<()> {
        if session.txn.is_some() {
            return Err(Error::TxnState(format!(
                "{what} not allowed in an active transaction"
            )));
        }
        Ok(())
    }

    fn execute_command(&self, session: &mut Session, cmd: Command) -> Result<Outcome> {
        match cmd {
            // ========== Transactions ==========
            Command::Begin => {
                if session.txn.is_some() {
                    return Err(Error::TxnState("transaction already active".into()));
                }
                self.paths_for(&session.current_db).ensure_dirs()?;
                let txn = self.txns.begin(&session.current_db)?;
                session.txn = Some(txn);
                session.autocommit = false;
                Ok(Outcome::status("Transaction started"))
            }
            Command::Commit => {
                self.finish_txn(session, true)?;
                Ok(Outcome::status("Transaction committed"))
            }
            Command::Rollback => {
                self.finish_txn(session, false)?;
                Ok(Outcome::status("Transaction rolled back"))
            }
            Command::Savepoint { name } => {
                let txn = session
                    .txn
                    .as_mut()
                    .ok_or_else(|| Error::TxnState("no active transaction".into()))?;
                self.txns.savepoint(txn, &name)?;
                Ok(Outcome::status("Savepoint created"))
            }
            Command::RollbackToSavepoint { name } => {
                let txn = session
                    .txn
                    .as_mut()
                    .ok_or_else(|| Error::TxnState("no active transaction".into()))?;
                self.txns.rollback_to_savepoint(txn, &name)?;
                Ok(Outcome::status("Rolled back to savepoint"))
            }
            Command::ReleaseSavepoint { name } => {
                let txn = session
                    .txn
                    .as_mut()
                    .ok_or_else(|| Error::TxnState("no active transaction".into()))?;
                self.txns.release_savepoint(txn, &name)?;
                Ok(Outcome::status("Savepoint released"))
            }
            Command::Checkpoint => {
                self.require_no_txn(session, "CHECKPOINT")?;
                self.paths_for(&session.current_db).ensure_dirs()?;
                let log = self.txns.log_for(&session.current_db);
                let lsn = log.append_checkpoint()?;
                log.flush(lsn)?;
                log.truncate_with_backup()?;
                Ok(Outcome::status("Checkpoint created"))
            }

            // ========== Databases ==========
            Command::CreateDatabase { db } => {
                self.engine.create_database(&self.root, &db)?;
                Ok(Outcome::status(format!("Database '{db}' created")))
            }
            Command::DropDatabase { db, action } => {
                self.require_no_txn(session, "DROP DATABASE")?;
                let paths = self.paths_for(&db);
                if !paths.exists() {
                    return Err(Error::DatabaseNotFound(db));
                }
                if action.unwrap_or(ReferentialAction::Restrict) == ReferentialAction::Restrict {
                    let schemas = self.engine.load_schemas(&paths.dbf)?;
                    if schemas.iter().any(|s| !s.foreign_keys.is_empty()) {
                        return Err(Error::RestrictViolation(db));
                    }
                }
                self.engine.drop_database(&self.root, &db)?;
                Ok(Outcome::status(format!("Database '{db}' dropped")))
            }
            Command::UseDatabase { db } => {
                self.require_no_txn(session, "USE")?;
                if !self.paths_for(&db).exists() {
                    return Err(Error::DatabaseNotFound(db));
                }
                session.current_db = db.clone();
                Ok(Outcome::status(format!("Using database '{db}'")))
            }
            Command::ShowTables { db } => {
                let db = db.unwrap_or_else(|| session.current_db.clone());
                let schemas = self.engine.load_schemas(&self.paths_for(&db).dbf)?;
                let rows = schemas
                    .iter()
                    .map(|s| {
                        Record::from_strs(&[
                            &s.name,
                            if s.is_view { "VIEW" } else { "TABLE" },
                        ])
                    })
                    .collect();
                Ok(Outcome::Rows(QueryOutput {
                    columns: vec!["name".to_string(), "type".to_string()],
                    rows,
                }))
            }
            Command::ShowIndexes { table } => {
                let paths = self.paths_for(&session.current_db);
                let indexes = DdlService::new(&paths).list_indexes(&table)?;
                let rows = indexes
                    .iter()
                    .map(|idx| {
                        Record::from_strs(&[
                            &idx.name,
                            &idx.column,
                            if idx.unique { "YES" } else { "NO" },
                        ])
                    })
                    .collect();
                Ok(Outcome::Rows(QueryOutput {
                    columns: vec![
                        "index_name".to_string(),
                        "column".to_string(),
                        "unique".to_string(),
                    ],
                    rows,
                }))
            }

            // ========== DDL ==========
            Command::CreateTable { schema, db } => {
                self.require_no_txn(session, "CREATE TABLE")?;
                let db = db.unwrap_or_else(|| session.current_db.clone());
                let paths = self.paths_for(&db);
                paths.ensure_dirs()?;
                let name = schema.name.clone();
                DdlService::new(&paths).create_table(&schema)?;
                Ok(Outcome::status(format!("Table '{name}' created")))
            }
            Command::DropTable { table, action } => {
                self.require_no_txn(session, "DROP TABLE")?;
                let paths = self.paths_for(&session.current_db);
                DdlService::new(&paths)
                    .drop_table(&table, action.unwrap_or(ReferentialAction::Restrict))?;
                Ok(Outcome::status(format!("Table '{table}' dropped")))
            }
            Command::RenameTable { table, new_name } => {
                self.require_no_txn(session, "RENAME TABLE")?;
                let paths = self.paths_for(&session.current_db);
                DdlService::new(&paths).rename_table(&table, &new_name)?;
                Ok(Outcome::status(format!(
                    "Table '{table}' renamed to '{new_name}'"
                )))
            }
            Command::AlterTable { table, op } => {
                self.require_no_txn(session, "ALTER TABLE")?;
                let paths = self.paths_for(&session.current_db);
                let ddl = DdlService::new(&paths);
                match op {
                    AlterOp::AddColumn { field, position } => {
                        ddl.add_column(&table, field, &position)?
                    }
                    AlterOp::DropColumn { column } => ddl.drop_column(&table, &column)?,
                    AlterOp::ModifyColumn { field } => ddl.modify_column(&table, field)?,
                    AlterOp::RenameColumn { column, new_name } => {
                        ddl.rename_column(&table, &column, &new_name)?
                    }
                    AlterOp::RenameTable { new_name } => ddl.rename_table(&table, &new_name)?,
                    AlterOp::AddIndex { index, column } => {
                        ddl.create_index(&table, &column, &index, false)?
                    }
                    AlterOp::DropIndex { index } => ddl.drop_index(&table, &index)?,
                    AlterOp::AddForeignKey { fk } => ddl.add_foreign_key(&table, fk)?,
                    AlterOp::DropForeignKey { name } => ddl.drop_foreign_key(&table, &name)?,
                }
                Ok(Outcome::status(format!("Table '{table}' altered")))
            }
            Command::CreateIndex {
                index,
                table,
                column,
                unique,
            } => {
                self.require_no_txn(session, "CREATE INDEX")?;
                let paths = self.paths_for(&session.current_db);
                paths.ensure_dirs()?;
                DdlService::new(&paths).create_index(&table, &column, &index, unique)?;
                Ok(Outcome::status(format!("Index '{index}' created")))
            }
            Command::DropIndex { index, table } => {
                self.require_no_txn(session, "DROP INDEX")?;
                let paths = self.paths_for(&session.current_db);
                DdlService::new(&paths).drop_index(&table, &index)?;
                Ok(Outcome::status(format!("Index '{index}' dropped")))
            }
            Command::CreateView {
                view,
                columns,
                query,
                sql,
                or_replace,
            } => {
                self.require_no_txn(session, "CREATE VIEW")?;
                let paths = self.paths_for(&session.current_db);
                paths.ensure_dirs()?;
                DdlService::new(&paths).create_view(&view, &columns, &query, &sql, or_replace)?;
                Ok(Outcome::status(format!("View '{view}' created")))
            }
            Command::DropView { view, if_exists } => {
                self.require_no_txn(session, "DROP VIEW")?;
                let paths = self.paths_for(&session.current_db);
                DdlService::new(&paths).drop_view(&view, if_exists)?;
                Ok(Outcome::status(format!("View '{view}' dropped")))
            }

            // ========== DML ==========
            Command::Insert {
                table,
                columns,
                records,
                db,
            } => {
                let db = db.unwrap_or_else(|| session.current_db.clone());
                self.with_txn(session, &db, |this, txn| {
                    let paths = this.paths_for(&db);
                    let schemas = this.engine.load_schemas(&paths.dbf)?;
                    let schema = schemas
                        .iter()
                        .find(|s| s.name.eq_ignore_ascii_case(&table))
                        .ok_or_else(|| Error::TableNotFound(table.clone()))?;
                    let log = this.txns.log_for(&db);
                    let dml = DmlService::new(&paths, &this.locks, &log);
                    let inserted = dml.insert(txn, schema, &schemas, &columns, records)?;
                    Ok(Outcome::affected(
                        format!("{inserted} row(s) inserted"),
                        inserted,
                    ))
                })
            }
            Command::Update {
                table,
                assignments,
                conditions,
            } => {
                let db = session.current_db.clone();
                self.with_txn(session, &db, |this, txn| {
                    let paths = this.paths_for(&db);
                    let schemas = this.engine.load_schemas(&paths.dbf)?;
                    let schema = schemas
                        .iter()
                        .find(|s| s.name.eq_ignore_ascii_case(&table))
                        .ok_or_else(|| Error::TableNotFound(table.clone()))?;
                    let log = this.txns.log_for(&db);
                    let dml = DmlService::new(&paths, &this.locks, &log);
                    let updated = dml.update(txn, schema, &schemas, &assignments, &conditions)?;
                    Ok(Outcome::affected(
                        format!("{updated} row(s) updated"),
                        updated,
                    ))
                })
            }
            Command::Delete {
                table,
                conditions,
                action,
            } => {
                let db = session.current_db.clone();
                self.with_txn(session, &db, |this, txn| {
                    let paths = this.paths_for(&db);
                    let schemas = this.engine.load_schemas(&paths.dbf)?;
                    let schema = schemas
                        .iter()
                        .find(|s| s.name.eq_ignore_ascii_case(&table))
                        .ok_or_else(|| Error::TableNotFound(table.clone()))?;
                    let log = this.txns.log_for(&db);
                    let dml = DmlService::new(&paths, &this.locks, &log);
                    let deleted = dml.delete(txn, schema, &schemas, &conditions, action)?;
                    Ok(Outcome::affected(
                        format!("{deleted} row(s) deleted"),
                        deleted,
                    ))
                })
            }
            Command::Select { plan } => {
                let db = session.current_db.clone();
                self.with_txn(session, &db, |this, txn| {
                    let paths = this.paths_for(&db);
                    let query = QueryService::new(&paths, &this.locks, txn.id);
                    let mut ctx = QueryContext::new();
                    let output = query.select(&plan, &mut ctx)?;
                    Ok(Outcome::Rows(output))
                })
            }

            // ========== Delegated to outer layers ==========
            cmd @ (Command::CreateUser { .. }
            | Command::DropUser { .. }
            | Command::Grant { .. }
            | Command::Revoke { .. }
            | Command::BackupDatabase { .. }
            | Command::RestoreDatabase { .. }) => Ok(Outcome::Delegated(cmd)),
        }
    }

    /// Run a DML/SELECT body inside the session's transaction, or an
    /// implicit autocommit transaction when none is active. Errors
    /// roll the implicit transaction back; a lock timeout rolls back
    /// even an explicit one.
    fn with_txn<F>(&self, session: &mut Session, db: &str, body: F) -> Result<Outcome>
    where
        F: FnOnce(&Self, &mut Txn) -> Result<Outcome>,
    {
        let implicit = session.txn.is_none();
        if implicit {
            if !session.autocommit {
                return Err(Error::TxnState("no active transaction".into()));
            }
            self.paths_for(db).ensure_dirs()?;
            session.txn = Some(self.txns.begin(db)?);
        } else if let Some(txn) = &session.txn {
            if !txn.db_name.eq_ignore_ascii_case(db) {
                return Err(Error::TxnState(format!(
                    "transaction is bound to database '{}'",
                    txn.db_name
                )));
            }
        }

        let result = body(self, session.txn.as_mut().expect("transaction installed"));
        match result {
            Ok(outcome) => {
                if implicit {
                    self.finish_txn(session, true)?;
                }
                Ok(outcome)
            }
            Err(e) => {
                if implicit || matches!(e, Error::LockTimeout(_)) {
                    if let Err(rb) = self.finish_txn(session, false) {
                        warn!(error = %rb, "rollback after failed statement also failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Commit or roll back the session's transaction, release its
    /// locks, and rebuild indexes for every touched table.
    fn finish_txn(&self, session: &mut Session, commit: bool) -> Result<()> {
        let mut txn = session
            .txn
            .take()
            .ok_or_else(|| Error::TxnState("no active transaction".into()))?;
        let result = if commit {
            self.txns.commit(&mut txn)
        } else {
            self.txns.rollback(&mut txn)
        };
        self.locks.release_all(txn.id);
        session.autocommit = true;
        if result.is_ok() {
            let paths = self.paths_for(&txn.db_name);
            let ddl = DdlService::new(&paths);
            for table in &txn.touched_tables {
                if let Err(e) = ddl.rebuild_indexes(table) {
                    warn!(table, error = %e, "index rebuild failed");
                }
            }
        }
        result
    }
}
