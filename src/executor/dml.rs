//! INSERT / UPDATE / DELETE under WAL and row locks
//!
//! Every mutation follows the same discipline: read the affected rows
//! with their RIDs, take exclusive locks, write the WAL record, then
//! change the heap. Updates that would change the serialized length
//! fall back to a logged DELETE plus a logged INSERT at a fresh RID.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::catalog::{Record, ReferentialAction, TableSchema, NULL_TEXT};
use crate::error::{Error, Result};
use crate::executor::predicate;
use crate::sql::ast::Condition;
use crate::storage::paths::DbPaths;
use crate::storage::wal::{LogManager, LogRecord, LogType, Rid};
use crate::storage::StorageEngine;
use crate::transaction::{LockManager, Txn};

/// Separator joining composite key tuples into one index/PK key.
const KEY_SEP: char = '\x1f';

/// Referring-side entry of the FK graph: which table points here, and
/// through which constraint.
struct Referrer<'s> {
    child: &'s TableSchema,
    fk: &'s crate::catalog::ForeignKeyDef,
}

/// Mutating executor over one database.
pub struct DmlService<'a> {
    engine: StorageEngine,
    paths: &'a DbPaths,
    locks: &'a LockManager,
    log: &'a LogManager,
}

impl<'a> DmlService<'a> {
    pub fn new(paths: &'a DbPaths, locks: &'a LockManager, log: &'a LogManager) -> Self {
        Self {
            engine: StorageEngine::new(),
            paths,
            locks,
            log,
        }
    }

    // ========== INSERT ==========

    /// Insert records, enforcing PK uniqueness and FK integrity.
    /// `columns` reorders the values when the statement names columns.
    pub fn insert(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        schemas: &[TableSchema],
        columns: &[String],
        records: Vec<Record>,
    ) -> Result<usize> {
        if schema.is_view {
            return Err(Error::NotSupported(format!(
                "cannot insert into view '{}'",
                schema.name
            )));
        }
        let records = self.fit_records(schema, columns, records)?;

        // PK uniqueness across live rows and within the batch.
        let key_positions: Vec<usize> = schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_key)
            .map(|(i, _)| i)
            .collect();
        if !key_positions.is_empty() {
            let mut seen: HashSet<String> = self
                .engine
                .read_records_with_offsets(&self.paths.dat, schema)?
                .iter()
                .map(|(_, r)| key_tuple(r, &key_positions))
                .collect();
            for record in &records {
                let key = key_tuple(record, &key_positions);
                if !seen.insert(key.clone()) {
                    return Err(Error::DuplicateKey {
                        key: "PRIMARY".to_string(),
                        value: key.replace(KEY_SEP, ","),
                    });
                }
            }
        }

        // NOT NULL and FK checks per record.
        for record in &records {
            for (i, field) in schema.fields.iter().enumerate() {
                if !field.nullable && predicate::is_null(&record.values[i]) {
                    return Err(Error::NotNullable(field.name.clone()));
                }
            }
            for fk in &schema.foreign_keys {
                self.check_fk_tuple(schema, record, fk, schemas)?;
            }
        }

        for record in &records {
            self.logged_insert(txn, schema, record)?;
        }
        debug!(txn = txn.id, table = %schema.name, rows = records.len(), "insert");
        Ok(records.len())
    }

    /// Reorder named-column values into schema order, padding omitted
    /// columns with NULL.
    fn fit_records(
        &self,
        schema: &TableSchema,
        columns: &[String],
        records: Vec<Record>,
    ) -> Result<Vec<Record>> {
        if columns.is_empty() {
            for record in &records {
                if record.values.len() != schema.fields.len() {
                    return Err(Error::FieldCountMismatch(schema.name.clone()));
                }
            }
            return Ok(records);
        }
        let mut positions = Vec::with_capacity(columns.len());
        for col in columns {
            let i = schema
                .field_index(col)
                .ok_or_else(|| Error::ColumnNotFound(col.clone(), schema.name.clone()))?;
            positions.push(i);
        }
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            if record.values.len() != positions.len() {
                return Err(Error::FieldCountMismatch(schema.name.clone()));
            }
            let mut values = vec![NULL_TEXT.to_string(); schema.fields.len()];
            for (value, &pos) in record.values.into_iter().zip(&positions) {
                values[pos] = value;
            }
            out.push(Record::new(values));
        }
        Ok(out)
    }

    /// WAL-logged append: predict the RID, X-lock it, log, then write,
    /// failing when the append lands elsewhere than logged.
    fn logged_insert(&self, txn: &mut Txn, schema: &TableSchema, record: &Record) -> Result<u64> {
        let offset = self
            .engine
            .compute_append_record_offset(&self.paths.dat, schema)?;
        let rid = Rid::new(&schema.name, offset);
        self.locks.lock_exclusive(txn.id, &rid)?;
        let after = self.engine.serialize_record(schema, record)?;
        let lsn = self.log.append(LogRecord::change(
            txn.id,
            LogType::Insert,
            rid,
            Vec::new(),
            after,
        ))?;
        txn.undo_chain.push(lsn);
        let actual = self.engine.append_record(&self.paths.dat, schema, record)?;
        if actual != offset {
            return Err(Error::WalOffsetMismatch {
                table: schema.name.clone(),
                expected: offset,
                actual,
            });
        }
        txn.touch(&schema.name);
        Ok(offset)
    }

    // ========== UPDATE ==========

    /// Update rows matching the conditions. Returns the matched count.
    pub fn update(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        schemas: &[TableSchema],
        assignments: &[(String, String)],
        conditions: &[Condition],
    ) -> Result<usize> {
        if schema.is_view {
            return Err(Error::NotSupported(format!(
                "cannot update view '{}'",
                schema.name
            )));
        }
        let mut positions = Vec::with_capacity(assignments.len());
        for (col, value) in assignments {
            let i = schema
                .field_index(col)
                .ok_or_else(|| Error::ColumnNotFound(col.clone(), schema.name.clone()))?;
            let field = &schema.fields[i];
            if !field.nullable && predicate::is_null(value) {
                return Err(Error::NotNullable(field.name.clone()));
            }
            positions.push(i);
        }
        let touches_fk = schema.foreign_keys.iter().any(|fk| {
            fk.columns
                .iter()
                .any(|c| assignments.iter().any(|(col, _)| col.eq_ignore_ascii_case(c)))
        });
        let key_positions: Vec<usize> = schema
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_key)
            .map(|(i, _)| i)
            .collect();
        let touches_key = positions.iter().any(|p| key_positions.contains(p));

        let rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, schema)?;

        // Live key tuples for the PK re-check when a key column moves.
        let mut live_keys: HashMap<String, u64> = HashMap::new();
        if touches_key {
            for (offset, record) in &rows {
                live_keys.insert(key_tuple(record, &key_positions), *offset);
            }
        }

        let mut affected = 0usize;
        for (offset, record) in &rows {
            if !predicate::match_conditions(schema, record, conditions)? {
                continue;
            }
            let mut updated = record.clone();
            for ((_, value), &pos) in assignments.iter().zip(&positions) {
                updated.values[pos] = value.clone();
            }

            if touches_key {
                let key = key_tuple(&updated, &key_positions);
                match live_keys.get(&key) {
                    Some(owner) if owner != offset => {
                        return Err(Error::DuplicateKey {
                            key: "PRIMARY".to_string(),
                            value: key.replace(KEY_SEP, ","),
                        });
                    }
                    _ => {
                        live_keys.remove(&key_tuple(record, &key_positions));
                        live_keys.insert(key, *offset);
                    }
                }
            }
            if touches_fk {
                for fk in &schema.foreign_keys {
                    self.check_fk_tuple(schema, &updated, fk, schemas)?;
                }
            }

            self.update_row(txn, schema, *offset, record, &updated)?;
            affected += 1;
        }
        debug!(txn = txn.id, table = %schema.name, rows = affected, "update");
        Ok(affected)
    }

    /// In-place overwrite when the image length is unchanged; logged
    /// DELETE + INSERT otherwise.
    fn update_row(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        offset: u64,
        before_record: &Record,
        after_record: &Record,
    ) -> Result<()> {
        let rid = Rid::new(&schema.name, offset);
        self.locks.lock_exclusive(txn.id, &rid)?;
        let before = self.engine.serialize_record(schema, before_record)?;
        match self
            .engine
            .serialize_fixed_length(schema, after_record, before.len(), offset)
        {
            Ok(after) => {
                let lsn = self.log.append(LogRecord::change(
                    txn.id,
                    LogType::Update,
                    rid,
                    before,
                    after.clone(),
                ))?;
                txn.undo_chain.push(lsn);
                self.engine
                    .write_record_bytes_at(&self.paths.dat, offset, &after)?;
                txn.touch(&schema.name);
                Ok(())
            }
            Err(Error::RecordLengthChanged { .. }) => {
                // The new image does not fit in place: tombstone the
                // old RID and append the new image as its own insert.
                self.tombstone_row(txn, schema, offset, &before)?;
                self.logged_insert(txn, schema, after_record)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Logged DELETE: clear the valid byte in place.
    fn tombstone_row(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        offset: u64,
        before: &[u8],
    ) -> Result<()> {
        let rid = Rid::new(&schema.name, offset);
        self.locks.lock_exclusive(txn.id, &rid)?;
        let lsn = self.log.append(LogRecord::change(
            txn.id,
            LogType::Delete,
            rid,
            before.to_vec(),
            Vec::new(),
        ))?;
        txn.undo_chain.push(lsn);
        let mut tomb = before.to_vec();
        tomb[0] = 0;
        self.engine
            .write_record_bytes_at(&self.paths.dat, offset, &tomb)?;
        txn.touch(&schema.name);
        Ok(())
    }

    // ========== DELETE ==========

    /// Delete rows matching the conditions, honoring per-FK on-delete
    /// actions (overridden by an explicit statement action).
    pub fn delete(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        schemas: &[TableSchema],
        conditions: &[Condition],
        action_override: Option<ReferentialAction>,
    ) -> Result<usize> {
        if schema.is_view {
            return Err(Error::NotSupported(format!(
                "cannot delete from view '{}'",
                schema.name
            )));
        }
        let rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, schema)?;
        let mut targets = Vec::new();
        for (offset, record) in rows {
            if predicate::match_conditions(schema, &record, conditions)? {
                targets.push((offset, record));
            }
        }
        let count = targets.len();
        let mut deleted = HashSet::new();
        for (offset, record) in targets {
            self.delete_row(
                txn,
                schema,
                schemas,
                offset,
                &record,
                action_override,
                &mut deleted,
            )?;
        }
        debug!(txn = txn.id, table = %schema.name, rows = count, "delete");
        Ok(count)
    }

    /// Delete one row: apply referential actions on every referring
    /// table, then tombstone. `deleted` breaks cascade cycles.
    #[allow(clippy::too_many_arguments)]
    fn delete_row(
        &self,
        txn: &mut Txn,
        schema: &TableSchema,
        schemas: &[TableSchema],
        offset: u64,
        record: &Record,
        action_override: Option<ReferentialAction>,
        deleted: &mut HashSet<(String, u64)>,
    ) -> Result<()> {
        if !deleted.insert((schema.name.to_ascii_lowercase(), offset)) {
            return Ok(());
        }

        for referrer in referrers_of(schemas, &schema.name) {
            let action = action_override.unwrap_or(referrer.fk.on_delete);
            let ref_columns = resolved_ref_columns(schema, referrer.fk);
            let parent_values: Vec<String> = ref_columns
                .iter()
                .map(|c| {
                    schema
                        .field_index(c)
                        .and_then(|i| record.values.get(i))
                        .map(|v| predicate::normalize_value(v).to_string())
                        .unwrap_or_default()
                })
                .collect();

            let child_rows = self
                .engine
                .read_records_with_offsets(&self.paths.dat, referrer.child)?;
            let child_positions: Vec<Option<usize>> = referrer
                .fk
                .columns
                .iter()
                .map(|c| referrer.child.field_index(c))
                .collect();
            let matching: Vec<(u64, Record)> = child_rows
                .into_iter()
                .filter(|(_, child)| {
                    child_positions.iter().zip(&parent_values).all(|(pos, pv)| {
                        pos.and_then(|i| child.values.get(i))
                            .map(|v| {
                                let v = predicate::normalize_value(v);
                                !predicate::is_null(v) && v == pv
                            })
                            .unwrap_or(false)
                    })
                })
                .collect();
            if matching.is_empty() {
                continue;
            }

            match action {
                ReferentialAction::Restrict => {
                    return Err(Error::RestrictViolation(referrer.child.name.clone()));
                }
                ReferentialAction::Cascade => {
                    for (child_offset, child_record) in matching {
                        self.delete_row(
                            txn,
                            referrer.child,
                            schemas,
                            child_offset,
                            &child_record,
                            action_override,
                            deleted,
                        )?;
                    }
                }
                ReferentialAction::SetNull => {
                    for pos in child_positions.iter().flatten() {
                        let field = &referrer.child.fields[*pos];
                        if !field.nullable {
                            return Err(Error::NotNullable(field.name.clone()));
                        }
                    }
                    for (child_offset, child_record) in matching {
                        let mut updated = child_record.clone();
                        for pos in child_positions.iter().flatten() {
                            updated.values[*pos] = NULL_TEXT.to_string();
                        }
                        self.update_row(
                            txn,
                            referrer.child,
                            child_offset,
                            &child_record,
                            &updated,
                        )?;
                    }
                }
            }
        }

        let before = self.engine.serialize_record(schema, record)?;
        self.tombstone_row(txn, schema, offset, &before)
    }

    // ========== Foreign-key probes ==========

    /// Verify one record's FK tuple against the referenced table,
    /// probing the referenced column's index when one exists.
    fn check_fk_tuple(
        &self,
        schema: &TableSchema,
        record: &Record,
        fk: &crate::catalog::ForeignKeyDef,
        schemas: &[TableSchema],
    ) -> Result<()> {
        let mut tuple = Vec::with_capacity(fk.columns.len());
        for col in &fk.columns {
            let i = schema
                .field_index(col)
                .ok_or_else(|| Error::ColumnNotFound(col.clone(), schema.name.clone()))?;
            let v = predicate::normalize_value(&record.values[i]);
            if predicate::is_null(v) {
                return Ok(()); // NULL tuples are never violations
            }
            tuple.push(v.to_string());
        }
        let ref_schema = schemas
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(&fk.ref_table))
            .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?;
        let ref_columns = resolved_ref_columns(ref_schema, fk);
        if ref_columns.len() != tuple.len() {
            return Err(Error::ForeignKeyViolation(format!(
                "constraint '{}' column count mismatch",
                fk.name
            )));
        }

        // Single-column keys go through the index when available.
        if tuple.len() == 1 {
            if let Some(index_def) = ref_schema.index_on(&ref_columns[0]) {
                let path = self.paths.index_file(&ref_schema.name, &index_def.name);
                let index = self.engine.load_index(&path)?;
                if let Some(offset) = index.get(&tuple[0]) {
                    let hit = self
                        .engine
                        .read_record_at(&self.paths.dat, ref_schema, *offset)?;
                    if hit.valid {
                        return Ok(());
                    }
                }
                return Err(Error::ForeignKeyViolation(format!(
                    "no row in '{}' matches {}",
                    fk.ref_table,
                    tuple.join(",")
                )));
            }
        }

        let ref_positions: Vec<usize> = ref_columns
            .iter()
            .map(|c| {
                ref_schema
                    .field_index(c)
                    .ok_or_else(|| Error::ColumnNotFound(c.clone(), ref_schema.name.clone()))
            })
            .collect::<Result<_>>()?;
        let found = self
            .engine
            .read_records_with_offsets(&self.paths.dat, ref_schema)?
            .iter()
            .any(|(_, r)| {
                ref_positions.iter().zip(&tuple).all(|(i, t)| {
                    r.values
                        .get(*i)
                        .map(|v| predicate::normalize_value(v) == t)
                        .unwrap_or(false)
                })
            });
        if found {
            Ok(())
        } else {
            Err(Error::ForeignKeyViolation(format!(
                "no row in '{}' matches {}",
                fk.ref_table,
                tuple.join(",")
            )))
        }
    }
}

/// Composite key tuple of a record, normalized and joined by the unit
/// separator.
fn key_tuple(record: &Record, positions: &[usize]) -> String {
    let mut out = String::new();
    for (n, &i) in positions.iter().enumerate() {
        if n > 0 {
            out.push(KEY_SEP);
        }
        if let Some(v) = record.values.get(i) {
            out.push_str(predicate::normalize_value(v));
        }
    }
    out
}

/// All (child schema, fk) pairs referencing the given table.
fn referrers_of<'s>(schemas: &'s [TableSchema], table: &str) -> Vec<Referrer<'s>> {
    let mut out = Vec::new();
    for child in schemas {
        for fk in &child.foreign_keys {
            if fk.ref_table.eq_ignore_ascii_case(table) {
                out.push(Referrer { child, fk });
            }
        }
    }
    out
}

/// The referenced columns of an FK, defaulting to the referenced
/// table's primary key when the constraint omits them.
fn resolved_ref_columns(
    ref_schema: &TableSchema,
    fk: &crate::catalog::ForeignKeyDef,
) -> Vec<String> {
    if !fk.ref_columns.is_empty() {
        return fk.ref_columns.clone();
    }
    let keys: Vec<String> = ref_schema
        .key_columns()
        .iter()
        .map(|s| s.to_string())
        .collect();
    if !keys.is_empty() && keys.len() == fk.columns.len() {
        return keys;
    }
    fk.columns.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Field;

    #[test]
    fn test_key_tuple_joins_with_unit_separator() {
        let rec = Record::from_strs(&["1", "x", "2"]);
        assert_eq!(key_tuple(&rec, &[0, 2]), "1\u{1f}2");
    }

    #[test]
    fn test_referrers_of() {
        let parent = TableSchema::new("parent");
        let mut child = TableSchema::new("child");
        child.foreign_keys.push(crate::catalog::ForeignKeyDef {
            name: "fk".to_string(),
            columns: vec!["pid".to_string()],
            ref_table: "PARENT".to_string(),
            ref_columns: vec!["id".to_string()],
            on_delete: ReferentialAction::Restrict,
            on_update: ReferentialAction::Restrict,
        });
        let schemas = vec![parent, child];
        let refs = referrers_of(&schemas, "parent");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].child.name, "child");
    }

    #[test]
    fn test_resolved_ref_columns_defaults_to_pk() {
        let mut parent = TableSchema::new("parent");
        parent.fields.push(Field::new("id", "int").key());
        parent.fields.push(Field::new("name", "char[4]"));
        let fk = crate::catalog::ForeignKeyDef {
            name: "fk".to_string(),
            columns: vec!["pid".to_string()],
            ref_table: "parent".to_string(),
            ref_columns: Vec::new(),
            on_delete: ReferentialAction::Restrict,
            on_update: ReferentialAction::Restrict,
        };
        assert_eq!(resolved_ref_columns(&parent, &fk), vec!["id"]);
    }
}
