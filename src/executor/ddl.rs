//! DDL: tables, columns, indexes, foreign keys, views
//!
//! Schemas are treated as immutable values: every operation loads the
//! catalog, builds a new schema list, and saves it back, so readers
//! never observe a half-mutated schema.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::catalog::{
    Field, ForeignKeyDef, IndexDef, Record, ReferentialAction, TableSchema, NULL_TEXT,
};
use crate::error::{Error, Result};
use crate::executor::predicate;
use crate::sql::ast::{ColumnPosition, Command, QueryPlan, SelectItem};
use crate::sql::Parser;
use crate::storage::paths::DbPaths;
use crate::storage::StorageEngine;

/// Schema-change executor over one database.
pub struct DdlService<'a> {
    engine: StorageEngine,
    paths: &'a DbPaths,
}

impl<'a> DdlService<'a> {
    pub fn new(paths: &'a DbPaths) -> Self {
        Self {
            engine: StorageEngine::new(),
            paths,
        }
    }

    fn load_schemas(&self) -> Vec<TableSchema> {
        self.engine.load_schemas(&self.paths.dbf).unwrap_or_default()
    }

    fn find<'s>(
        &self,
        schemas: &'s [TableSchema],
        table: &str,
    ) -> Result<(usize, &'s TableSchema)> {
        schemas
            .iter()
            .enumerate()
            .find(|(_, s)| s.name.eq_ignore_ascii_case(table))
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    // ========== Tables ==========

    /// Create a table: auto-index key columns as PRIMARY, validate and
    /// normalize foreign keys, persist schema, and seed empty data and
    /// index files.
    pub fn create_table(&self, schema: &TableSchema) -> Result<()> {
        let schemas = self.load_schemas();
        if schemas
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(&schema.name))
        {
            return Err(Error::TableAlreadyExists(schema.name.clone()));
        }
        let mut seen = HashSet::new();
        for f in &schema.fields {
            if !seen.insert(f.name.to_ascii_lowercase()) {
                return Err(Error::ColumnAlreadyExists(
                    f.name.clone(),
                    schema.name.clone(),
                ));
            }
        }

        let mut final_schema = schema.clone();
        for f in &schema.fields {
            if f.is_key && final_schema.index_on(&f.name).is_none() {
                final_schema.indexes.push(IndexDef {
                    name: "PRIMARY".to_string(),
                    column: f.name.clone(),
                    unique: true,
                });
            }
        }

        for i in 0..final_schema.foreign_keys.len() {
            let mut fk = final_schema.foreign_keys[i].clone();
            if fk.name.is_empty() {
                fk.name = format!("fk_{}_{}_{}", final_schema.name, fk.ref_table, i + 1);
            }
            validate_foreign_key(&schemas, &final_schema, &mut fk)?;
            for prev in &final_schema.foreign_keys[..i] {
                if prev.name.eq_ignore_ascii_case(&fk.name) {
                    return Err(Error::ForeignKeyAlreadyExists(fk.name));
                }
            }
            final_schema.foreign_keys[i] = fk;
        }

        self.engine.append_schema(&self.paths.dbf, &final_schema)?;
        self.engine
            .save_records(&self.paths.dat, &self.paths.dbf, &final_schema, &[])?;
        for idx in &final_schema.indexes {
            let path = self.paths.index_file(&final_schema.name, &idx.name);
            self.engine.save_index(&path, &BTreeMap::new())?;
        }
        debug!(table = %final_schema.name, "table created");
        Ok(())
    }

    /// Drop a table, applying the referential action to every table
    /// referencing it, then rewriting the heap without its blocks.
    pub fn drop_table(&self, table: &str, action: ReferentialAction) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        if target.is_view {
            return Err(Error::NotSupported(format!(
                "'{table}' is a view; use DROP VIEW"
            )));
        }
        let target_name = target.name.clone();
        let target_indexes = target.indexes.clone();

        // Apply the action to referring rows, table by table.
        for s in schemas.iter_mut() {
            let mut kept_fks = Vec::with_capacity(s.foreign_keys.len());
            let mut changed = false;
            let mut records: Option<Vec<Record>> = None;
            for fk in std::mem::take(&mut s.foreign_keys) {
                if !fk.ref_table.eq_ignore_ascii_case(&target_name) {
                    kept_fks.push(fk);
                    continue;
                }
                match action {
                    ReferentialAction::Restrict => {
                        return Err(Error::RestrictViolation(s.name.clone()));
                    }
                    ReferentialAction::SetNull => {
                        for col in &fk.columns {
                            match s.field(col) {
                                Some(f) if f.nullable => {}
                                Some(f) => return Err(Error::NotNullable(f.name.clone())),
                                None => {}
                            }
                        }
                    }
                    ReferentialAction::Cascade => {}
                }
                if records.is_none() {
                    records = Some(self.engine.read_records(&self.paths.dat, s)?);
                }
                let rows = records.as_mut().expect("records just loaded");
                let positions: Vec<usize> =
                    fk.columns.iter().filter_map(|c| s.field_index(c)).collect();
                for r in rows.iter_mut() {
                    if !r.valid {
                        continue;
                    }
                    let has_ref = positions.iter().any(|&i| {
                        r.values
                            .get(i)
                            .map(|v| !predicate::is_null(predicate::normalize_value(v)))
                            .unwrap_or(false)
                    });
                    if !has_ref {
                        continue;
                    }
                    match action {
                        ReferentialAction::Cascade => {
                            r.valid = false;
                            changed = true;
                        }
                        ReferentialAction::SetNull => {
                            for &i in &positions {
                                r.values[i] = NULL_TEXT.to_string();
                            }
                            changed = true;
                        }
                        ReferentialAction::Restrict => unreachable!("restrict returned above"),
                    }
                }
                // The constraint goes away with the referenced table.
            }
            s.foreign_keys = kept_fks;
            if changed {
                let rows = records.expect("changed implies loaded");
                self.engine
                    .save_records(&self.paths.dat, &self.paths.dbf, s, &rows)?;
                self.rebuild_indexes(&s.name)?;
            }
        }

        for idx in &target_indexes {
            let path = self.paths.index_file(&target_name, &idx.name);
            let _ = std::fs::remove_file(path);
        }

        schemas.remove(pos);
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        self.rewrite_heap_for(&schemas)?;
        debug!(table = %target_name, "table dropped");
        Ok(())
    }

    /// Rewrite `.dat` from the current catalog, keeping every table's
    /// data (dropping blocks of tables no longer in the catalog).
    fn rewrite_heap_for(&self, schemas: &[TableSchema]) -> Result<()> {
        let mut entries = Vec::new();
        for s in schemas {
            if s.is_view {
                continue;
            }
            let records = self.engine.read_records(&self.paths.dat, s)?;
            entries.push((s.clone(), records));
        }
        self.engine.rewrite_heap(&self.paths.dat, &entries)
    }

    /// Rename a table: schema, FK references elsewhere, index files,
    /// and the heap blocks — all other tables' data preserved.
    pub fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        let mut schemas = self.load_schemas();
        if schemas.iter().any(|s| s.name.eq_ignore_ascii_case(new)) {
            return Err(Error::TableAlreadyExists(new.to_string()));
        }
        let (pos, target) = self.find(&schemas, old)?;
        let old_name = target.name.clone();
        let indexes = target.indexes.clone();

        // Capture every table's data under the old catalog first.
        let mut entries: Vec<(TableSchema, Vec<Record>)> = Vec::new();
        for s in &schemas {
            if s.is_view {
                continue;
            }
            entries.push((s.clone(), self.engine.read_records(&self.paths.dat, s)?));
        }

        schemas[pos].name = new.to_string();
        for s in schemas.iter_mut() {
            for fk in s.foreign_keys.iter_mut() {
                if fk.ref_table.eq_ignore_ascii_case(&old_name) {
                    fk.ref_table = new.to_string();
                }
            }
        }
        for idx in &indexes {
            let from = self.paths.index_file(&old_name, &idx.name);
            let to = self.paths.index_file(new, &idx.name);
            let _ = std::fs::rename(from, to);
        }
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;

        for (schema, _) in entries.iter_mut() {
            if schema.name.eq_ignore_ascii_case(&old_name) {
                schema.name = new.to_string();
            }
        }
        self.engine.rewrite_heap(&self.paths.dat, &entries)?;
        debug!(old = %old_name, new, "table renamed");
        Ok(())
    }

    // ========== Columns ==========

    pub fn add_column(&self, table: &str, field: Field, position: &ColumnPosition) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        if target.field(&field.name).is_some() {
            return Err(Error::ColumnAlreadyExists(
                field.name.clone(),
                target.name.clone(),
            ));
        }
        let old_schema = target.clone();
        let insert_at = match position {
            ColumnPosition::Last => old_schema.fields.len(),
            ColumnPosition::First => 0,
            ColumnPosition::After(col) => {
                old_schema
                    .field_index(col)
                    .ok_or_else(|| Error::ColumnNotFound(col.clone(), old_schema.name.clone()))?
                    + 1
            }
        };

        let mut records = self.engine.read_records(&self.paths.dat, &old_schema)?;
        for r in records.iter_mut() {
            let fill = if field.nullable {
                NULL_TEXT.to_string()
            } else {
                String::new()
            };
            r.values.insert(insert_at.min(r.values.len()), fill);
        }

        schemas[pos].fields.insert(insert_at, field);
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        self.engine
            .save_records(&self.paths.dat, &self.paths.dbf, &schemas[pos], &records)
    }

    pub fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let old_schema = target.clone();
        let col_idx = old_schema
            .field_index(column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string(), old_schema.name.clone()))?;

        let mut records = self.engine.read_records(&self.paths.dat, &old_schema)?;
        for r in records.iter_mut() {
            if col_idx < r.values.len() {
                r.values.remove(col_idx);
            }
        }

        let schema = &mut schemas[pos];
        schema.indexes.retain(|idx| {
            if idx.column.eq_ignore_ascii_case(column) {
                let path = self.paths.index_file(&old_schema.name, &idx.name);
                let _ = std::fs::remove_file(path);
                false
            } else {
                true
            }
        });
        schema.fields.remove(col_idx);
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        self.engine
            .save_records(&self.paths.dat, &self.paths.dbf, &schemas[pos], &records)
    }

    pub fn modify_column(&self, table: &str, field: Field) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let idx = target
            .field_index(&field.name)
            .ok_or_else(|| Error::ColumnNotFound(field.name.clone(), target.name.clone()))?;
        let slot = &mut schemas[pos].fields[idx];
        slot.type_name = field.type_name;
        slot.size = field.size;
        slot.is_key = field.is_key;
        slot.nullable = field.nullable;
        self.engine.save_schemas(&self.paths.dbf, &schemas)
    }

    pub fn rename_column(&self, table: &str, column: &str, new_name: &str) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let idx = target
            .field_index(column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string(), target.name.clone()))?;
        if target.field(new_name).is_some() {
            return Err(Error::ColumnAlreadyExists(
                new_name.to_string(),
                target.name.clone(),
            ));
        }
        let schema = &mut schemas[pos];
        schema.fields[idx].name = new_name.to_string();
        for index in schema.indexes.iter_mut() {
            if index.column.eq_ignore_ascii_case(column) {
                index.column = new_name.to_string();
            }
        }
        for fk in schema.foreign_keys.iter_mut() {
            for c in fk.columns.iter_mut() {
                if c.eq_ignore_ascii_case(column) {
                    *c = new_name.to_string();
                }
            }
        }
        self.engine.save_schemas(&self.paths.dbf, &schemas)
    }

    // ========== Indexes ==========

    /// Create a single-column index; unique indexes scan existing rows
    /// and refuse on duplicate keys.
    pub fn create_index(
        &self,
        table: &str,
        column: &str,
        index_name: &str,
        unique: bool,
    ) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let col_idx = target
            .field_index(column)
            .ok_or_else(|| Error::ColumnNotFound(column.to_string(), target.name.clone()))?;
        if let Some(existing) = target.index_on(column) {
            // A unique index over an already uniquely-indexed column
            // (e.g. PRIMARY) is a no-op.
            if unique && existing.unique {
                return Ok(());
            }
            return Err(Error::IndexAlreadyExists(
                column.to_string(),
                target.name.clone(),
            ));
        }

        let rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, target)?;
        if unique {
            let mut seen = HashSet::new();
            for (_, r) in &rows {
                if let Some(v) = r.values.get(col_idx) {
                    let v = predicate::normalize_value(v);
                    if !seen.insert(v.to_string()) {
                        return Err(Error::DuplicateKey {
                            key: index_name.to_string(),
                            value: v.to_string(),
                        });
                    }
                }
            }
        }

        let index = IndexDef {
            name: if index_name.is_empty() {
                format!("idx_{column}")
            } else {
                index_name.to_string()
            },
            column: column.to_string(),
            unique,
        };
        let mut map = BTreeMap::new();
        for (offset, r) in &rows {
            if let Some(v) = r.values.get(col_idx) {
                map.insert(predicate::normalize_value(v).to_string(), *offset);
            }
        }
        let path = self.paths.index_file(&target.name, &index.name);
        schemas[pos].indexes.push(index);
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        self.engine.save_index(&path, &map)
    }

    pub fn drop_index(&self, table: &str, index_name: &str) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let idx = target
            .indexes
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(index_name))
            .ok_or_else(|| {
                Error::IndexNotFound(index_name.to_string(), target.name.clone())
            })?;
        let removed = schemas[pos].indexes.remove(idx);
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        let path = self.paths.index_file(&schemas[pos].name, &removed.name);
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    pub fn list_indexes(&self, table: &str) -> Result<Vec<IndexDef>> {
        let schemas = self.load_schemas();
        let (_, target) = self.find(&schemas, table)?;
        Ok(target.indexes.clone())
    }

    /// Rebuild every index of a table from its live rows; a no-op for
    /// tables that no longer exist (e.g. dropped in this transaction).
    pub fn rebuild_indexes(&self, table: &str) -> Result<()> {
        let schemas = self.load_schemas();
        let Some(schema) = schemas
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(table))
        else {
            return Ok(());
        };
        if schema.indexes.is_empty() {
            return Ok(());
        }
        let rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, schema)?;
        for idx in &schema.indexes {
            let Some(col_idx) = schema.field_index(&idx.column) else {
                continue;
            };
            let mut map = BTreeMap::new();
            for (offset, r) in &rows {
                if let Some(v) = r.values.get(col_idx) {
                    map.insert(predicate::normalize_value(v).to_string(), *offset);
                }
            }
            let path = self.paths.index_file(&schema.name, &idx.name);
            self.engine.save_index(&path, &map)?;
        }
        Ok(())
    }

    // ========== Foreign keys ==========

    pub fn add_foreign_key(&self, table: &str, mut fk: ForeignKeyDef) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        if fk.name.is_empty() {
            fk.name = format!(
                "fk_{}_{}_{}",
                target.name,
                fk.ref_table,
                target.foreign_keys.len() + 1
            );
        }
        validate_foreign_key(&schemas, target, &mut fk)?;
        for existing in &target.foreign_keys {
            if existing.name.eq_ignore_ascii_case(&fk.name) {
                if existing.is_equivalent(&fk) {
                    return Ok(());
                }
                return Err(Error::ForeignKeyAlreadyExists(fk.name));
            }
        }
        let ref_schema = schemas
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(&fk.ref_table))
            .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?;
        self.existing_rows_satisfy_fk(target, &fk, ref_schema)?;
        schemas[pos].foreign_keys.push(fk);
        self.engine.save_schemas(&self.paths.dbf, &schemas)
    }

    pub fn drop_foreign_key(&self, table: &str, name: &str) -> Result<()> {
        let mut schemas = self.load_schemas();
        let (pos, target) = self.find(&schemas, table)?;
        let idx = target
            .foreign_keys
            .iter()
            .position(|fk| fk.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Error::ForeignKeyNotFound(name.to_string(), target.name.clone())
            })?;
        schemas[pos].foreign_keys.remove(idx);
        self.engine.save_schemas(&self.paths.dbf, &schemas)
    }

    /// Every current live row must satisfy a constraint before it is
    /// accepted.
    fn existing_rows_satisfy_fk(
        &self,
        schema: &TableSchema,
        fk: &ForeignKeyDef,
        ref_schema: &TableSchema,
    ) -> Result<()> {
        let rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, schema)?;
        let ref_rows = self
            .engine
            .read_records_with_offsets(&self.paths.dat, ref_schema)?;
        let child_positions: Vec<usize> = fk
            .columns
            .iter()
            .map(|c| {
                schema
                    .field_index(c)
                    .ok_or_else(|| Error::ColumnNotFound(c.clone(), schema.name.clone()))
            })
            .collect::<Result<_>>()?;
        let ref_positions: Vec<usize> = fk
            .ref_columns
            .iter()
            .map(|c| {
                ref_schema
                    .field_index(c)
                    .ok_or_else(|| Error::ColumnNotFound(c.clone(), ref_schema.name.clone()))
            })
            .collect::<Result<_>>()?;

        for (_, r) in &rows {
            let mut tuple = Vec::with_capacity(child_positions.len());
            let mut has_null = false;
            for &i in &child_positions {
                let v = r
                    .values
                    .get(i)
                    .map(|v| predicate::normalize_value(v))
                    .unwrap_or("");
                if predicate::is_null(v) {
                    has_null = true;
                    break;
                }
                tuple.push(v.to_string());
            }
            if has_null {
                continue;
            }
            let found = ref_rows.iter().any(|(_, rr)| {
                ref_positions.iter().zip(&tuple).all(|(&i, t)| {
                    rr.values
                        .get(i)
                        .map(|v| predicate::normalize_value(v) == t)
                        .unwrap_or(false)
                })
            });
            if !found {
                return Err(Error::ForeignKeyViolation(format!(
                    "existing rows in '{}' violate constraint '{}'",
                    schema.name, fk.name
                )));
            }
        }
        Ok(())
    }

    // ========== Views ==========

    /// Create (or replace) a view: validate the plan against the
    /// current catalog with cycle detection, derive the field list,
    /// and store the schema with the original SELECT text.
    pub fn create_view(
        &self,
        view: &str,
        columns: &[String],
        plan: &QueryPlan,
        sql: &str,
        or_replace: bool,
    ) -> Result<()> {
        if view.is_empty() {
            return Err(Error::Syntax("view name required".into()));
        }
        let mut schemas = self.load_schemas();
        if let Some(pos) = schemas
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(view))
        {
            if !schemas[pos].is_view {
                return Err(Error::TableAlreadyExists(view.to_string()));
            }
            if !or_replace {
                return Err(Error::ViewAlreadyExists(view.to_string()));
            }
            schemas.remove(pos);
        }

        let mut visiting = HashSet::new();
        visiting.insert(view.to_ascii_lowercase());
        validate_view_plan(plan, &schemas, &mut visiting)?;

        let mut fields = derive_view_fields(plan, &schemas)?;
        if !columns.is_empty() {
            if columns.len() != fields.len() {
                return Err(Error::Syntax(format!(
                    "view column list has {} names for {} select expressions",
                    columns.len(),
                    fields.len()
                )));
            }
            for (field, name) in fields.iter_mut().zip(columns) {
                field.name = name.clone();
            }
        }

        schemas.push(TableSchema {
            name: view.to_string(),
            fields,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            is_view: true,
            view_sql: sql.to_string(),
        });
        self.engine.save_schemas(&self.paths.dbf, &schemas)?;
        debug!(view, "view created");
        Ok(())
    }

    pub fn drop_view(&self, view: &str, if_exists: bool) -> Result<()> {
        let mut schemas = self.load_schemas();
        let pos = schemas
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(view) && s.is_view);
        match pos {
            Some(pos) => {
                schemas.remove(pos);
                self.engine.save_schemas(&self.paths.dbf, &schemas)
            }
            None if if_exists => Ok(()),
            None => Err(Error::ViewNotFound(view.to_string())),
        }
    }
}

// ========== Validation helpers ==========

/// Normalize and validate one FK definition against the catalog:
/// referenced table exists, ref columns resolve (defaulting to the
/// PK), counts and types line up, and the referenced side is unique.
fn validate_foreign_key(
    schemas: &[TableSchema],
    schema: &TableSchema,
    fk: &mut ForeignKeyDef,
) -> Result<()> {
    if fk.columns.is_empty() {
        return Err(Error::Syntax(format!(
            "foreign key '{}' has no columns",
            fk.name
        )));
    }
    let ref_schema = schemas
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(&fk.ref_table))
        .ok_or_else(|| Error::TableNotFound(fk.ref_table.clone()))?;
    if fk.ref_columns.is_empty() {
        let keys: Vec<String> = ref_schema
            .key_columns()
            .iter()
            .map(|s| s.to_string())
            .collect();
        fk.ref_columns = if !keys.is_empty() && keys.len() == fk.columns.len() {
            keys
        } else {
            fk.columns.clone()
        };
    }
    if fk.columns.len() != fk.ref_columns.len() {
        return Err(Error::Syntax(format!(
            "foreign key '{}' column count mismatch",
            fk.name
        )));
    }
    for (child_col, ref_col) in fk.columns.iter().zip(&fk.ref_columns) {
        let child = schema
            .field(child_col)
            .ok_or_else(|| Error::ColumnNotFound(child_col.clone(), schema.name.clone()))?;
        let referenced = ref_schema
            .field(ref_col)
            .ok_or_else(|| Error::ColumnNotFound(ref_col.clone(), ref_schema.name.clone()))?;
        if !child.type_name.eq_ignore_ascii_case(&referenced.type_name) {
            return Err(Error::ForeignKeyViolation(format!(
                "type mismatch on column '{child_col}' of constraint '{}'",
                fk.name
            )));
        }
    }
    if !ref_schema.has_unique_over(&fk.ref_columns) {
        return Err(Error::ForeignKeyViolation(format!(
            "referenced columns of '{}' must be a primary key or unique index",
            fk.name
        )));
    }
    Ok(())
}

fn schema_by_name<'s>(schemas: &'s [TableSchema], name: &str) -> Option<&'s TableSchema> {
    schemas.iter().find(|s| s.name.eq_ignore_ascii_case(name))
}

/// Walk a view body recursively, rejecting unknown tables and cycles.
fn validate_view_plan(
    plan: &QueryPlan,
    schemas: &[TableSchema],
    visiting: &mut HashSet<String>,
) -> Result<()> {
    if let Some(table) = &plan.source_table {
        if visiting.contains(&table.to_ascii_lowercase()) {
            return Err(Error::NotSupported(format!("recursive view '{table}'")));
        }
        let base = schema_by_name(schemas, table)
            .ok_or_else(|| Error::TableNotFound(table.clone()))?;
        if base.is_view {
            descend_into_view(base, schemas, visiting)?;
        }
    } else if let Some(sub) = &plan.source_subquery {
        validate_view_plan(sub, schemas, visiting)?;
    } else {
        return Err(Error::Syntax("view has no source".into()));
    }

    if let Some(join) = &plan.join {
        if visiting.contains(&join.table.to_ascii_lowercase()) {
            return Err(Error::NotSupported(format!(
                "recursive view '{}'",
                join.table
            )));
        }
        let right = schema_by_name(schemas, &join.table)
            .ok_or_else(|| Error::TableNotFound(join.table.clone()))?;
        if right.is_view {
            descend_into_view(right, schemas, visiting)?;
        }
    }

    for cond in plan.conditions.iter().chain(&plan.having) {
        if let Some(sub) = &cond.subquery {
            validate_view_plan(sub, schemas, visiting)?;
        }
    }
    for sel in &plan.select_exprs {
        if let SelectItem::Subquery(sub) = &sel.item {
            validate_view_plan(sub, schemas, visiting)?;
        }
    }
    Ok(())
}

fn descend_into_view(
    view: &TableSchema,
    schemas: &[TableSchema],
    visiting: &mut HashSet<String>,
) -> Result<()> {
    let low = view.name.to_ascii_lowercase();
    if !visiting.insert(low.clone()) {
        return Err(Error::NotSupported(format!(
            "recursive view '{}'",
            view.name
        )));
    }
    let inner = match Parser::parse(&view.view_sql) {
        Ok(Command::Select { plan }) => plan,
        _ => {
            return Err(Error::Corruption {
                file: "catalog".to_string(),
                detail: format!("stored view '{}' is not a SELECT", view.name),
            })
        }
    };
    validate_view_plan(&inner, schemas, visiting)?;
    visiting.remove(&low);
    Ok(())
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Derive a view's Field list from its plan: aggregates and
/// subqueries become string columns named by label, `*` expands the
/// combined source schema (deduped for natural joins).
fn derive_view_fields(plan: &QueryPlan, schemas: &[TableSchema]) -> Result<Vec<Field>> {
    let left: Vec<Field> = if let Some(table) = &plan.source_table {
        let base = schema_by_name(schemas, table)
            .ok_or_else(|| Error::TableNotFound(table.clone()))?;
        base.fields.clone()
    } else if let Some(sub) = &plan.source_subquery {
        derive_view_fields(sub, schemas)?
    } else {
        return Err(Error::Syntax("view has no source".into()));
    };

    let left_prefix = plan
        .source_alias
        .clone()
        .or_else(|| plan.source_table.clone());
    let mut combined: Vec<Field> = left
        .iter()
        .map(|f| {
            let mut nf = f.clone();
            if let Some(prefix) = &left_prefix {
                if !nf.name.contains('.') {
                    nf.name = format!("{prefix}.{}", nf.name);
                }
            }
            nf
        })
        .collect();
    let natural = plan.join.as_ref().map(|j| j.natural).unwrap_or(false);
    if let Some(join) = &plan.join {
        let right = schema_by_name(schemas, &join.table)
            .ok_or_else(|| Error::TableNotFound(join.table.clone()))?;
        let prefix = join.alias.clone().unwrap_or_else(|| right.name.clone());
        for f in &right.fields {
            let mut nf = f.clone();
            nf.name = format!("{prefix}.{}", nf.name);
            combined.push(nf);
        }
    }

    let lookup = TableSchema {
        name: String::new(),
        fields: combined.clone(),
        ..Default::default()
    };

    let mut out = Vec::new();
    for (i, sel) in plan.select_exprs.iter().enumerate() {
        match &sel.item {
            SelectItem::Aggregate(_) | SelectItem::Subquery(_) => {
                out.push(Field::new(sel.label(i), "string"));
            }
            SelectItem::Column(name) if name == "*" => {
                let mut seen = HashSet::new();
                for f in &combined {
                    let base = unqualified(&f.name).to_ascii_lowercase();
                    if natural && !seen.insert(base) {
                        continue;
                    }
                    let mut nf = f.clone();
                    nf.name = unqualified(&f.name).to_string();
                    nf.is_key = false;
                    nf.nullable = true;
                    out.push(nf);
                }
            }
            SelectItem::Column(name) => {
                if !predicate::field_exists(&lookup, name) {
                    return Err(Error::ColumnNotFound(name.clone(), "view".to_string()));
                }
                let label = sel
                    .alias
                    .clone()
                    .unwrap_or_else(|| unqualified(name).to_string());
                out.push(Field::new(label, "string"));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> TableSchema {
        let mut s = TableSchema::new("parent");
        s.fields.push(Field::new("id", "int").key());
        s.indexes.push(IndexDef {
            name: "PRIMARY".to_string(),
            column: "id".to_string(),
            unique: true,
        });
        s
    }

    fn child() -> TableSchema {
        let mut s = TableSchema::new("child");
        s.fields.push(Field::new("cid", "int").key());
        s.fields.push(Field::new("pid", "int"));
        s
    }

    #[test]
    fn test_validate_fk_defaults_ref_columns_to_pk() {
        let schemas = vec![parent(), child()];
        let mut fk = ForeignKeyDef {
            name: "fk".to_string(),
            columns: vec!["pid".to_string()],
            ref_table: "parent".to_string(),
            ..Default::default()
        };
        validate_foreign_key(&schemas, &schemas[1], &mut fk).unwrap();
        assert_eq!(fk.ref_columns, vec!["id"]);
    }

    #[test]
    fn test_validate_fk_requires_unique_target() {
        let mut no_key = TableSchema::new("plain");
        no_key.fields.push(Field::new("x", "int"));
        let mut referer = child();
        referer.fields[1].type_name = "int".to_string();
        let schemas = vec![no_key, referer];
        let mut fk = ForeignKeyDef {
            name: "fk".to_string(),
            columns: vec!["pid".to_string()],
            ref_table: "plain".to_string(),
            ref_columns: vec!["x".to_string()],
            ..Default::default()
        };
        let err = validate_foreign_key(&schemas, &schemas[1], &mut fk).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
    }

    #[test]
    fn test_validate_fk_type_mismatch() {
        let mut c = child();
        c.fields[1].type_name = "char[4]".to_string();
        let schemas = vec![parent(), c];
        let mut fk = ForeignKeyDef {
            name: "fk".to_string(),
            columns: vec!["pid".to_string()],
            ref_table: "parent".to_string(),
            ..Default::default()
        };
        let err = validate_foreign_key(&schemas, &schemas[1], &mut fk).unwrap_err();
        assert!(matches!(err, Error::ForeignKeyViolation(_)));
    }

    #[test]
    fn test_derive_view_fields_star_and_alias() {
        let schemas = vec![parent()];
        let plan = match Parser::parse("SELECT id AS pk FROM parent").unwrap() {
            Command::Select { plan } => plan,
            _ => unreachable!(),
        };
        let fields = derive_view_fields(&plan, &schemas).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "pk");

        let plan = match Parser::parse("SELECT * FROM parent").unwrap() {
            Command::Select { plan } => plan,
            _ => unreachable!(),
        };
        let fields = derive_view_fields(&plan, &schemas).unwrap();
        assert_eq!(fields[0].name, "id");
    }

    #[test]
    fn test_view_cycle_detection() {
        let mut v = TableSchema::new("v1");
        v.is_view = true;
        v.view_sql = "SELECT * FROM v1".to_string();
        v.fields.push(Field::new("id", "int"));
        let schemas = vec![v];
        let plan = match Parser::parse("SELECT * FROM v1").unwrap() {
            Command::Select { plan } => plan,
            _ => unreachable!(),
        };
        let mut visiting = HashSet::new();
        let err = validate_view_plan(&plan, &schemas, &mut visiting).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
