//! SELECT execution
//!
//! Nested-loop joins over a combined alias-qualified schema, equality
//! index probes, grouping and aggregation, HAVING over the derived
//! aggregate schema, ORDER BY with alias resolution, subqueries, and
//! view expansion guarded by an explicit context.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::catalog::{Field, Record, TableSchema, NULL_TEXT};
use crate::error::{Error, Result};
use crate::executor::predicate;
use crate::sql::ast::{AggregateFunc, Command, Condition, JoinType, QueryPlan, SelectItem};
use crate::sql::Parser;
use crate::storage::paths::DbPaths;
use crate::storage::wal::{Rid, TxnId};
use crate::storage::StorageEngine;
use crate::transaction::LockManager;

/// Maximum depth of nested view expansion.
pub const MAX_VIEW_DEPTH: usize = 8;

/// Result of a SELECT: labeled columns plus projected rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

/// Execution context threaded through nested plans: tracks the view
/// names being expanded so cycles and runaway nesting fail cleanly.
#[derive(Debug, Default)]
pub struct QueryContext {
    visited_views: Vec<String>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter_view(&mut self, name: &str) -> Result<()> {
        let low = name.to_ascii_lowercase();
        if self.visited_views.contains(&low) {
            return Err(Error::NotSupported(format!("recursive view '{name}'")));
        }
        if self.visited_views.len() >= MAX_VIEW_DEPTH {
            return Err(Error::NotSupported(format!(
                "view nesting deeper than {MAX_VIEW_DEPTH} at '{name}'"
            )));
        }
        self.visited_views.push(low);
        Ok(())
    }

    fn leave_view(&mut self) {
        self.visited_views.pop();
    }
}

/// Shared locks taken while a SELECT runs; released when it returns.
struct SharedLocks<'a> {
    locks: &'a LockManager,
    txn_id: TxnId,
    held: Vec<Rid>,
    keys: HashSet<String>,
}

impl<'a> SharedLocks<'a> {
    fn new(locks: &'a LockManager, txn_id: TxnId) -> Self {
        Self {
            locks,
            txn_id,
            held: Vec::new(),
            keys: HashSet::new(),
        }
    }

    fn acquire(&mut self, rid: Rid) -> Result<()> {
        if self.keys.insert(rid.lock_key()) {
            self.locks.lock_shared(self.txn_id, &rid)?;
            self.held.push(rid);
        }
        Ok(())
    }
}

impl Drop for SharedLocks<'_> {
    fn drop(&mut self) {
        for rid in &self.held {
            self.locks.release_shared(self.txn_id, rid);
        }
    }
}

/// One side of the query: rows plus their (optional) physical RIDs.
struct Source {
    /// Alias-qualified fields describing `rows`.
    fields: Vec<Field>,
    rows: Vec<Record>,
    /// RID offsets aligned with `rows`; None for derived sources.
    offsets: Vec<Option<u64>>,
    /// Physical table for lock RIDs; None for derived sources.
    lock_table: Option<String>,
}

/// Internal result: user-facing output plus the qualified fields an
/// enclosing query uses when this plan is a derived source.
struct PlanResult {
    output: QueryOutput,
    derived_fields: Vec<Field>,
}

/// Read-only query executor over one database.
pub struct QueryService<'a> {
    engine: StorageEngine,
    paths: &'a DbPaths,
    locks: &'a LockManager,
    txn_id: TxnId,
}

impl<'a> QueryService<'a> {
    pub fn new(paths: &'a DbPaths, locks: &'a LockManager, txn_id: TxnId) -> Self {
        Self {
            engine: StorageEngine::new(),
            paths,
            locks,
            txn_id,
        }
    }

    /// Execute a SELECT plan.
    pub fn select(&self, plan: &QueryPlan, ctx: &mut QueryContext) -> Result<QueryOutput> {
        let mut guard = SharedLocks::new(self.locks, self.txn_id);
        let result = self.execute_plan(plan, ctx, &mut guard)?;
        Ok(result.output)
    }

    fn execute_plan(
        &self,
        plan: &QueryPlan,
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<PlanResult> {
        let schemas = self.engine.load_schemas(&self.paths.dbf)?;

        let left = self.load_left_source(plan, &schemas, ctx, guard)?;

        // Conditions with subqueries resolve to literal form first; a
        // failed EXISTS short-circuits the whole plan to zero rows.
        let conditions = match self.resolve_conditions(&plan.conditions, ctx, guard)? {
            Some(conds) => conds,
            None => {
                return self.finish(plan, Vec::new(), combined_fields(&left, None), ctx, guard)
            }
        };

        if let Some(join) = &plan.join {
            let right = self.load_join_source(join, &schemas, ctx, guard)?;
            let fields = combined_fields(&left, Some(&right));
            let combined = TableSchema {
                name: String::new(),
                fields: fields.clone(),
                ..Default::default()
            };

            let natural_pairs = if join.natural {
                natural_join_pairs(&left, &right)
            } else {
                Vec::new()
            };
            let left_width = left.fields.len();
            let on_matches = |rec: &Record| -> Result<bool> {
                if join.natural {
                    for (li, ri) in &natural_pairs {
                        let lv = predicate::normalize_value(&rec.values[*li]);
                        let rv = predicate::normalize_value(&rec.values[left_width + *ri]);
                        if !predicate::values_equal(lv, rv) {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                } else {
                    let lv = predicate::field_value(&combined, rec, &join.on_left)
                        .map(predicate::normalize_value);
                    let rv = predicate::field_value(&combined, rec, &join.on_right)
                        .map(predicate::normalize_value);
                    match (lv, rv) {
                        (Some(l), Some(r)) => Ok(predicate::values_equal(l, r)),
                        _ => Ok(false),
                    }
                }
            };

            let null_left = Record::new(vec![NULL_TEXT.to_string(); left.fields.len()]);
            let null_right = Record::new(vec![NULL_TEXT.to_string(); right.fields.len()]);
            let mut matched_rows = Vec::new();

            let (outer, inner, outer_is_left) = match join.join_type {
                JoinType::Inner | JoinType::Left => (&left, &right, true),
                JoinType::Right => (&right, &left, false),
            };
            for (oi, orow) in outer.rows.iter().enumerate() {
                let mut matched = false;
                for (ii, irow) in inner.rows.iter().enumerate() {
                    let rec = if outer_is_left {
                        combine_records(orow, irow)
                    } else {
                        combine_records(irow, orow)
                    };
                    if !on_matches(&rec)? {
                        continue;
                    }
                    if !predicate::match_conditions(&combined, &rec, &conditions)? {
                        continue;
                    }
                    matched = true;
                    lock_row(guard, outer, oi)?;
                    lock_row(guard, inner, ii)?;
                    matched_rows.push(rec);
                }
                let pad_unmatched = match join.join_type {
                    JoinType::Inner => false,
                    JoinType::Left | JoinType::Right => !matched,
                };
                if pad_unmatched {
                    let rec = if outer_is_left {
                        combine_records(orow, &null_right)
                    } else {
                        combine_records(&null_left, orow)
                    };
                    if predicate::match_conditions(&combined, &rec, &conditions)? {
                        lock_row(guard, outer, oi)?;
                        matched_rows.push(rec);
                    }
                }
            }
            self.finish(plan, matched_rows, fields, ctx, guard)
        } else {
            let fields = combined_fields(&left, None);
            let combined = TableSchema {
                name: String::new(),
                fields: fields.clone(),
                ..Default::default()
            };
            let mut matched_rows = Vec::new();
            for (i, row) in left.rows.iter().enumerate() {
                if !predicate::match_conditions(&combined, row, &conditions)? {
                    continue;
                }
                lock_row(guard, &left, i)?;
                matched_rows.push(row.clone());
            }
            self.finish(plan, matched_rows, fields, ctx, guard)
        }
    }

    // ========== Source loading ==========

    fn load_left_source(
        &self,
        plan: &QueryPlan,
        schemas: &[TableSchema],
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<Source> {
        if let Some(sub) = &plan.source_subquery {
            let inner = self.execute_plan(sub, ctx, guard)?;
            return Ok(derived_source(
                inner,
                plan.source_alias.as_deref(),
            ));
        }
        let table = plan
            .source_table
            .as_deref()
            .ok_or_else(|| Error::Syntax("SELECT without a source".into()))?;
        let schema = find_schema(schemas, table)?;
        if schema.is_view {
            let inner = self.expand_view(schema, ctx, guard)?;
            let prefix = plan.source_alias.clone().unwrap_or_else(|| schema.name.clone());
            return Ok(derived_source(inner, Some(&prefix)));
        }
        let prefix = plan
            .source_alias
            .clone()
            .unwrap_or_else(|| schema.name.clone());
        self.load_table_source(schema, &prefix, &plan.conditions, guard)
    }

    fn load_join_source(
        &self,
        join: &crate::sql::ast::JoinClause,
        schemas: &[TableSchema],
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<Source> {
        let schema = find_schema(schemas, &join.table)?;
        if schema.is_view {
            let inner = self.expand_view(schema, ctx, guard)?;
            let prefix = join.alias.clone().unwrap_or_else(|| schema.name.clone());
            return Ok(derived_source(inner, Some(&prefix)));
        }
        let prefix = join.alias.clone().unwrap_or_else(|| schema.name.clone());
        self.load_table_source(schema, &prefix, &[], guard)
    }

    /// Read a physical table, probing an index when a WHERE equality
    /// covers an indexed column; otherwise a full live scan.
    fn load_table_source(
        &self,
        schema: &TableSchema,
        prefix: &str,
        conditions: &[Condition],
        guard: &mut SharedLocks<'_>,
    ) -> Result<Source> {
        let fields = qualified_fields(&schema.fields, Some(prefix));
        for cond in conditions {
            if cond.op != crate::sql::ast::CompareOp::Eq
                || cond.subquery.is_some()
                || cond.field.is_empty()
            {
                continue;
            }
            let column = cond.field.rsplit('.').next().unwrap_or(&cond.field);
            let Some(index_def) = schema.index_on(column) else {
                continue;
            };
            let index_path = self.paths.index_file(&schema.name, &index_def.name);
            let index = self.engine.load_index(&index_path)?;
            let normalized = predicate::normalize_value(&cond.value);
            let hit = index
                .get(normalized)
                .or_else(|| index.get(cond.value.as_str()))
                .copied();
            let mut rows = Vec::new();
            let mut offsets = Vec::new();
            if let Some(offset) = hit {
                let record = self.engine.read_record_at(&self.paths.dat, schema, offset)?;
                if record.valid {
                    guard.acquire(Rid::new(&schema.name, offset))?;
                    rows.push(record);
                    offsets.push(Some(offset));
                }
            }
            return Ok(Source {
                fields,
                rows,
                offsets,
                lock_table: Some(schema.name.clone()),
            });
        }

        let with_offsets = self
            .engine
            .read_records_with_offsets(&self.paths.dat, schema)?;
        let mut rows = Vec::with_capacity(with_offsets.len());
        let mut offsets = Vec::with_capacity(with_offsets.len());
        for (offset, record) in with_offsets {
            rows.push(record);
            offsets.push(Some(offset));
        }
        Ok(Source {
            fields,
            rows,
            offsets,
            lock_table: Some(schema.name.clone()),
        })
    }

    fn expand_view(
        &self,
        schema: &TableSchema,
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<PlanResult> {
        ctx.enter_view(&schema.name)?;
        let parsed = Parser::parse(&schema.view_sql);
        let result = match parsed {
            Ok(Command::Select { plan }) => self.execute_plan(&plan, ctx, guard),
            Ok(_) => Err(Error::Corruption {
                file: self.paths.dbf.display().to_string(),
                detail: format!("stored view '{}' is not a SELECT", schema.name),
            }),
            Err(e) => Err(e),
        };
        ctx.leave_view();
        result
    }

    // ========== Subquery resolution ==========

    /// Execute subquery conditions into literal form. `None` means the
    /// conjunction is statically false (failed EXISTS / NOT EXISTS).
    fn resolve_conditions(
        &self,
        conditions: &[Condition],
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<Option<Vec<Condition>>> {
        use crate::sql::ast::CompareOp;
        let mut out = Vec::with_capacity(conditions.len());
        for cond in conditions {
            let Some(sub) = &cond.subquery else {
                out.push(cond.clone());
                continue;
            };
            let inner = self.execute_plan(sub, ctx, guard)?.output;
            match cond.op {
                CompareOp::Exists => {
                    if inner.rows.is_empty() {
                        return Ok(None);
                    }
                }
                CompareOp::NotExists => {
                    if !inner.rows.is_empty() {
                        return Ok(None);
                    }
                }
                CompareOp::In => {
                    let mut resolved = cond.clone();
                    resolved.subquery = None;
                    resolved.values = inner
                        .rows
                        .iter()
                        .filter_map(|r| r.values.first().cloned())
                        .collect();
                    out.push(resolved);
                }
                _ => {
                    let mut resolved = cond.clone();
                    resolved.subquery = None;
                    resolved.value = inner
                        .rows
                        .first()
                        .and_then(|r| r.values.first().cloned())
                        .unwrap_or_else(|| NULL_TEXT.to_string());
                    out.push(resolved);
                }
            }
        }
        Ok(Some(out))
    }

    // ========== Aggregation, ordering, projection ==========

    fn finish(
        &self,
        plan: &QueryPlan,
        matched: Vec<Record>,
        fields: Vec<Field>,
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<PlanResult> {
        let combined = TableSchema {
            name: String::new(),
            fields,
            ..Default::default()
        };
        if plan.is_grouped() {
            self.finish_grouped(plan, matched, &combined, ctx, guard)
        } else {
            self.finish_plain(plan, matched, &combined, ctx, guard)
        }
    }

    fn finish_plain(
        &self,
        plan: &QueryPlan,
        mut matched: Vec<Record>,
        combined: &TableSchema,
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<PlanResult> {
        if !plan.order_by.is_empty() {
            let mut alias_map = HashMap::new();
            for (i, proj) in plan.projection.iter().enumerate() {
                if let Some(Some(alias)) = plan.projection_aliases.get(i) {
                    alias_map.insert(alias.to_ascii_lowercase(), proj.clone());
                }
            }
            let keys = resolve_order_keys(&plan.order_by, &alias_map, combined)?;
            sort_records(&mut matched, combined, &keys);
        }

        // Scalar SELECT-list subqueries are uncorrelated: execute once
        // and reuse the value for every row.
        let mut scalar_values = HashMap::new();
        for (i, sel) in plan.select_exprs.iter().enumerate() {
            if let SelectItem::Subquery(sub) = &sel.item {
                let inner = self.execute_plan(sub, ctx, guard)?.output;
                let value = inner
                    .rows
                    .first()
                    .and_then(|r| r.values.first().cloned())
                    .unwrap_or_else(|| NULL_TEXT.to_string());
                scalar_values.insert(i, value);
            }
        }

        let star_positions = star_projection(plan, combined);
        let (columns, derived_fields) = projection_labels(plan, combined, &star_positions);

        let mut rows = Vec::with_capacity(matched.len());
        for rec in &matched {
            let mut values = Vec::with_capacity(columns.len());
            for (i, sel) in plan.select_exprs.iter().enumerate() {
                match &sel.item {
                    SelectItem::Column(name) if name == "*" => {
                        for pos in &star_positions {
                            values.push(rec.values[*pos].clone());
                        }
                    }
                    SelectItem::Column(name) => {
                        let v = predicate::field_value(combined, rec, name)
                            .unwrap_or(NULL_TEXT)
                            .to_string();
                        values.push(v);
                    }
                    SelectItem::Subquery(_) => {
                        values.push(scalar_values[&i].clone());
                    }
                    SelectItem::Aggregate(_) => unreachable!("aggregates take the grouped path"),
                }
            }
            rows.push(Record::new(values));
        }

        Ok(PlanResult {
            output: QueryOutput { columns, rows },
            derived_fields,
        })
    }

    fn finish_grouped(
        &self,
        plan: &QueryPlan,
        matched: Vec<Record>,
        combined: &TableSchema,
        ctx: &mut QueryContext,
        guard: &mut SharedLocks<'_>,
    ) -> Result<PlanResult> {
        // Every non-aggregate select item must appear in GROUP BY.
        let group_set: HashSet<String> = plan
            .group_by
            .iter()
            .map(|g| g.to_ascii_lowercase())
            .collect();
        for sel in &plan.select_exprs {
            if let SelectItem::Column(name) = &sel.item {
                if name != "*" && !group_set.contains(&name.to_ascii_lowercase()) {
                    return Err(Error::NotSupported(format!(
                        "non-aggregate column '{name}' not in GROUP BY"
                    )));
                }
            }
        }

        struct AggState {
            func: AggregateFunc,
            field: String,
            count: u64,
            sum: f64,
            min: Option<String>,
            max: Option<String>,
        }
        struct Group {
            values: HashMap<String, String>,
            aggs: Vec<AggState>,
        }

        let aggregates = plan.aggregates();
        let new_agg_states = || -> Vec<AggState> {
            aggregates
                .iter()
                .map(|a| AggState {
                    func: a.func,
                    field: a.field.clone(),
                    count: 0,
                    sum: 0.0,
                    min: None,
                    max: None,
                })
                .collect()
        };
        let mut groups: Vec<(String, Group)> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for rec in &matched {
            let mut key = String::new();
            for g in &plan.group_by {
                let v = predicate::field_value(combined, rec, g).ok_or_else(|| {
                    Error::ColumnNotFound(g.clone(), "GROUP BY".to_string())
                })?;
                key.push_str(v);
                key.push('\x1f');
            }
            let gi = match group_index.get(&key) {
                Some(gi) => *gi,
                None => {
                    let mut values = HashMap::new();
                    for g in &plan.group_by {
                        let v = predicate::field_value(combined, rec, g).unwrap_or(NULL_TEXT);
                        values.insert(g.to_ascii_lowercase(), v.to_string());
                    }
                    groups.push((
                        key.clone(),
                        Group {
                            values,
                            aggs: new_agg_states(),
                        },
                    ));
                    group_index.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };

            for state in &mut groups[gi].1.aggs {
                match state.func {
                    AggregateFunc::Count => {
                        if state.field == "*" || state.field.is_empty() {
                            state.count += 1;
                        } else {
                            let v = predicate::field_value(combined, rec, &state.field)
                                .ok_or_else(|| {
                                    Error::ColumnNotFound(state.field.clone(), "COUNT".to_string())
                                })?;
                            if !predicate::is_null(v) {
                                state.count += 1;
                            }
                        }
                    }
                    AggregateFunc::Sum | AggregateFunc::Avg => {
                        let v = predicate::field_value(combined, rec, &state.field)
                            .ok_or_else(|| {
                                Error::ColumnNotFound(
                                    state.field.clone(),
                                    state.func.as_str().to_string(),
                                )
                            })?;
                        if predicate::is_null(v) {
                            continue;
                        }
                        let n = predicate::as_number(predicate::normalize_value(v)).ok_or_else(
                            || {
                                Error::NotSupported(format!(
                                    "{} requires a numeric column: {}",
                                    state.func.as_str(),
                                    state.field
                                ))
                            },
                        )?;
                        state.sum += n;
                        state.count += 1;
                    }
                    AggregateFunc::Min | AggregateFunc::Max => {
                        let v = predicate::field_value(combined, rec, &state.field)
                            .ok_or_else(|| {
                                Error::ColumnNotFound(
                                    state.field.clone(),
                                    state.func.as_str().to_string(),
                                )
                            })?;
                        if predicate::is_null(v) {
                            continue;
                        }
                        let v = predicate::normalize_value(v);
                        let less = |a: &str, b: &str| {
                            predicate::compare_values(a, b) == Ordering::Less
                        };
                        match &mut state.min {
                            Some(cur) if !less(v, cur) => {}
                            slot => *slot = Some(v.to_string()),
                        }
                        match &mut state.max {
                            Some(cur) if !less(cur, v) => {}
                            slot => *slot = Some(v.to_string()),
                        }
                    }
                }
            }
        }

        // An ungrouped aggregate over zero rows still yields one row
        // (COUNT(*) of an empty table is 0, SUM/MIN/MAX are NULL).
        if groups.is_empty() && plan.group_by.is_empty() {
            groups.push((
                String::new(),
                Group {
                    values: HashMap::new(),
                    aggs: new_agg_states(),
                },
            ));
        }

        // Derived schema: one column per select expression.
        let labels: Vec<String> = plan
            .select_exprs
            .iter()
            .enumerate()
            .map(|(i, sel)| sel.label(i))
            .collect();
        let out_schema = TableSchema {
            name: String::new(),
            fields: labels.iter().map(|l| Field::new(l.clone(), "string")).collect(),
            ..Default::default()
        };

        let mut agg_rows = Vec::with_capacity(groups.len());
        for (_, group) in &groups {
            let mut values = Vec::with_capacity(plan.select_exprs.len());
            let mut agg_i = 0usize;
            for sel in &plan.select_exprs {
                match &sel.item {
                    SelectItem::Aggregate(_) => {
                        let state = &group.aggs[agg_i];
                        agg_i += 1;
                        let v = match state.func {
                            AggregateFunc::Count => state.count.to_string(),
                            AggregateFunc::Sum => {
                                if state.count == 0 {
                                    NULL_TEXT.to_string()
                                } else {
                                    format_number(state.sum)
                                }
                            }
                            AggregateFunc::Avg => {
                                if state.count == 0 {
                                    NULL_TEXT.to_string()
                                } else {
                                    format_number(state.sum / state.count as f64)
                                }
                            }
                            AggregateFunc::Min => {
                                state.min.clone().unwrap_or_else(|| NULL_TEXT.to_string())
                            }
                            AggregateFunc::Max => {
                                state.max.clone().unwrap_or_else(|| NULL_TEXT.to_string())
                            }
                        };
                        values.push(v);
                    }
                    SelectItem::Column(name) => {
                        let v = group
                            .values
                            .get(&name.to_ascii_lowercase())
                            .cloned()
                            .unwrap_or_else(|| NULL_TEXT.to_string());
                        values.push(v);
                    }
                    SelectItem::Subquery(_) => values.push(NULL_TEXT.to_string()),
                }
            }
            agg_rows.push(Record::new(values));
        }

        // Aliases and canonical aggregate spellings both resolve onto
        // the output labels, for HAVING and ORDER BY alike.
        let mut alias_map = HashMap::new();
        for (i, sel) in plan.select_exprs.iter().enumerate() {
            let label = sel.label(i);
            if let Some(alias) = &sel.alias {
                alias_map.insert(alias.to_ascii_lowercase(), label.clone());
                if let SelectItem::Column(name) = &sel.item {
                    alias_map.insert(name.to_ascii_lowercase(), label.clone());
                }
            }
            if let SelectItem::Aggregate(agg) = &sel.item {
                alias_map.insert(agg.label().to_ascii_lowercase(), label.clone());
            }
        }

        // HAVING filters the aggregated rows through the same
        // predicate engine over the derived schema.
        if !plan.having.is_empty() {
            match self.resolve_conditions(&plan.having, ctx, guard)? {
                None => agg_rows.clear(),
                Some(mut having) => {
                    for cond in having.iter_mut() {
                        if let Some(label) = alias_map.get(&cond.field.to_ascii_lowercase()) {
                            cond.field = label.clone();
                        }
                    }
                    let mut kept = Vec::with_capacity(agg_rows.len());
                    for rec in agg_rows {
                        if predicate::match_conditions(&out_schema, &rec, &having)? {
                            kept.push(rec);
                        }
                    }
                    agg_rows = kept;
                }
            }
        }

        if !plan.order_by.is_empty() {
            let keys = resolve_order_keys(&plan.order_by, &alias_map, &out_schema)?;
            sort_records(&mut agg_rows, &out_schema, &keys);
        }

        Ok(PlanResult {
            output: QueryOutput {
                columns: labels,
                rows: agg_rows,
            },
            derived_fields: out_schema.fields,
        })
    }
}

// ========== Helpers ==========

fn find_schema<'s>(schemas: &'s [TableSchema], name: &str) -> Result<&'s TableSchema> {
    schemas
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::TableNotFound(name.to_string()))
}

/// Prefix raw field names with the table alias, leaving already
/// qualified names alone.
fn qualified_fields(fields: &[Field], prefix: Option<&str>) -> Vec<Field> {
    fields
        .iter()
        .map(|f| {
            let mut nf = f.clone();
            if let Some(prefix) = prefix {
                if !prefix.is_empty() && !f.name.contains('.') {
                    nf.name = format!("{prefix}.{}", f.name);
                }
            }
            nf
        })
        .collect()
}

/// Wrap an executed plan as a source. With an alias, columns are
/// re-qualified under it (`alias.col`); without one the inner
/// qualified names are kept so chained-join ON clauses still resolve.
fn derived_source(inner: PlanResult, prefix: Option<&str>) -> Source {
    let fields = inner
        .derived_fields
        .iter()
        .map(|f| {
            let mut nf = f.clone();
            if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
                nf.name = format!("{prefix}.{}", unqualified(&f.name));
            }
            nf
        })
        .collect();
    let offsets = vec![None; inner.output.rows.len()];
    Source {
        fields,
        rows: inner.output.rows,
        offsets,
        lock_table: None,
    }
}

fn combined_fields(left: &Source, right: Option<&Source>) -> Vec<Field> {
    let mut fields = left.fields.clone();
    if let Some(right) = right {
        fields.extend(right.fields.iter().cloned());
    }
    fields
}

fn combine_records(left: &Record, right: &Record) -> Record {
    let mut values = left.values.clone();
    values.extend(right.values.iter().cloned());
    Record::new(values)
}

fn lock_row(guard: &mut SharedLocks<'_>, source: &Source, index: usize) -> Result<()> {
    if let (Some(table), Some(Some(offset))) = (&source.lock_table, source.offsets.get(index)) {
        guard.acquire(Rid::new(table.clone(), *offset))?;
    }
    Ok(())
}

fn unqualified(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Columns shared by name between the two sides of a natural join, as
/// (left index, right index) pairs.
fn natural_join_pairs(left: &Source, right: &Source) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (li, lf) in left.fields.iter().enumerate() {
        let lname = unqualified(&lf.name).to_ascii_lowercase();
        for (ri, rf) in right.fields.iter().enumerate() {
            if unqualified(&rf.name).to_ascii_lowercase() == lname {
                pairs.push((li, ri));
                break;
            }
        }
    }
    pairs
}

/// Positions in the combined schema that `*` projects: all fields,
/// except that a natural join keeps only the first occurrence of each
/// shared column name.
fn star_projection(plan: &QueryPlan, combined: &TableSchema) -> Vec<usize> {
    let natural = plan.join.as_ref().map(|j| j.natural).unwrap_or(false);
    if !natural {
        return (0..combined.fields.len()).collect();
    }
    let mut seen = HashSet::new();
    let mut keep = Vec::new();
    for (i, f) in combined.fields.iter().enumerate() {
        if seen.insert(unqualified(&f.name).to_ascii_lowercase()) {
            keep.push(i);
        }
    }
    keep
}

/// User-facing column labels plus the qualified fields an enclosing
/// query sees, aligned with the projected values.
fn projection_labels(
    plan: &QueryPlan,
    combined: &TableSchema,
    star_positions: &[usize],
) -> (Vec<String>, Vec<Field>) {
    let mut columns = Vec::new();
    let mut derived = Vec::new();
    for (i, sel) in plan.select_exprs.iter().enumerate() {
        match &sel.item {
            SelectItem::Column(name) if name == "*" => {
                for pos in star_positions {
                    let f = &combined.fields[*pos];
                    columns.push(unqualified(&f.name).to_string());
                    derived.push(f.clone());
                }
            }
            _ => {
                let label = sel.label(i);
                columns.push(label.clone());
                derived.push(Field::new(label, "string"));
            }
        }
    }
    (columns, derived)
}

/// Map ORDER BY entries (possibly aliases) onto resolvable columns.
fn resolve_order_keys(
    order_by: &[(String, bool)],
    alias_map: &HashMap<String, String>,
    schema: &TableSchema,
) -> Result<Vec<(String, bool)>> {
    let mut keys = Vec::with_capacity(order_by.len());
    for (name, ascending) in order_by {
        let resolved = alias_map
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| name.clone());
        if !predicate::field_exists(schema, &resolved) {
            return Err(Error::ColumnNotFound(name.clone(), "ORDER BY".to_string()));
        }
        keys.push((resolved, *ascending));
    }
    Ok(keys)
}

fn sort_records(rows: &mut [Record], schema: &TableSchema, keys: &[(String, bool)]) {
    rows.sort_by(|a, b| {
        for (key, ascending) in keys {
            let av = predicate::field_value(schema, a, key).unwrap_or("");
            let bv = predicate::field_value(schema, b, key).unwrap_or("");
            let ord = predicate::compare_values(
                predicate::normalize_value(av),
                predicate::normalize_value(bv),
            );
            if ord != Ordering::Equal {
                return if *ascending { ord } else { ord.reverse() };
            }
        }
        Ordering::Equal
    });
}

/// Render an aggregate result: integral values without a fraction.
fn format_number(n: f64) -> String {
    if n.fract().abs() < 1e-9 && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-4.0), "-4");
    }

    #[test]
    fn test_star_projection_dedups_natural_join() {
        let mut plan = QueryPlan::default();
        plan.join = Some(crate::sql::ast::JoinClause {
            table: "s".into(),
            alias: None,
            join_type: JoinType::Inner,
            natural: true,
            on_left: String::new(),
            on_right: String::new(),
        });
        let combined = TableSchema {
            name: String::new(),
            fields: vec![
                Field::new("r.id", "int"),
                Field::new("r.a", "char[4]"),
                Field::new("s.id", "int"),
                Field::new("s.b", "char[4]"),
            ],
            ..Default::default()
        };
        assert_eq!(star_projection(&plan, &combined), vec![0, 1, 3]);
    }

    #[test]
    fn test_view_context_guards() {
        let mut ctx = QueryContext::new();
        ctx.enter_view("v1").unwrap();
        let err = ctx.enter_view("V1").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        ctx.leave_view();
        for i in 0..MAX_VIEW_DEPTH {
            ctx.enter_view(&format!("v{i}")).unwrap();
        }
        assert!(ctx.enter_view("deep").is_err());
    }
}
