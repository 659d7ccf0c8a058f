//! Tagged command AST produced by the parser
//!
//! One `Command` variant per statement tag; SELECT bodies become a
//! `QueryPlan`, which also nests recursively for subqueries and views.

use serde::Serialize;

use crate::catalog::{Field, ForeignKeyDef, Record, ReferentialAction, TableSchema};

/// Comparison operators accepted in WHERE / HAVING conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Contains,
    Like,
    NotLike,
    Between,
    In,
    Exists,
    NotExists,
}

impl CompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::Contains => "CONTAINS",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
            CompareOp::Between => "BETWEEN",
            CompareOp::In => "IN",
            CompareOp::Exists => "EXISTS",
            CompareOp::NotExists => "NOT EXISTS",
        }
    }
}

/// One conjunct of a WHERE / HAVING clause.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Condition {
    /// Column reference; empty for EXISTS / NOT EXISTS.
    pub field: String,
    pub op: CompareOp,
    /// Right-hand literal for comparators, LIKE pattern, etc.
    pub value: String,
    /// BETWEEN bounds or IN list.
    pub values: Vec<String>,
    /// Nested plan for IN / EXISTS / scalar comparisons.
    pub subquery: Option<Box<QueryPlan>>,
}

impl Default for CompareOp {
    fn default() -> Self {
        CompareOp::Eq
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
            values: Vec::new(),
            subquery: None,
        }
    }
}

/// Aggregate functions in the SELECT list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }
}

/// `FUNC(field)`; field is `*` for COUNT(*).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateExpr {
    pub func: AggregateFunc,
    pub field: String,
}

impl AggregateExpr {
    /// Label used for output columns and HAVING/ORDER references.
    pub fn label(&self) -> String {
        format!("{}({})", self.func.as_str(), self.field)
    }
}

/// One SELECT-list entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SelectItem {
    /// Plain column reference (or `*`).
    Column(String),
    Aggregate(AggregateExpr),
    /// Scalar subquery.
    Subquery(Box<QueryPlan>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectExpr {
    pub item: SelectItem,
    pub alias: Option<String>,
}

impl SelectExpr {
    /// Output column label: the alias when given, otherwise derived
    /// from the expression.
    pub fn label(&self, position: usize) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.item {
            SelectItem::Column(name) => name.clone(),
            SelectItem::Aggregate(agg) => agg.label(),
            SelectItem::Subquery(_) => format!("subquery_{position}"),
        }
    }
}

/// Join type for the single-level join a plan may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinClause {
    pub table: String,
    pub alias: Option<String>,
    pub join_type: JoinType,
    /// NATURAL join: the ON columns are inferred from shared names.
    pub natural: bool,
    pub on_left: String,
    pub on_right: String,
}

/// Parsed SELECT tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QueryPlan {
    /// Physical source table (or view); None when the source is a
    /// subquery.
    pub source_table: Option<String>,
    pub source_alias: Option<String>,
    /// Derived-table source, e.g. `FROM (SELECT …) s` or the left side
    /// of a chained join.
    pub source_subquery: Option<Box<QueryPlan>>,
    pub join: Option<JoinClause>,
    /// Projected column names in order; empty means `*` / expressions
    /// only.
    pub projection: Vec<String>,
    /// Aliases aligned with `projection`.
    pub projection_aliases: Vec<Option<String>>,
    /// The SELECT list in order, including aggregates and subqueries.
    pub select_exprs: Vec<SelectExpr>,
    pub conditions: Vec<Condition>,
    pub group_by: Vec<String>,
    pub having: Vec<Condition>,
    /// (column-or-alias, ascending) pairs.
    pub order_by: Vec<(String, bool)>,
}

impl QueryPlan {
    pub fn aggregates(&self) -> Vec<&AggregateExpr> {
        self.select_exprs
            .iter()
            .filter_map(|s| match &s.item {
                SelectItem::Aggregate(agg) => Some(agg),
                _ => None,
            })
            .collect()
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates().is_empty()
    }
}

/// Column placement for ALTER TABLE ... ADD COLUMN.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnPosition {
    Last,
    First,
    After(String),
}

/// Single ALTER TABLE sub-operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AlterOp {
    AddColumn { field: Field, position: ColumnPosition },
    DropColumn { column: String },
    ModifyColumn { field: Field },
    RenameColumn { column: String, new_name: String },
    RenameTable { new_name: String },
    AddIndex { index: String, column: String },
    DropIndex { index: String },
    AddForeignKey { fk: ForeignKeyDef },
    DropForeignKey { name: String },
}

/// The tagged command tree the dispatcher routes on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Command {
    CreateDatabase {
        db: String,
    },
    UseDatabase {
        db: String,
    },
    DropDatabase {
        db: String,
        action: Option<ReferentialAction>,
    },
    BackupDatabase {
        db: String,
        path: String,
    },
    RestoreDatabase {
        db: String,
        path: String,
    },
    Begin,
    Commit,
    Rollback,
    Checkpoint,
    Savepoint {
        name: String,
    },
    RollbackToSavepoint {
        name: String,
    },
    ReleaseSavepoint {
        name: String,
    },
    CreateUser {
        username: String,
        password: String,
    },
    DropUser {
        username: String,
    },
    Grant {
        privileges: Vec<String>,
        table: String,
        username: String,
    },
    Revoke {
        privileges: Vec<String>,
        table: String,
        username: String,
    },
    CreateIndex {
        index: String,
        table: String,
        column: String,
        unique: bool,
    },
    DropIndex {
        index: String,
        table: String,
    },
    ShowIndexes {
        table: String,
    },
    ShowTables {
        db: Option<String>,
    },
    CreateView {
        view: String,
        columns: Vec<String>,
        query: QueryPlan,
        sql: String,
        or_replace: bool,
    },
    DropView {
        view: String,
        if_exists: bool,
    },
    CreateTable {
        schema: TableSchema,
        db: Option<String>,
    },
    AlterTable {
        table: String,
        op: AlterOp,
    },
    RenameTable {
        table: String,
        new_name: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        records: Vec<Record>,
        db: Option<String>,
    },
    Select {
        plan: QueryPlan,
    },
    Update {
        table: String,
        assignments: Vec<(String, String)>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
        action: Option<ReferentialAction>,
    },
    DropTable {
        table: String,
        action: Option<ReferentialAction>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_label() {
        let agg = AggregateExpr {
            func: AggregateFunc::Count,
            field: "*".to_string(),
        };
        assert_eq!(agg.label(), "COUNT(*)");
    }

    #[test]
    fn test_select_expr_label_prefers_alias() {
        let expr = SelectExpr {
            item: SelectItem::Column("t.id".to_string()),
            alias: Some("key".to_string()),
        };
        assert_eq!(expr.label(0), "key");
        let expr = SelectExpr {
            item: SelectItem::Column("t.id".to_string()),
            alias: None,
        };
        assert_eq!(expr.label(0), "t.id");
    }

    #[test]
    fn test_plan_grouping_detection() {
        let mut plan = QueryPlan::default();
        assert!(!plan.is_grouped());
        plan.select_exprs.push(SelectExpr {
            item: SelectItem::Aggregate(AggregateExpr {
                func: AggregateFunc::Sum,
                field: "x".to_string(),
            }),
            alias: None,
        });
        assert!(plan.is_grouped());
    }
}
