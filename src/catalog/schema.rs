//! Schema definitions for quilldb
//!
//! Tables, columns, indexes and foreign keys. Schemas are plain values:
//! DDL builds a new schema list and saves it; nothing mutates a schema
//! that another reader might hold.

use serde::{Deserialize, Serialize};

/// Column definition in a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Type name as written, e.g. "int" or "char[8]"
    pub type_name: String,
    /// Declared byte size (n for char[n], 0 when unsized)
    pub size: u32,
    /// Is this column part of the primary key?
    pub is_key: bool,
    /// Does this column accept NULL?
    pub nullable: bool,
    /// Soft-delete flag under schema evolution
    pub valid: bool,
}

impl Field {
    /// Create a plain nullable column.
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            size: 0,
            is_key: false,
            nullable: true,
            valid: true,
        }
    }

    /// Mark the column as primary key (implies NOT NULL).
    pub fn key(mut self) -> Self {
        self.is_key = true;
        self.nullable = false;
        self
    }

    /// Set the nullable flag.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Single-column index definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name (PRIMARY for auto-created key indexes)
    pub name: String,
    /// The column the index covers
    pub column: String,
    /// Unique index?
    pub unique: bool,
}

/// Referential action for ON DELETE / ON UPDATE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferentialAction {
    Restrict,
    Cascade,
    SetNull,
}

impl Default for ReferentialAction {
    fn default() -> Self {
        ReferentialAction::Restrict
    }
}

impl ReferentialAction {
    /// Single-byte encoding used in the `.dbf` file.
    pub fn as_byte(self) -> u8 {
        match self {
            ReferentialAction::Restrict => 0,
            ReferentialAction::Cascade => 1,
            ReferentialAction::SetNull => 2,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => ReferentialAction::Cascade,
            2 => ReferentialAction::SetNull,
            _ => ReferentialAction::Restrict,
        }
    }

    /// Parse a SQL action token (RESTRICT, CASCADE, SET NULL).
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "RESTRICT" => Some(ReferentialAction::Restrict),
            "CASCADE" => Some(ReferentialAction::Cascade),
            "SET NULL" => Some(ReferentialAction::SetNull),
            _ => None,
        }
    }
}

/// Foreign-key constraint definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    /// Constraint name; auto-generated when the statement omits it
    pub name: String,
    /// Referencing columns in the local table
    pub columns: Vec<String>,
    /// Referenced table
    pub ref_table: String,
    /// Referenced columns; empty means the referenced table's PK
    pub ref_columns: Vec<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl ForeignKeyDef {
    /// Two constraints are equivalent when they relate the same columns
    /// with the same actions, regardless of name.
    pub fn is_equivalent(&self, other: &ForeignKeyDef) -> bool {
        self.columns == other.columns
            && self.ref_table.eq_ignore_ascii_case(&other.ref_table)
            && self.ref_columns == other.ref_columns
            && self.on_delete == other.on_delete
            && self.on_update == other.on_update
    }
}

/// Table schema - the unit stored per table block in the `.dbf` catalog
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table (or view) name
    pub name: String,
    /// Ordered column list
    pub fields: Vec<Field>,
    /// Index definitions
    pub indexes: Vec<IndexDef>,
    /// Foreign-key definitions
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Is this schema a view? Views never hold data in `.dat`.
    pub is_view: bool,
    /// Stored SELECT text when `is_view` is set
    pub view_sql: String,
}

impl TableSchema {
    /// Create an empty table schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Position of a column by case-insensitive exact name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Column lookup by case-insensitive exact name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    /// Names of the primary-key columns, in schema order.
    pub fn key_columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.is_key)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Does an index (unique or not) cover the given column?
    pub fn index_on(&self, column: &str) -> Option<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.column.eq_ignore_ascii_case(column))
    }

    /// True when the given column set is the PK or covered by a unique
    /// index (single-column unique indexes only, matching the on-disk
    /// index model).
    pub fn has_unique_over(&self, columns: &[String]) -> bool {
        let keys = self.key_columns();
        if !keys.is_empty()
            && keys.len() == columns.len()
            && keys
                .iter()
                .zip(columns)
                .all(|(k, c)| k.eq_ignore_ascii_case(c))
        {
            return true;
        }
        if columns.len() == 1 {
            if let Some(idx) = self.index_on(&columns[0]) {
                return idx.unique;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableSchema {
        let mut schema = TableSchema::new("users");
        schema.fields.push(Field::new("id", "int").key());
        schema.fields.push(Field::new("name", "char[16]").not_null());
        schema.fields.push(Field::new("email", "char[32]"));
        schema.indexes.push(IndexDef {
            name: "PRIMARY".to_string(),
            column: "id".to_string(),
            unique: true,
        });
        schema
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let schema = sample();
        assert_eq!(schema.field_index("ID"), Some(0));
        assert_eq!(schema.field_index("Email"), Some(2));
        assert_eq!(schema.field_index("missing"), None);
    }

    #[test]
    fn test_key_columns() {
        let schema = sample();
        assert_eq!(schema.key_columns(), vec!["id"]);
    }

    #[test]
    fn test_unique_coverage() {
        let schema = sample();
        assert!(schema.has_unique_over(&["id".to_string()]));
        assert!(!schema.has_unique_over(&["name".to_string()]));
    }

    #[test]
    fn test_referential_action_bytes() {
        for action in [
            ReferentialAction::Restrict,
            ReferentialAction::Cascade,
            ReferentialAction::SetNull,
        ] {
            assert_eq!(ReferentialAction::from_byte(action.as_byte()), action);
        }
        assert_eq!(ReferentialAction::parse("set null"), Some(ReferentialAction::SetNull));
    }
}
