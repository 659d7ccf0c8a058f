//! Record representation
//!
//! Values are stored as text; comparison rules that coerce them to
//! numbers live in `executor::predicate`.

use serde::{Deserialize, Serialize};

/// The textual representation of SQL NULL.
pub const NULL_TEXT: &str = "NULL";

/// A single row: a tombstone bit plus one value per schema field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Cleared to false when the record is logically deleted
    pub valid: bool,
    /// Field values aligned with the schema's field order
    pub values: Vec<String>,
}

impl Record {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            valid: true,
            values,
        }
    }

    /// Build a record from string literals, for tests and fixtures.
    pub fn from_strs(values: &[&str]) -> Self {
        Self::new(values.iter().map(|v| v.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_starts_valid() {
        let rec = Record::from_strs(&["1", "a"]);
        assert!(rec.valid);
        assert_eq!(rec.values, vec!["1", "a"]);
    }
}
