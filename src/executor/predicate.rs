//! Value coercion and predicate matching
//!
//! All comparison rules live here so typed columns can be introduced
//! later without touching the executors. Values are text; comparison
//! is numeric when both sides parse as numbers and lexicographic
//! otherwise.

use std::cmp::Ordering;

use crate::catalog::{Record, TableSchema};
use crate::error::{Error, Result};
use crate::sql::ast::{CompareOp, Condition};

/// Tolerance for numeric equality after f64 coercion.
const EPSILON: f64 = 1e-9;

/// Strip one layer of matching quotes from a stored or literal value.
pub fn normalize_value(s: &str) -> &str {
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (f, l) = (b[0], b[b.len() - 1]);
        if (f == b'\'' && l == b'\'') || (f == b'"' && l == b'"') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// SQL NULL: the literal NULL (any case) or an empty value.
pub fn is_null(s: &str) -> bool {
    s.is_empty() || s.eq_ignore_ascii_case("NULL")
}

/// Numeric coercion; the whole string must parse.
pub fn as_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Numeric-first ordering with lexicographic fallback.
pub fn compare_values(a: &str, b: &str) -> Ordering {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        if (x - y).abs() < EPSILON {
            return Ordering::Equal;
        }
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    a.cmp(b)
}

/// Numeric-first equality.
pub fn values_equal(a: &str, b: &str) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// LIKE with the three wildcard shapes `%x%`, `%x`, `x%`, plus the
/// literal pattern.
pub fn like_match(value: &str, pattern: &str) -> bool {
    if let Some(inner) = pattern
        .strip_prefix('%')
        .and_then(|p| p.strip_suffix('%'))
    {
        return value.contains(inner);
    }
    if let Some(suffix) = pattern.strip_prefix('%') {
        return value.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('%') {
        return value.starts_with(prefix);
    }
    value == pattern
}

/// Find a value by column reference: exact name match first, then
/// unqualified suffix match so `id` resolves `t1.id`. Case-insensitive.
pub fn field_value<'a>(schema: &TableSchema, record: &'a Record, name: &str) -> Option<&'a str> {
    field_position(schema, name).and_then(|i| record.values.get(i).map(|s| s.as_str()))
}

/// Column position under the same resolution rules as [`field_value`].
pub fn field_position(schema: &TableSchema, name: &str) -> Option<usize> {
    if name.is_empty() {
        return None;
    }
    if let Some(i) = schema.field_index(name) {
        return Some(i);
    }
    if !name.contains('.') {
        for (i, f) in schema.fields.iter().enumerate() {
            if let Some(dot) = f.name.rfind('.') {
                if f.name[dot + 1..].eq_ignore_ascii_case(name) {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// Does the column reference resolve in this schema?
pub fn field_exists(schema: &TableSchema, name: &str) -> bool {
    field_position(schema, name).is_some()
}

/// Evaluate one condition against a record. Subquery conditions must
/// be resolved into literal form before matching.
pub fn match_condition(schema: &TableSchema, record: &Record, cond: &Condition) -> Result<bool> {
    if cond.subquery.is_some() {
        return Err(Error::NotSupported(format!(
            "unresolved subquery in {} condition",
            cond.op.as_str()
        )));
    }
    match cond.op {
        CompareOp::Exists | CompareOp::NotExists => {
            return Err(Error::NotSupported(format!(
                "unresolved {} condition",
                cond.op.as_str()
            )))
        }
        _ => {}
    }
    // A conjunct without a field (e.g. an already-resolved EXISTS)
    // passes.
    if cond.field.is_empty() {
        return Ok(true);
    }
    let value = match field_value(schema, record, &cond.field) {
        Some(v) => normalize_value(v).to_string(),
        None => return Ok(false),
    };
    let rhs = normalize_value(&cond.value);

    let matched = match cond.op {
        CompareOp::Eq => values_equal(&value, rhs),
        CompareOp::NotEq => !values_equal(&value, rhs),
        CompareOp::Lt => compare_values(&value, rhs) == Ordering::Less,
        CompareOp::LtEq => compare_values(&value, rhs) != Ordering::Greater,
        CompareOp::Gt => compare_values(&value, rhs) == Ordering::Greater,
        CompareOp::GtEq => compare_values(&value, rhs) != Ordering::Less,
        CompareOp::Contains => value.contains(rhs),
        CompareOp::Like => like_match(&value, rhs),
        CompareOp::NotLike => !like_match(&value, rhs),
        CompareOp::Between => {
            if cond.values.len() != 2 {
                false
            } else {
                let lo = normalize_value(&cond.values[0]);
                let hi = normalize_value(&cond.values[1]);
                compare_values(&value, lo) != Ordering::Less
                    && compare_values(&value, hi) != Ordering::Greater
            }
        }
        CompareOp::In => cond
            .values
            .iter()
            .any(|v| values_equal(&value, normalize_value(v))),
        CompareOp::Exists | CompareOp::NotExists => unreachable!("handled above"),
    };
    Ok(matched)
}

/// Conjunction over all conditions.
pub fn match_conditions(
    schema: &TableSchema,
    record: &Record,
    conditions: &[Condition],
) -> Result<bool> {
    for cond in conditions {
        if !match_condition(schema, record, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}
