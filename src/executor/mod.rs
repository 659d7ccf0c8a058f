//! Statement execution
//!
//! - `predicate`: value coercion and condition matching, shared by
//!   every path that filters rows
//! - `query`: SELECT execution (scans, joins, grouping, subqueries,
//!   views)
//! - `dml`: INSERT/UPDATE/DELETE under WAL + locks
//! - `ddl`: schema changes, indexes, foreign keys, views

pub mod ddl;
pub mod dml;
pub mod predicate;
pub mod query;

pub use ddl::DdlService;
pub use dml::DmlService;
pub use query::{QueryContext, QueryOutput, QueryService};
