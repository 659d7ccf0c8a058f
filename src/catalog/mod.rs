//! Table metadata and record types
//!
//! The catalog is persisted in the `.dbf` file (see `storage`); this
//! module only defines the in-memory shapes.

pub mod record;
pub mod schema;

pub use record::{Record, NULL_TEXT};
pub use schema::{Field, ForeignKeyDef, IndexDef, ReferentialAction, TableSchema};
