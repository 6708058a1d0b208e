//! In-memory model of table structure: what the catalog reports
//! ([`SchemaSnapshot`]) and what a migration wants ([`TargetSchema`]).

mod snapshot;
mod target;
mod types;

pub use snapshot::{SchemaSnapshot, TableSnapshot};
pub use target::{TargetColumn, TargetSchema, TargetTable};
pub use types::{
    is_text_type, normalize_type, Collation, ColumnDescriptor, ColumnShape, ForeignKeyDescriptor,
    IndexDescriptor, ReferentialAction,
};
