//! POS schema migrations
//!
//! Inspects a live MySQL, Postgres or SQLite schema, plans the minimal
//! ordered set of steps to reach a declared target, and applies them one at
//! a time. Every step is idempotent, so a plan that stopped halfway can
//! simply be planned and run again.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod backfill;
pub mod config;
pub mod db;
pub mod errors;
pub mod evolver;
pub mod inspector;
pub mod migration;
pub mod migrations;
pub mod migrator;
pub mod schema;

pub use backfill::{BackfillReport, BackfillRunner, BackfillSource, BackfillSpec, UnresolvedPolicy, UnsetSentinel};
pub use errors::{MigrationError, Result};
pub use evolver::{AppliedLog, ApplyOptions, MigrationPlan, MigrationStep, SchemaEvolver, StepOutcome};
pub use inspector::SchemaInspector;
pub use migration::{Migration, MigrationRun, MigrationRunner, MigrationStatus, TrackedMigration};
pub use schema::{SchemaSnapshot, TargetSchema};
