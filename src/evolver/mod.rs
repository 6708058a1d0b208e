//! Planning and applying schema changes.
//!
//! [`plan`] and [`rollback`] are pure functions of a target and a snapshot;
//! [`SchemaEvolver`] runs the resulting [`MigrationPlan`] against a store.

mod executor;
mod planner;
pub mod render;
mod step;

pub use executor::{AppliedLog, AppliedStep, ApplyOptions, SchemaEvolver, StepOutcome};
pub use planner::{plan, rollback};
pub use step::{MigrationPlan, MigrationStep};
