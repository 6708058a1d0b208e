//! Named migrations and their lifecycle.
//!
//! A [`Migration`] only declares the schema it wants. Both directions are
//! derived from that one declaration, so up and down always agree on the
//! names of what they create and drop.

use sea_orm::{ConnectionTrait, DbErr};
use sea_orm_migration::{MigrationName, MigrationTrait, SchemaManager};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::errors::{MigrationError, Result};
use crate::evolver::{self, AppliedLog, ApplyOptions, MigrationPlan, SchemaEvolver};
use crate::inspector::SchemaInspector;
use crate::schema::{SchemaSnapshot, TargetSchema};

/// A named, reversible schema change
pub trait Migration: Send + Sync {
    /// Unique, sortable name, e.g. `m20240611_000002_add_tenant_to_companies`
    fn name(&self) -> &str;

    /// The structure the affected tables have once the migration is applied
    fn target(&self) -> TargetSchema;
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    /// Pending, Failed and RolledBack may be (re)applied; only Applied may
    /// be rolled back.
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Applied)
                | (Pending, Failed)
                | (Failed, Applied)
                | (Failed, Failed)
                | (Applied, RolledBack)
                | (RolledBack, Applied)
                | (RolledBack, Failed)
        )
    }
}

/// One migration's progress through its lifecycle
#[derive(Clone, Debug, Serialize)]
pub struct MigrationRun {
    pub name: String,
    pub status: MigrationStatus,
    /// Log of the most recent apply or rollback
    pub log: Option<AppliedLog>,
}

impl MigrationRun {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_status(name, MigrationStatus::Pending)
    }

    pub fn with_status(name: impl Into<String>, status: MigrationStatus) -> Self {
        Self {
            name: name.into(),
            status,
            log: None,
        }
    }

    pub fn transition(&mut self, next: MigrationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrationError::InvalidTransition {
                migration: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        info!(migration = %self.name, from = %self.status, to = %next, "Migration status changed");
        self.status = next;
        Ok(())
    }

    fn ensure_can(&self, next: MigrationStatus) -> Result<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(MigrationError::InvalidTransition {
                migration: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// Plans, applies and verifies migrations over one connection
pub struct MigrationRunner<'c, C> {
    conn: &'c C,
    schema: String,
    options: ApplyOptions,
}

impl<'c, C: ConnectionTrait> MigrationRunner<'c, C> {
    pub fn new(conn: &'c C, schema: impl Into<String>) -> Self {
        Self {
            conn,
            schema: schema.into(),
            options: ApplyOptions::default(),
        }
    }

    /// Runner for the connection's current schema
    pub async fn for_connection(conn: &'c C) -> Result<Self> {
        let schema = SchemaInspector::new(conn).current_schema().await?;
        Ok(Self::new(conn, schema))
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Live structure of every table the target touches or reads
    pub async fn snapshot(&self, target: &TargetSchema) -> Result<SchemaSnapshot> {
        SchemaInspector::new(self.conn)
            .snapshot(&self.schema, &target.referenced_tables())
            .await
    }

    /// Applied when nothing is left to do, Pending otherwise.
    ///
    /// Derived from the live schema, so a migration applied by hand or by an
    /// older tool also reports as Applied.
    pub async fn status(&self, migration: &dyn Migration) -> Result<MigrationStatus> {
        Ok(if self.plan_up(migration).await?.is_empty() {
            MigrationStatus::Applied
        } else {
            MigrationStatus::Pending
        })
    }

    pub async fn plan_up(&self, migration: &dyn Migration) -> Result<MigrationPlan> {
        let target = migration.target();
        let snapshot = self.snapshot(&target).await?;
        let plan = evolver::plan(&target, &snapshot)?;
        plan.validate(&snapshot)?;
        Ok(plan)
    }

    pub async fn plan_down(&self, migration: &dyn Migration) -> Result<MigrationPlan> {
        let target = migration.target();
        let snapshot = self.snapshot(&target).await?;
        evolver::rollback(&target, &snapshot)
    }

    /// Brings the schema to the migration's target and verifies the result.
    ///
    /// Running it again once applied does nothing.
    #[instrument(skip_all, fields(migration = %migration.name()))]
    pub async fn up(&self, migration: &dyn Migration, run: &mut MigrationRun) -> Result<AppliedLog> {
        if run.status == MigrationStatus::Applied {
            info!("Migration already applied");
            return Ok(AppliedLog::new());
        }
        run.ensure_can(MigrationStatus::Applied)?;

        let plan = self.plan_up(migration).await?;
        if plan.is_empty() {
            info!("Schema already matches the target");
            run.transition(MigrationStatus::Applied)?;
            run.log = Some(AppliedLog::new());
            return Ok(AppliedLog::new());
        }

        info!(steps = plan.len(), "Applying migration");
        let outcome = match SchemaEvolver::new(self.conn)
            .with_options(self.options.clone())
            .apply(&plan)
            .await
        {
            Ok(log) => self.verify_up(migration).await.map(|_| log),
            Err(err) => Err(err),
        };
        self.finish(run, outcome, MigrationStatus::Applied)
    }

    /// Reverses whatever part of the migration is present, then verifies
    /// none of it remains.
    #[instrument(skip_all, fields(migration = %migration.name()))]
    pub async fn down(&self, migration: &dyn Migration, run: &mut MigrationRun) -> Result<AppliedLog> {
        run.ensure_can(MigrationStatus::RolledBack)?;

        let plan = self.plan_down(migration).await?;
        info!(steps = plan.len(), "Rolling back migration");
        let outcome = match SchemaEvolver::new(self.conn)
            .with_options(self.options.clone())
            .apply(&plan)
            .await
        {
            Ok(log) => self.verify_down(migration).await.map(|_| log),
            Err(err) => Err(err),
        };
        self.finish(run, outcome, MigrationStatus::RolledBack)
    }

    fn finish(
        &self,
        run: &mut MigrationRun,
        outcome: Result<AppliedLog>,
        success: MigrationStatus,
    ) -> Result<AppliedLog> {
        match outcome {
            Ok(log) => {
                run.transition(success)?;
                run.log = Some(log.clone());
                Ok(log)
            }
            Err(err) => {
                warn!(migration = %run.name, error = %err, "Migration did not complete");
                if run.status.can_transition_to(MigrationStatus::Failed) {
                    run.status = MigrationStatus::Failed;
                }
                run.log = err.committed().cloned();
                Err(err)
            }
        }
    }

    async fn verify_up(&self, migration: &dyn Migration) -> Result<()> {
        let remaining = self.plan_up(migration).await?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::VerificationFailed {
                remaining: remaining.describe(),
            })
        }
    }

    async fn verify_down(&self, migration: &dyn Migration) -> Result<()> {
        let remaining = self.plan_down(migration).await?;
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::VerificationFailed {
                remaining: remaining.describe(),
            })
        }
    }
}

/// Exposes a [`Migration`] to sea-orm-migration, which records applied names
/// in its `seaql_migrations` table.
pub struct TrackedMigration {
    inner: Box<dyn Migration>,
    options: ApplyOptions,
}

impl TrackedMigration {
    pub fn new(inner: Box<dyn Migration>) -> Self {
        Self {
            inner,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }
}

fn into_db_err(err: MigrationError) -> DbErr {
    DbErr::Migration(err.to_string())
}

impl MigrationName for TrackedMigration {
    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[async_trait::async_trait]
impl MigrationTrait for TrackedMigration {
    async fn up(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        let runner = MigrationRunner::for_connection(manager.get_connection())
            .await
            .map_err(into_db_err)?
            .with_options(self.options.clone());
        let mut run = MigrationRun::new(self.inner.name());
        runner
            .up(self.inner.as_ref(), &mut run)
            .await
            .map(|_| ())
            .map_err(into_db_err)
    }

    async fn down(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        let runner = MigrationRunner::for_connection(manager.get_connection())
            .await
            .map_err(into_db_err)?
            .with_options(self.options.clone());
        let mut run = MigrationRun::with_status(self.inner.name(), MigrationStatus::Applied);
        runner
            .down(self.inner.as_ref(), &mut run)
            .await
            .map(|_| ())
            .map_err(into_db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status() -> impl Strategy<Value = MigrationStatus> {
        prop_oneof![
            Just(MigrationStatus::Pending),
            Just(MigrationStatus::Applied),
            Just(MigrationStatus::Failed),
            Just(MigrationStatus::RolledBack),
        ]
    }

    #[test]
    fn lifecycle_follows_the_state_machine() {
        let mut run = MigrationRun::new("m20240611_000002_add_tenant_to_companies");
        run.transition(MigrationStatus::Failed).unwrap();
        run.transition(MigrationStatus::Applied).unwrap();
        run.transition(MigrationStatus::RolledBack).unwrap();
        run.transition(MigrationStatus::Applied).unwrap();

        let err = run.transition(MigrationStatus::Pending).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidTransition { .. }));
        assert_eq!(run.status, MigrationStatus::Applied);
    }

    #[test]
    fn pending_cannot_be_rolled_back() {
        let mut run = MigrationRun::new("m");
        assert!(run.transition(MigrationStatus::RolledBack).is_err());
        assert_eq!(run.status.to_string(), "pending");
    }

    proptest! {
        #[test]
        fn nothing_returns_to_pending(from in status()) {
            prop_assert!(!from.can_transition_to(MigrationStatus::Pending));
        }

        #[test]
        fn rejected_transitions_leave_status_unchanged(from in status(), to in status()) {
            let mut run = MigrationRun::with_status("m", from);
            let allowed = from.can_transition_to(to);
            prop_assert_eq!(run.transition(to).is_ok(), allowed);
            prop_assert_eq!(run.status, if allowed { to } else { from });
        }
    }
}
