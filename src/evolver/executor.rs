use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use sea_orm::{ConnectionTrait, DbBackend};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::render::{null_count_statement, orphan_count_statement, render};
use super::step::{MigrationPlan, MigrationStep};
use crate::backfill::{BackfillReport, BackfillRunner, UnresolvedPolicy};
use crate::config::AppConfig;
use crate::db::count_rows;
use crate::errors::{is_already_satisfied, is_constraint_violation, MigrationError, Result};

/// How one step ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    /// The store reported the object was already in the desired state
    AlreadySatisfied,
    Backfilled(BackfillReport),
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct AppliedStep {
    pub index: usize,
    pub step: MigrationStep,
    pub outcome: StepOutcome,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Record of what a run actually did, in execution order
#[derive(Clone, Debug, Serialize)]
pub struct AppliedLog {
    pub started_at: DateTime<Utc>,
    pub entries: Vec<AppliedStep>,
}

impl Default for AppliedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AppliedLog {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    fn record(&mut self, index: usize, step: &MigrationStep, outcome: StepOutcome, elapsed: Duration) {
        self.entries.push(AppliedStep {
            index,
            step: step.clone(),
            outcome,
            elapsed,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Steps that completed, in order
    pub fn committed(&self) -> impl Iterator<Item = &AppliedStep> {
        self.entries
            .iter()
            .filter(|entry| !matches!(entry.outcome, StepOutcome::Failed { .. }))
    }

    /// Steps that changed the schema during this run, newest first, turned
    /// into the plan that reverses them. No-op and backfill steps are skipped.
    pub fn compensation_plan(&self) -> MigrationPlan {
        MigrationPlan::new(
            self.entries
                .iter()
                .rev()
                .filter(|entry| entry.outcome == StepOutcome::Applied)
                .filter_map(|entry| entry.step.inverse())
                .collect(),
        )
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Execution switches for [`SchemaEvolver::apply`]
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// Stop at the first failing step
    pub fail_fast: bool,
    pub unresolved: UnresolvedPolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            fail_fast: true,
            unresolved: UnresolvedPolicy::default(),
        }
    }
}

impl From<&AppConfig> for ApplyOptions {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            fail_fast: cfg.fail_fast,
            unresolved: cfg.unresolved_backfill,
        }
    }
}

/// Runs plans against a live connection, one step at a time
pub struct SchemaEvolver<'c, C> {
    conn: &'c C,
    options: ApplyOptions,
}

impl<'c, C: ConnectionTrait> SchemaEvolver<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self {
            conn,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Executes every step in order.
    ///
    /// DDL is not transactional on every engine, so there is no rollback on
    /// failure; the error carries the log of what was committed and the
    /// compensation plan can be derived from it.
    #[instrument(skip_all, fields(steps = plan.len()))]
    pub async fn apply(&self, plan: &MigrationPlan) -> Result<AppliedLog> {
        let backend = self.conn.get_database_backend();
        let mut log = AppliedLog::new();
        let mut first_failure: Option<(usize, MigrationStep, MigrationError)> = None;

        for (index, step) in plan.iter().enumerate() {
            info!(index, step = %step, "Applying step");
            let started = Instant::now();
            let result = self.apply_step(backend, step).await;
            let elapsed = started.elapsed();
            histogram!("pos_migrate.step.duration", elapsed, "op" => step.kind());

            match result {
                Ok(outcome) => {
                    counter!("pos_migrate.step.applied", 1, "op" => step.kind());
                    debug!(index, outcome = ?outcome, elapsed_ms = elapsed.as_millis() as u64, "Step done");
                    log.record(index, step, outcome, elapsed);
                }
                Err(err) => {
                    counter!("pos_migrate.step.failed", 1, "op" => step.kind());
                    error!(index, step = %step, error = %err, "Step failed");
                    if self.options.fail_fast {
                        return Err(MigrationError::StepFailed {
                            index,
                            step: Box::new(step.clone()),
                            committed: log,
                            source: Box::new(err),
                        });
                    }
                    log.record(
                        index,
                        step,
                        StepOutcome::Failed {
                            error: err.to_string(),
                        },
                        elapsed,
                    );
                    if first_failure.is_none() {
                        first_failure = Some((index, step.clone(), err));
                    }
                }
            }
        }

        match first_failure {
            Some((index, step, err)) => Err(MigrationError::StepFailed {
                index,
                step: Box::new(step),
                committed: log,
                source: Box::new(err),
            }),
            None => Ok(log),
        }
    }

    async fn apply_step(&self, backend: DbBackend, step: &MigrationStep) -> Result<StepOutcome> {
        if let MigrationStep::BackfillColumn(spec) = step {
            let report = BackfillRunner::new(self.conn)
                .with_policy(self.options.unresolved)
                .backfill(spec)
                .await?;
            return Ok(StepOutcome::Backfilled(report));
        }

        self.precheck(backend, step).await?;

        for stmt in render(step, backend)? {
            debug!(sql = %stmt.sql, "Executing DDL");
            if let Err(err) = self.conn.execute(stmt).await {
                if is_already_satisfied(&err, step.is_removal()) {
                    warn!(step = %step, error = %err, "Step already satisfied, continuing");
                    return Ok(StepOutcome::AlreadySatisfied);
                }
                if is_constraint_violation(&err) {
                    return Err(MigrationError::ConstraintViolation {
                        table: step.table().to_string(),
                        column: step.column().unwrap_or_default().to_string(),
                        violating_rows: 0,
                        detail: format!("rejected by the store: {}", err),
                    });
                }
                return Err(MigrationError::db_error(err));
            }
        }
        Ok(StepOutcome::Applied)
    }

    /// Refuses steps that live data would reject, before any DDL runs
    async fn precheck(&self, backend: DbBackend, step: &MigrationStep) -> Result<()> {
        match step {
            MigrationStep::ModifyColumnConstraint { table, column, .. } if step.tightens() => {
                let nulls = count_rows(self.conn, null_count_statement(backend, table, column)).await?;
                if nulls > 0 {
                    return Err(MigrationError::ConstraintViolation {
                        table: table.clone(),
                        column: column.clone(),
                        violating_rows: nulls,
                        detail: "are NULL and would violate NOT NULL".to_string(),
                    });
                }
            }
            MigrationStep::AddForeignKey { table, foreign_key } => {
                let orphans =
                    count_rows(self.conn, orphan_count_statement(backend, table, foreign_key)).await?;
                if orphans > 0 {
                    return Err(MigrationError::ConstraintViolation {
                        table: table.clone(),
                        column: foreign_key.column.clone(),
                        violating_rows: orphans,
                        detail: format!(
                            "reference rows missing from {}.{}",
                            foreign_key.referenced_table, foreign_key.referenced_column
                        ),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}
