use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backfill::BackfillSpec;
use crate::errors::{MigrationError, Result};
use crate::schema::{Collation, ColumnDescriptor, ColumnShape, ForeignKeyDescriptor, IndexDescriptor, SchemaSnapshot};

/// One structural or data change, idempotent against the live schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationStep {
    AddColumn {
        table: String,
        column: ColumnDescriptor,
    },
    DropColumn {
        table: String,
        column: ColumnDescriptor,
    },
    AddIndex {
        table: String,
        index: IndexDescriptor,
    },
    DropIndex {
        table: String,
        index: IndexDescriptor,
    },
    AddForeignKey {
        table: String,
        foreign_key: ForeignKeyDescriptor,
    },
    DropForeignKey {
        table: String,
        foreign_key: ForeignKeyDescriptor,
    },
    ConvertCollation {
        table: String,
        from: Option<Collation>,
        to: Collation,
    },
    BackfillColumn(BackfillSpec),
    ModifyColumnConstraint {
        table: String,
        column: String,
        from: ColumnShape,
        to: ColumnShape,
    },
}

impl MigrationStep {
    pub fn table(&self) -> &str {
        match self {
            MigrationStep::AddColumn { table, .. }
            | MigrationStep::DropColumn { table, .. }
            | MigrationStep::AddIndex { table, .. }
            | MigrationStep::DropIndex { table, .. }
            | MigrationStep::AddForeignKey { table, .. }
            | MigrationStep::DropForeignKey { table, .. }
            | MigrationStep::ConvertCollation { table, .. }
            | MigrationStep::ModifyColumnConstraint { table, .. } => table,
            MigrationStep::BackfillColumn(spec) => &spec.table,
        }
    }

    /// The column the step writes to, if it is column-scoped
    pub fn column(&self) -> Option<&str> {
        match self {
            MigrationStep::AddColumn { column, .. } | MigrationStep::DropColumn { column, .. } => {
                Some(&column.name)
            }
            MigrationStep::AddForeignKey { foreign_key, .. } => Some(&foreign_key.column),
            MigrationStep::ModifyColumnConstraint { column, .. } => Some(column),
            MigrationStep::BackfillColumn(spec) => Some(&spec.column),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MigrationStep::AddColumn { .. } => "add_column",
            MigrationStep::DropColumn { .. } => "drop_column",
            MigrationStep::AddIndex { .. } => "add_index",
            MigrationStep::DropIndex { .. } => "drop_index",
            MigrationStep::AddForeignKey { .. } => "add_foreign_key",
            MigrationStep::DropForeignKey { .. } => "drop_foreign_key",
            MigrationStep::ConvertCollation { .. } => "convert_collation",
            MigrationStep::BackfillColumn(_) => "backfill_column",
            MigrationStep::ModifyColumnConstraint { .. } => "modify_column_constraint",
        }
    }

    /// Drops, whose "already done" state is the object being absent
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            MigrationStep::DropColumn { .. }
                | MigrationStep::DropIndex { .. }
                | MigrationStep::DropForeignKey { .. }
        )
    }

    /// Nullable to NOT NULL
    pub fn tightens(&self) -> bool {
        matches!(
            self,
            MigrationStep::ModifyColumnConstraint { from, to, .. } if from.nullable && !to.nullable
        )
    }

    /// The step that undoes this one. Backfills have none; a collation change
    /// has none when the previous collation is unknown.
    pub fn inverse(&self) -> Option<MigrationStep> {
        match self {
            MigrationStep::AddColumn { table, column } => Some(MigrationStep::DropColumn {
                table: table.clone(),
                column: column.clone(),
            }),
            MigrationStep::DropColumn { table, column } => Some(MigrationStep::AddColumn {
                table: table.clone(),
                column: column.clone(),
            }),
            MigrationStep::AddIndex { table, index } => Some(MigrationStep::DropIndex {
                table: table.clone(),
                index: index.clone(),
            }),
            MigrationStep::DropIndex { table, index } => Some(MigrationStep::AddIndex {
                table: table.clone(),
                index: index.clone(),
            }),
            MigrationStep::AddForeignKey { table, foreign_key } => {
                Some(MigrationStep::DropForeignKey {
                    table: table.clone(),
                    foreign_key: foreign_key.clone(),
                })
            }
            MigrationStep::DropForeignKey { table, foreign_key } => {
                Some(MigrationStep::AddForeignKey {
                    table: table.clone(),
                    foreign_key: foreign_key.clone(),
                })
            }
            MigrationStep::ConvertCollation { table, from, to } => {
                from.as_ref().map(|previous| MigrationStep::ConvertCollation {
                    table: table.clone(),
                    from: Some(to.clone()),
                    to: previous.clone(),
                })
            }
            MigrationStep::BackfillColumn(_) => None,
            MigrationStep::ModifyColumnConstraint {
                table,
                column,
                from,
                to,
            } => Some(MigrationStep::ModifyColumnConstraint {
                table: table.clone(),
                column: column.clone(),
                from: to.clone(),
                to: from.clone(),
            }),
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStep::AddColumn { table, column } => write!(
                f,
                "AddColumn({}.{} {})",
                table,
                column.name,
                column.shape().describe()
            ),
            MigrationStep::DropColumn { table, column } => {
                write!(f, "DropColumn({}.{})", table, column.name)
            }
            MigrationStep::AddIndex { table, index } => write!(
                f,
                "AddIndex({}{} ON {}({}))",
                if index.unique { "UNIQUE " } else { "" },
                index.name,
                table,
                index.columns.join(", ")
            ),
            MigrationStep::DropIndex { table, index } => {
                write!(f, "DropIndex({} ON {})", index.name, table)
            }
            MigrationStep::AddForeignKey { table, foreign_key } => write!(
                f,
                "AddForeignKey({} {}.{} -> {}.{} ON DELETE {})",
                foreign_key.name,
                table,
                foreign_key.column,
                foreign_key.referenced_table,
                foreign_key.referenced_column,
                foreign_key.on_delete
            ),
            MigrationStep::DropForeignKey { table, foreign_key } => {
                write!(f, "DropForeignKey({} ON {})", foreign_key.name, table)
            }
            MigrationStep::ConvertCollation { table, from, to } => match from {
                Some(from) => write!(f, "ConvertCollation({} {} -> {})", table, from, to),
                None => write!(f, "ConvertCollation({} -> {})", table, to),
            },
            MigrationStep::BackfillColumn(spec) => write!(f, "BackfillColumn({})", spec),
            MigrationStep::ModifyColumnConstraint {
                table,
                column,
                from,
                to,
            } => write!(
                f,
                "ModifyColumnConstraint({}.{} {} -> {})",
                table,
                column,
                from.describe(),
                to.describe()
            ),
        }
    }
}

/// Ordered list of steps computed for one migration direction
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationPlan {
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new(steps: Vec<MigrationStep>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: MigrationStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MigrationStep> {
        self.steps.iter()
    }

    /// Inverses of every reversible step, last step first
    pub fn inverse(&self) -> MigrationPlan {
        MigrationPlan::new(self.steps.iter().rev().filter_map(MigrationStep::inverse).collect())
    }

    /// `snapshot` as it would look after this plan ran
    pub fn simulate(&self, snapshot: &SchemaSnapshot) -> Result<SchemaSnapshot> {
        snapshot.simulate(self)
    }

    pub fn describe(&self) -> Vec<String> {
        self.steps.iter().map(ToString::to_string).collect()
    }

    /// Checks that the plan can run against `snapshot` in its current order.
    ///
    /// Every step must find its prerequisites when simulated in sequence, and
    /// no backfill or type change on a column may come after a constraint
    /// that depends on the column's final values.
    pub fn validate(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            let constrains = match step {
                MigrationStep::AddForeignKey { .. } => true,
                _ => step.tightens(),
            };
            if !constrains {
                continue;
            }
            let (table, column) = (step.table(), step.column());
            let late = self.steps[i + 1..].iter().position(|later| {
                later.table() == table
                    && later.column() == column
                    && match later {
                        MigrationStep::BackfillColumn(_) => true,
                        MigrationStep::ModifyColumnConstraint { .. } => {
                            matches!(step, MigrationStep::AddForeignKey { .. })
                        }
                        _ => false,
                    }
            });
            if let Some(offset) = late {
                return Err(MigrationError::InvalidPlan(format!(
                    "step {} ({}) must run before step {} ({})",
                    i + 1 + offset,
                    self.steps[i + 1 + offset],
                    i,
                    step
                )));
            }
        }
        snapshot.simulate(self).map(|_| ())
    }
}

impl<'a> IntoIterator for &'a MigrationPlan {
    type Item = &'a MigrationStep;
    type IntoIter = std::slice::Iter<'a, MigrationStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl From<Vec<MigrationStep>> for MigrationPlan {
    fn from(steps: Vec<MigrationStep>) -> Self {
        Self::new(steps)
    }
}
