use std::collections::BTreeMap;

use serde::Serialize;

use super::types::{Collation, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor};
use crate::errors::{MigrationError, Result};
use crate::evolver::{MigrationPlan, MigrationStep};

/// Structure of one table as read from the catalog
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescriptor>,
    pub indexes: BTreeMap<String, IndexDescriptor>,
    pub foreign_keys: BTreeMap<String, ForeignKeyDescriptor>,
    pub collation: Option<Collation>,
}

impl TableSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.insert(index.name.clone(), index);
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.insert(fk.name.clone(), fk);
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// An index equivalent to `wanted`, matched by name or by columns
    pub fn find_index(&self, wanted: &IndexDescriptor) -> Option<&IndexDescriptor> {
        self.indexes
            .get(&wanted.name)
            .or_else(|| self.indexes.values().find(|i| i.is_equivalent(wanted)))
    }

    /// A foreign key equivalent to `wanted`, matched by name or by reference
    pub fn find_foreign_key(&self, wanted: &ForeignKeyDescriptor) -> Option<&ForeignKeyDescriptor> {
        self.foreign_keys
            .get(&wanted.name)
            .or_else(|| self.foreign_keys.values().find(|fk| fk.is_equivalent(wanted)))
    }
}

/// Point-in-time structure of the tables a migration touches
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchemaSnapshot {
    pub schema: String,
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl SchemaSnapshot {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn with_table(mut self, table: TableSnapshot) -> Self {
        self.insert(table);
        self
    }

    pub fn insert(&mut self, table: TableSnapshot) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut TableSnapshot> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MigrationError::InvalidPlan(format!("table {} does not exist", name)))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<()> {
        let exists = self
            .table(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false);
        if exists {
            Ok(())
        } else {
            Err(MigrationError::InvalidPlan(format!(
                "column {}.{} does not exist",
                table, column
            )))
        }
    }

    /// True when the step's effect is already present. Backfills never are:
    /// whether rows still need data is a question for the store.
    pub fn is_satisfied(&self, step: &MigrationStep) -> bool {
        let table = self.table(step.table());
        match step {
            MigrationStep::AddColumn { column, .. } => {
                table.map(|t| t.has_column(&column.name)).unwrap_or(false)
            }
            MigrationStep::DropColumn { column, .. } => {
                table.map(|t| !t.has_column(&column.name)).unwrap_or(true)
            }
            MigrationStep::AddIndex { index, .. } => {
                table.and_then(|t| t.find_index(index)).is_some()
            }
            MigrationStep::DropIndex { index, .. } => table
                .map(|t| !t.indexes.contains_key(&index.name))
                .unwrap_or(true),
            MigrationStep::AddForeignKey { foreign_key, .. } => table
                .and_then(|t| t.find_foreign_key(foreign_key))
                .is_some(),
            MigrationStep::DropForeignKey { foreign_key, .. } => table
                .map(|t| !t.foreign_keys.contains_key(&foreign_key.name))
                .unwrap_or(true),
            MigrationStep::ConvertCollation { to, .. } => table
                .map(|t| t.collation.as_ref().map(|c| c.matches(to)).unwrap_or(true))
                .unwrap_or(false),
            MigrationStep::BackfillColumn(_) => false,
            MigrationStep::ModifyColumnConstraint { column, to, .. } => table
                .and_then(|t| t.column(column))
                .map(|c| c.shape().matches(to))
                .unwrap_or(false),
        }
    }

    /// Applies one step to this in-memory schema, failing the way the store
    /// would if the step's prerequisites are missing.
    pub fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        match step {
            MigrationStep::AddColumn { table, column } => {
                let t = self.table_mut(table)?;
                if t.has_column(&column.name) {
                    return Err(MigrationError::InvalidPlan(format!(
                        "column {}.{} already exists",
                        table, column.name
                    )));
                }
                t.columns.push(column.clone());
            }
            MigrationStep::DropColumn { table, column } => {
                self.require_column(table, &column.name)?;
                let referenced_by = self.tables.values().find_map(|other| {
                    other
                        .foreign_keys
                        .values()
                        .find(|fk| {
                            (other.name == *table && fk.column == column.name)
                                || (fk.referenced_table == *table
                                    && fk.referenced_column == column.name)
                        })
                        .map(|fk| fk.name.clone())
                });
                if let Some(fk) = referenced_by {
                    return Err(MigrationError::InvalidPlan(format!(
                        "column {}.{} is still used by foreign key {}",
                        table, column.name, fk
                    )));
                }
                let t = self.table_mut(table)?;
                if let Some(index) = t.indexes.values().find(|i| i.columns.contains(&column.name)) {
                    return Err(MigrationError::InvalidPlan(format!(
                        "column {}.{} is still indexed by {}",
                        table, column.name, index.name
                    )));
                }
                t.columns.retain(|c| c.name != column.name);
            }
            MigrationStep::AddIndex { table, index } => {
                for column in &index.columns {
                    self.require_column(table, column)?;
                }
                let t = self.table_mut(table)?;
                if t.indexes.contains_key(&index.name) {
                    return Err(MigrationError::InvalidPlan(format!(
                        "index {} already exists on {}",
                        index.name, table
                    )));
                }
                t.indexes.insert(index.name.clone(), index.clone());
            }
            MigrationStep::DropIndex { table, index } => {
                let t = self.table_mut(table)?;
                if t.indexes.remove(&index.name).is_none() {
                    return Err(MigrationError::InvalidPlan(format!(
                        "index {} does not exist on {}",
                        index.name, table
                    )));
                }
            }
            MigrationStep::AddForeignKey { table, foreign_key } => {
                self.require_column(table, &foreign_key.column)?;
                self.require_column(&foreign_key.referenced_table, &foreign_key.referenced_column)?;
                let t = self.table_mut(table)?;
                if t.foreign_keys.contains_key(&foreign_key.name) {
                    return Err(MigrationError::InvalidPlan(format!(
                        "foreign key {} already exists on {}",
                        foreign_key.name, table
                    )));
                }
                t.foreign_keys
                    .insert(foreign_key.name.clone(), foreign_key.clone());
            }
            MigrationStep::DropForeignKey { table, foreign_key } => {
                let t = self.table_mut(table)?;
                if t.foreign_keys.remove(&foreign_key.name).is_none() {
                    return Err(MigrationError::InvalidPlan(format!(
                        "foreign key {} does not exist on {}",
                        foreign_key.name, table
                    )));
                }
            }
            MigrationStep::ConvertCollation { table, to, .. } => {
                self.table_mut(table)?.collation = Some(to.clone());
            }
            MigrationStep::BackfillColumn(spec) => {
                self.require_column(&spec.table, &spec.column)?;
                self.require_column(&spec.table, &spec.source.child_key)?;
                self.require_column(&spec.source.parent_table, &spec.source.source_column)?;
                self.require_column(&spec.source.parent_table, &spec.source.parent_key)?;
            }
            MigrationStep::ModifyColumnConstraint {
                table, column, to, ..
            } => {
                self.require_column(table, column)?;
                let t = self.table_mut(table)?;
                if let Some(existing) = t.columns.iter_mut().find(|c| &c.name == column) {
                    *existing = existing.with_shape(to);
                }
            }
        }
        Ok(())
    }

    /// The schema that results from running `plan` against this one
    pub fn simulate(&self, plan: &MigrationPlan) -> Result<SchemaSnapshot> {
        let mut simulated = self.clone();
        for (index, step) in plan.iter().enumerate() {
            simulated.apply_step(step).map_err(|err| match err {
                MigrationError::InvalidPlan(reason) => {
                    MigrationError::InvalidPlan(format!("step {} ({}): {}", index, step, reason))
                }
                other => other,
            })?;
        }
        Ok(simulated)
    }
}
