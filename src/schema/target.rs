use serde::{Deserialize, Serialize};

use super::snapshot::SchemaSnapshot;
use super::types::{Collation, ColumnDescriptor, ColumnShape, ForeignKeyDescriptor, IndexDescriptor};
use crate::backfill::BackfillSource;

/// The shape a migration wants a set of tables to have.
///
/// Only the parts a migration cares about are listed; anything else on the
/// live tables is left alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSchema {
    pub tables: Vec<TargetTable>,
}

impl TargetSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TargetTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Every table the target touches or reads from, in first-mention order
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        };
        for table in &self.tables {
            push(&table.name);
            for column in &table.columns {
                if let Some(source) = &column.backfill {
                    push(&source.parent_table);
                }
            }
            for fk in &table.foreign_keys {
                push(&fk.referenced_table);
            }
        }
        names
    }

    /// The schema as it looked before this target was ever applied.
    ///
    /// Declared foreign keys, indexes and new columns are removed; columns and
    /// collations with a recorded previous shape get it back.
    pub fn baseline(&self, snapshot: &SchemaSnapshot) -> SchemaSnapshot {
        let mut baseline = snapshot.clone();
        for target in &self.tables {
            let Some(table) = baseline.tables.get_mut(&target.name) else {
                continue;
            };
            for fk in &target.foreign_keys {
                table.foreign_keys.retain(|_, existing| !existing.is_equivalent(fk));
            }
            for index in &target.indexes {
                table.indexes.retain(|_, existing| !existing.is_equivalent(index));
            }
            for column in &target.columns {
                let name = &column.descriptor.name;
                match &column.previous {
                    Some(previous) => {
                        if let Some(existing) = table.columns.iter_mut().find(|c| &c.name == name) {
                            *existing = existing.with_shape(previous);
                        }
                    }
                    None => table.columns.retain(|c| &c.name != name),
                }
            }
            if let (Some(previous), Some(_)) = (&target.previous_collation, &table.collation) {
                table.collation = Some(previous.clone());
            }
        }
        baseline
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<TargetColumn>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    /// Desired table collation (MySQL only)
    #[serde(default)]
    pub collation: Option<Collation>,
    /// Collation to restore when rolling back
    #[serde(default)]
    pub previous_collation: Option<Collation>,
}

impl TargetTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            collation: None,
            previous_collation: None,
        }
    }

    pub fn column(mut self, column: TargetColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn previous_collation(mut self, collation: Collation) -> Self {
        self.previous_collation = Some(collation);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&TargetColumn> {
        self.columns.iter().find(|c| c.descriptor.name == name)
    }
}

/// A column the target wants, plus how to populate and how to undo it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    #[serde(flatten)]
    pub descriptor: ColumnDescriptor,
    #[serde(default)]
    pub backfill: Option<BackfillSource>,
    /// Shape before the migration. `None` means the migration created the column.
    #[serde(default)]
    pub previous: Option<ColumnShape>,
}

impl TargetColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            descriptor: ColumnDescriptor::new(name, data_type),
            backfill: None,
            previous: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.descriptor.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.descriptor.default_value = Some(value.into());
        self
    }

    pub fn backfill(mut self, source: BackfillSource) -> Self {
        self.backfill = Some(source);
        self
    }

    pub fn previously(mut self, shape: ColumnShape) -> Self {
        self.previous = Some(shape);
        self
    }

    /// What ADD COLUMN creates. A NOT NULL column that still has to be
    /// filled, or has no default to fill existing rows with, starts out
    /// nullable and is tightened later.
    pub fn staged(&self) -> ColumnDescriptor {
        let needs_staging = !self.descriptor.nullable
            && (self.backfill.is_some() || self.descriptor.default_value.is_none());
        if needs_staging {
            ColumnDescriptor {
                nullable: true,
                default_value: None,
                ..self.descriptor.clone()
            }
        } else {
            self.descriptor.clone()
        }
    }
}
