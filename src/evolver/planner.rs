//! Diffing a [`TargetSchema`] against a [`SchemaSnapshot`].
//!
//! Steps are emitted in dependency phases so a plan can always run top to
//! bottom: collation changes, new columns, backfills, constraint changes on
//! existing columns, indexes, and foreign keys last.

use tracing::debug;

use super::step::{MigrationPlan, MigrationStep};
use crate::backfill::BackfillSpec;
use crate::errors::{MigrationError, Result};
use crate::schema::{SchemaSnapshot, TargetSchema, TargetTable};

#[derive(Default)]
struct Phases {
    collations: Vec<MigrationStep>,
    columns: Vec<MigrationStep>,
    backfills: Vec<MigrationStep>,
    constraints: Vec<MigrationStep>,
    indexes: Vec<MigrationStep>,
    foreign_keys: Vec<MigrationStep>,
}

impl Phases {
    fn into_plan(self) -> MigrationPlan {
        let steps = self
            .collations
            .into_iter()
            .chain(self.columns)
            .chain(self.backfills)
            .chain(self.constraints)
            .chain(self.indexes)
            .chain(self.foreign_keys)
            .collect();
        MigrationPlan::new(steps)
    }
}

/// Steps that take `snapshot` to `target`. Empty when nothing differs.
///
/// Pure: the same inputs always give the same plan.
pub fn plan(target: &TargetSchema, snapshot: &SchemaSnapshot) -> Result<MigrationPlan> {
    check_references(target, snapshot)?;

    let mut phases = Phases::default();
    for table in &target.tables {
        plan_table(table, snapshot, &mut phases)?;
    }

    let plan = phases.into_plan();
    debug!(steps = plan.len(), "Computed migration plan");
    Ok(plan)
}

fn plan_table(table: &TargetTable, snapshot: &SchemaSnapshot, phases: &mut Phases) -> Result<()> {
    let current = snapshot
        .table(&table.name)
        .ok_or_else(|| MigrationError::InvalidPlan(format!("table {} does not exist", table.name)))?;

    // Collation is only reported by engines that have table collations.
    if let (Some(want), Some(have)) = (&table.collation, &current.collation) {
        if !want.matches(have) {
            phases.collations.push(MigrationStep::ConvertCollation {
                table: table.name.clone(),
                from: Some(have.clone()),
                to: want.clone(),
            });
        }
    }

    for column in &table.columns {
        let desired = &column.descriptor;
        let backfill = column.backfill.as_ref().map(|source| {
            MigrationStep::BackfillColumn(BackfillSpec::new(
                table.name.clone(),
                desired.name.clone(),
                source.clone().for_column_type(&desired.data_type),
            ))
        });

        match current.column(&desired.name) {
            None => {
                let staged = column.staged();
                phases.columns.push(MigrationStep::AddColumn {
                    table: table.name.clone(),
                    column: staged.clone(),
                });
                phases.backfills.extend(backfill);
                if staged != *desired {
                    phases.constraints.push(MigrationStep::ModifyColumnConstraint {
                        table: table.name.clone(),
                        column: desired.name.clone(),
                        from: staged.shape(),
                        to: desired.shape(),
                    });
                }
            }
            Some(existing) => {
                let have = existing.shape();
                let want = desired.shape();
                if !have.matches(&want) {
                    if have.nullable && !want.nullable {
                        phases.backfills.extend(backfill);
                    }
                    phases.constraints.push(MigrationStep::ModifyColumnConstraint {
                        table: table.name.clone(),
                        column: desired.name.clone(),
                        from: have,
                        to: want,
                    });
                }
            }
        }
    }

    for index in &table.indexes {
        if current.find_index(index).is_none() {
            phases.indexes.push(MigrationStep::AddIndex {
                table: table.name.clone(),
                index: index.clone(),
            });
        }
    }

    for fk in &table.foreign_keys {
        if current.find_foreign_key(fk).is_none() {
            phases.foreign_keys.push(MigrationStep::AddForeignKey {
                table: table.name.clone(),
                foreign_key: fk.clone(),
            });
        }
    }

    Ok(())
}

/// Steps that undo `target` on a schema where it is fully or partly applied.
///
/// The forward plan is computed from the pre-migration baseline, inverted,
/// and then trimmed to what `snapshot` still has, so a half-applied migration
/// rolls back only what actually landed.
pub fn rollback(target: &TargetSchema, snapshot: &SchemaSnapshot) -> Result<MigrationPlan> {
    let baseline = target.baseline(snapshot);
    let forward = plan(target, &baseline)?;

    let mut simulated = snapshot.clone();
    let mut steps = Vec::new();
    for step in forward.inverse().iter() {
        let step = live_named(step, &simulated);
        // Constraint changes on a column that never landed have nothing to undo.
        let moot = matches!(&step, MigrationStep::ModifyColumnConstraint { table, column, .. }
            if !simulated.table(table).map(|t| t.has_column(column)).unwrap_or(false));
        if moot || simulated.is_satisfied(&step) {
            continue;
        }
        simulated.apply_step(&step)?;
        steps.push(step);
    }

    let plan = MigrationPlan::new(steps);
    debug!(steps = plan.len(), "Computed rollback plan");
    Ok(plan)
}

/// Drops aimed at the object the store actually holds, which may carry an
/// engine-generated name such as `orders_ibfk_1`.
fn live_named(step: &MigrationStep, snapshot: &SchemaSnapshot) -> MigrationStep {
    match step {
        MigrationStep::DropIndex { table, index } => MigrationStep::DropIndex {
            table: table.clone(),
            index: snapshot
                .table(table)
                .and_then(|t| t.find_index(index))
                .unwrap_or(index)
                .clone(),
        },
        MigrationStep::DropForeignKey { table, foreign_key } => MigrationStep::DropForeignKey {
            table: table.clone(),
            foreign_key: snapshot
                .table(table)
                .and_then(|t| t.find_foreign_key(foreign_key))
                .unwrap_or(foreign_key)
                .clone(),
        },
        other => other.clone(),
    }
}

/// Every table, column and key the target refers to must exist in the
/// snapshot or be created by the target itself.
fn check_references(target: &TargetSchema, snapshot: &SchemaSnapshot) -> Result<()> {
    let column_known = |table: &str, column: &str| {
        snapshot
            .table(table)
            .map(|t| t.has_column(column))
            .unwrap_or(false)
            || target
                .tables
                .iter()
                .any(|t| t.name == table && t.find_column(column).is_some())
    };
    let missing = |what: String| Err(MigrationError::InvalidPlan(format!("{} does not exist", what)));

    for table in &target.tables {
        if snapshot.table(&table.name).is_none() {
            return missing(format!("table {}", table.name));
        }
        for column in &table.columns {
            if let Some(source) = &column.backfill {
                if snapshot.table(&source.parent_table).is_none() {
                    return missing(format!("backfill parent table {}", source.parent_table));
                }
                for (owner, name) in [
                    (table.name.as_str(), source.child_key.as_str()),
                    (source.parent_table.as_str(), source.parent_key.as_str()),
                    (source.parent_table.as_str(), source.source_column.as_str()),
                ] {
                    if !column_known(owner, name) {
                        return missing(format!("backfill column {}.{}", owner, name));
                    }
                }
            }
        }
        for index in &table.indexes {
            for column in &index.columns {
                if !column_known(&table.name, column) {
                    return missing(format!("column {}.{} for index {}", table.name, column, index.name));
                }
            }
        }
        for fk in &table.foreign_keys {
            if !column_known(&table.name, &fk.column) {
                return missing(format!("column {}.{} for {}", table.name, fk.column, fk.name));
            }
            if !column_known(&fk.referenced_table, &fk.referenced_column) {
                return missing(format!(
                    "referenced column {}.{} for {}",
                    fk.referenced_table, fk.referenced_column, fk.name
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::{BackfillSource, UnsetSentinel};
    use crate::schema::{
        Collation, ColumnDescriptor, ColumnShape, ForeignKeyDescriptor, IndexDescriptor,
        ReferentialAction, TableSnapshot, TargetColumn,
    };

    fn base_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new("pos")
            .with_table(
                TableSnapshot::new("tenants")
                    .with_column(ColumnDescriptor::new("id", "char(36)").primary_key())
                    .with_collation(Collation::new("utf8", "utf8_general_ci")),
            )
            .with_table(
                TableSnapshot::new("companies")
                    .with_column(ColumnDescriptor::new("id", "int").primary_key())
                    .with_column(ColumnDescriptor::new("tenantId", "char(36)").not_null()),
            )
            .with_table(
                TableSnapshot::new("orders")
                    .with_column(ColumnDescriptor::new("id", "int").primary_key())
                    .with_column(ColumnDescriptor::new("companyId", "int").not_null()),
            )
    }

    fn orders_target() -> TargetSchema {
        TargetSchema::new().table(
            TargetTable::new("orders")
                .column(
                    TargetColumn::new("tenantId", "char(36)")
                        .not_null()
                        .backfill(BackfillSource::new("companies", "tenantId", "companyId", "id")),
                )
                .index(IndexDescriptor::new("IDX_orders_tenantId", ["tenantId"]))
                .foreign_key(
                    ForeignKeyDescriptor::new("FK_orders_tenantId", "tenantId", "tenants", "id")
                        .on_delete(ReferentialAction::Restrict),
                ),
        )
    }

    fn kinds(plan: &MigrationPlan) -> Vec<&'static str> {
        plan.iter().map(MigrationStep::kind).collect()
    }

    #[test]
    fn new_tenant_column_is_planned_in_dependency_order() {
        let plan = plan(&orders_target(), &base_snapshot()).unwrap();
        assert_eq!(
            kinds(&plan),
            vec![
                "add_column",
                "backfill_column",
                "modify_column_constraint",
                "add_index",
                "add_foreign_key"
            ]
        );
        match &plan.steps()[0] {
            MigrationStep::AddColumn { column, .. } => {
                assert!(column.nullable);
                assert_eq!(column.default_value, None);
            }
            other => panic!("unexpected first step {other}"),
        }
        assert!(plan.steps()[2].tightens());
        plan.validate(&base_snapshot()).unwrap();
    }

    #[test]
    fn numeric_backfill_treats_only_null_as_unset() {
        let target = TargetSchema::new().table(
            TargetTable::new("orders").column(
                TargetColumn::new("legacyCompanyId", "int")
                    .backfill(BackfillSource::new("companies", "id", "companyId", "id")),
            ),
        );
        let plan = plan(&target, &base_snapshot()).unwrap();
        match &plan.steps()[1] {
            MigrationStep::BackfillColumn(spec) => {
                assert_eq!(spec.source.sentinel, UnsetSentinel::Null);
            }
            other => panic!("unexpected step {other}"),
        }

        let text = plan_of_tenant_backfill();
        assert_eq!(text.source.sentinel, UnsetSentinel::NullOrEmpty);
    }

    fn plan_of_tenant_backfill() -> BackfillSpec {
        let plan = plan(&orders_target(), &base_snapshot()).unwrap();
        match plan.steps()[1].clone() {
            MigrationStep::BackfillColumn(spec) => spec,
            other => panic!("unexpected step {other}"),
        }
    }

    #[test]
    fn applied_target_plans_nothing() {
        let snapshot = base_snapshot();
        let first = plan(&orders_target(), &snapshot).unwrap();
        let applied = snapshot.simulate(&first).unwrap();
        assert!(plan(&orders_target(), &applied).unwrap().is_empty());
    }

    #[test]
    fn auto_named_foreign_key_counts_as_present() {
        let snapshot = base_snapshot();
        let applied = snapshot.simulate(&plan(&orders_target(), &snapshot).unwrap()).unwrap();
        let mut renamed = applied.clone();
        let orders = renamed.tables.get_mut("orders").unwrap();
        let mut fk = orders.foreign_keys.remove("FK_orders_tenantId").unwrap();
        fk.name = "orders_ibfk_1".into();
        orders.foreign_keys.insert(fk.name.clone(), fk);
        assert!(plan(&orders_target(), &renamed).unwrap().is_empty());
    }

    #[test]
    fn half_applied_target_resumes() {
        let snapshot = base_snapshot();
        let full = plan(&orders_target(), &snapshot).unwrap();
        let partial = MigrationPlan::new(full.steps()[..2].to_vec());
        let halfway = snapshot.simulate(&partial).unwrap();

        let resumed = plan(&orders_target(), &halfway).unwrap();
        // The column exists but is still nullable: backfill again, then tighten.
        assert_eq!(
            kinds(&resumed),
            vec![
                "backfill_column",
                "modify_column_constraint",
                "add_index",
                "add_foreign_key"
            ]
        );
    }

    #[test]
    fn collation_is_converted_first() {
        let target = TargetSchema::new().table(
            TargetTable::new("tenants")
                .collation(Collation::new("utf8mb4", "utf8mb4_unicode_ci"))
                .previous_collation(Collation::new("utf8", "utf8_general_ci")),
        );
        let plan = plan(&target, &base_snapshot()).unwrap();
        assert_eq!(kinds(&plan), vec!["convert_collation"]);

        // Engines without table collations report none and are left alone.
        let mut no_collation = base_snapshot();
        no_collation.tables.get_mut("tenants").unwrap().collation = None;
        assert!(super::plan(&target, &no_collation).unwrap().is_empty());
    }

    #[test]
    fn utf8mb3_report_counts_as_rolled_back() {
        let target = TargetSchema::new().table(
            TargetTable::new("tenants")
                .collation(Collation::new("utf8mb4", "utf8mb4_unicode_ci"))
                .previous_collation(Collation::new("utf8", "utf8_general_ci")),
        );
        let mut reported = base_snapshot();
        reported.tables.get_mut("tenants").unwrap().collation =
            Some(Collation::new("utf8mb3", "utf8mb3_general_ci"));

        assert!(rollback(&target, &reported).unwrap().is_empty());
        assert_eq!(kinds(&plan(&target, &reported).unwrap()), vec!["convert_collation"]);

        let applied = reported.simulate(&plan(&target, &reported).unwrap()).unwrap();
        let down = rollback(&target, &applied).unwrap();
        assert_eq!(kinds(&down), vec!["convert_collation"]);
        assert!(rollback(&target, &applied.simulate(&down).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn rollback_undoes_in_reverse_order() {
        let snapshot = base_snapshot();
        let forward = plan(&orders_target(), &snapshot).unwrap();
        let applied = snapshot.simulate(&forward).unwrap();

        let down = rollback(&orders_target(), &applied).unwrap();
        assert_eq!(
            kinds(&down),
            vec![
                "drop_foreign_key",
                "drop_index",
                "modify_column_constraint",
                "drop_column"
            ]
        );
        assert_eq!(applied.simulate(&down).unwrap(), snapshot);
    }

    #[test]
    fn rollback_drops_engine_named_keys_by_their_live_name() {
        let snapshot = base_snapshot();
        let applied = snapshot.simulate(&plan(&orders_target(), &snapshot).unwrap()).unwrap();
        let mut renamed = applied.clone();
        let orders = renamed.tables.get_mut("orders").unwrap();
        let mut fk = orders.foreign_keys.remove("FK_orders_tenantId").unwrap();
        fk.name = "orders_ibfk_1".into();
        orders.foreign_keys.insert(fk.name.clone(), fk);
        let mut index = orders.indexes.remove("IDX_orders_tenantId").unwrap();
        index.name = "orders_tenantId_idx".into();
        orders.indexes.insert(index.name.clone(), index);

        let down = rollback(&orders_target(), &renamed).unwrap();
        assert_eq!(
            kinds(&down),
            vec![
                "drop_foreign_key",
                "drop_index",
                "modify_column_constraint",
                "drop_column"
            ]
        );
        match (&down.steps()[0], &down.steps()[1]) {
            (
                MigrationStep::DropForeignKey { foreign_key, .. },
                MigrationStep::DropIndex { index, .. },
            ) => {
                assert_eq!(foreign_key.name, "orders_ibfk_1");
                assert_eq!(index.name, "orders_tenantId_idx");
            }
            other => panic!("unexpected drops {other:?}"),
        }
        assert_eq!(renamed.simulate(&down).unwrap(), snapshot);
    }

    #[test]
    fn rollback_of_partial_apply_only_touches_what_landed() {
        let snapshot = base_snapshot();
        let full = plan(&orders_target(), &snapshot).unwrap();
        let partial = MigrationPlan::new(full.steps()[..2].to_vec());
        let halfway = snapshot.simulate(&partial).unwrap();

        let down = rollback(&orders_target(), &halfway).unwrap();
        assert_eq!(kinds(&down), vec!["drop_column"]);
        assert!(rollback(&orders_target(), &snapshot).unwrap().is_empty());
    }

    #[test]
    fn rollback_restores_previous_column_shape() {
        let mut snapshot = base_snapshot();
        snapshot
            .tables
            .get_mut("companies")
            .unwrap()
            .columns
            .retain(|c| c.name != "tenantId");
        snapshot
            .tables
            .get_mut("companies")
            .unwrap()
            .columns
            .push(ColumnDescriptor::new("tenantId", "char(36)"));

        let target = TargetSchema::new().table(
            TargetTable::new("companies").column(
                TargetColumn::new("tenantId", "char(36)")
                    .not_null()
                    .previously(ColumnShape::new("char(36)", true)),
            ),
        );
        let forward = plan(&target, &snapshot).unwrap();
        assert_eq!(kinds(&forward), vec!["modify_column_constraint"]);
        let applied = snapshot.simulate(&forward).unwrap();
        let down = rollback(&target, &applied).unwrap();
        assert_eq!(applied.simulate(&down).unwrap(), snapshot);
    }

    #[test]
    fn unknown_references_are_rejected() {
        let target = TargetSchema::new().table(TargetTable::new("orders").foreign_key(
            ForeignKeyDescriptor::new("FK_orders_registerId", "registerId", "cash_registers", "id"),
        ));
        let err = plan(&target, &base_snapshot()).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPlan(_)));
    }
}
