use pos_migrate::backfill::BackfillSource;
use pos_migrate::evolver::{plan, rollback, MigrationPlan};
use pos_migrate::schema::{
    ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, SchemaSnapshot, TableSnapshot,
    TargetColumn, TargetSchema, TargetTable,
};
use proptest::prelude::*;
use proptest::sample::subsequence;

const CANDIDATES: [&str; 4] = ["tenantId", "note", "code", "status"];

#[derive(Clone, Debug)]
struct ColumnCase {
    name: String,
    data_type: String,
    not_null: bool,
    default_value: Option<String>,
    backfilled: bool,
    indexed: bool,
    referenced: bool,
    /// Shape already in the store before planning: (type, nullable)
    existing: Option<(String, bool)>,
}

fn data_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("char(36)".to_string()),
        Just("varchar(64)".to_string()),
        Just("int".to_string()),
        Just("bigint".to_string()),
    ]
}

fn column_case(name: &'static str) -> impl Strategy<Value = ColumnCase> {
    (
        data_type(),
        any::<bool>(),
        prop::option::of(Just("''".to_string())),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            move |(data_type, not_null, default_value, backfilled, indexed, referenced)| ColumnCase {
                name: name.to_string(),
                data_type,
                not_null,
                default_value,
                backfilled,
                indexed,
                referenced,
                existing: None,
            },
        )
}

fn fresh_cases() -> impl Strategy<Value = Vec<ColumnCase>> {
    subsequence(CANDIDATES.to_vec(), 1..=CANDIDATES.len()).prop_flat_map(|names| {
        names.into_iter().map(column_case).collect::<Vec<_>>()
    })
}

fn cases_with_existing() -> impl Strategy<Value = Vec<ColumnCase>> {
    fresh_cases().prop_flat_map(|cases| {
        let existing = prop::collection::vec(prop::option::of((data_type(), any::<bool>())), cases.len());
        (Just(cases), existing).prop_map(|(mut cases, existing)| {
            for (case, shape) in cases.iter_mut().zip(existing) {
                case.existing = shape;
            }
            cases
        })
    })
}

fn base_snapshot(cases: &[ColumnCase]) -> SchemaSnapshot {
    let mut orders = TableSnapshot::new("orders")
        .with_column(ColumnDescriptor::new("id", "int").primary_key())
        .with_column(ColumnDescriptor::new("companyId", "int").not_null());
    for case in cases {
        if let Some((data_type, nullable)) = &case.existing {
            let column = ColumnDescriptor::new(case.name.as_str(), data_type.as_str());
            orders = orders.with_column(if *nullable { column } else { column.not_null() });
        }
    }

    SchemaSnapshot::new("pos")
        .with_table(
            TableSnapshot::new("tenants")
                .with_column(ColumnDescriptor::new("id", "char(36)").primary_key()),
        )
        .with_table(
            TableSnapshot::new("companies")
                .with_column(ColumnDescriptor::new("id", "int").primary_key())
                .with_column(ColumnDescriptor::new("tenantId", "char(36)")),
        )
        .with_table(orders)
}

fn target(cases: &[ColumnCase]) -> TargetSchema {
    let mut orders = TargetTable::new("orders");
    for case in cases {
        let mut column = TargetColumn::new(case.name.as_str(), case.data_type.as_str());
        if case.not_null {
            column = column.not_null();
        }
        if let Some(default) = &case.default_value {
            column = column.default_value(default.as_str());
        }
        if case.backfilled {
            column = column.backfill(BackfillSource::new("companies", "tenantId", "companyId", "id"));
        }
        orders = orders.column(column);

        if case.indexed {
            orders = orders.index(IndexDescriptor::new(
                format!("IDX_orders_{}", case.name),
                [case.name.as_str()],
            ));
        }
        if case.referenced {
            orders = orders.foreign_key(ForeignKeyDescriptor::new(
                format!("FK_orders_{}", case.name),
                case.name.as_str(),
                "tenants",
                "id",
            ));
        }
    }
    TargetSchema::new().table(orders)
}

fn prefix(plan: &MigrationPlan, len: usize) -> MigrationPlan {
    MigrationPlan::new(plan.steps()[..len.min(plan.len())].to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn planned_steps_are_valid_against_the_snapshot(cases in cases_with_existing()) {
        let snapshot = base_snapshot(&cases);
        let steps = plan(&target(&cases), &snapshot).unwrap();
        prop_assert!(steps.validate(&snapshot).is_ok());
    }

    #[test]
    fn applying_a_plan_leaves_nothing_to_do(cases in cases_with_existing()) {
        let target = target(&cases);
        let snapshot = base_snapshot(&cases);
        let applied = snapshot.simulate(&plan(&target, &snapshot).unwrap()).unwrap();
        prop_assert!(plan(&target, &applied).unwrap().is_empty());
    }

    #[test]
    fn planning_is_deterministic(cases in cases_with_existing()) {
        let target = target(&cases);
        let snapshot = base_snapshot(&cases);
        prop_assert_eq!(plan(&target, &snapshot).unwrap(), plan(&target, &snapshot).unwrap());
    }

    #[test]
    fn interrupted_apply_resumes_to_completion(cases in cases_with_existing(), cut in 0usize..16) {
        let target = target(&cases);
        let snapshot = base_snapshot(&cases);
        let full = plan(&target, &snapshot).unwrap();
        let halfway = snapshot.simulate(&prefix(&full, cut)).unwrap();

        let resumed = plan(&target, &halfway).unwrap();
        prop_assert!(resumed.len() <= full.len());
        let finished = halfway.simulate(&resumed).unwrap();
        prop_assert!(plan(&target, &finished).unwrap().is_empty());
    }

    #[test]
    fn rollback_returns_to_the_original_schema(cases in fresh_cases(), cut in 0usize..16) {
        let target = target(&cases);
        let snapshot = base_snapshot(&cases);
        let full = plan(&target, &snapshot).unwrap();
        let landed = prefix(&full, cut).simulate(&snapshot).unwrap();

        let down = rollback(&target, &landed).unwrap();
        prop_assert_eq!(landed.simulate(&down).unwrap(), snapshot.clone());
        prop_assert!(rollback(&target, &snapshot).unwrap().is_empty());
    }
}
