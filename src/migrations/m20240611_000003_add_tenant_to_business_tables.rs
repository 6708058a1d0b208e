use super::{tenant_foreign_key, tenant_index, TENANT_ID, TENANT_ID_TYPE};
use crate::backfill::BackfillSource;
use crate::schema::{ReferentialAction, TargetColumn, TargetSchema, TargetTable};

pub struct Migration;

/// Company-owned tables that become tenant-scoped
const TENANT_SCOPED: &[&str] = &[
    "locations",
    "areas",
    "tables",
    "products",
    "categories",
    "suppliers",
    "purchases",
    "recipes",
    "orders",
    "payments",
    "cash_registers",
    "customers",
];

fn from_company() -> BackfillSource {
    BackfillSource::new("companies", TENANT_ID, "companyId", "id")
}

fn tenant_scoped(table: &str) -> TargetTable {
    TargetTable::new(table)
        .column(
            TargetColumn::new(TENANT_ID, TENANT_ID_TYPE)
                .not_null()
                .backfill(from_company()),
        )
        .index(tenant_index(table))
        .foreign_key(tenant_foreign_key(table, ReferentialAction::Restrict))
}

impl crate::migration::Migration for Migration {
    fn name(&self) -> &str {
        "m20240611_000003_add_tenant_to_business_tables"
    }

    fn target(&self) -> TargetSchema {
        let target = TENANT_SCOPED
            .iter()
            .fold(TargetSchema::new(), |target, table| target.table(tenant_scoped(table)));

        // Platform users belong to no tenant, so the column stays nullable.
        target.table(
            TargetTable::new("users")
                .column(TargetColumn::new(TENANT_ID, TENANT_ID_TYPE).backfill(from_company()))
                .index(tenant_index("users"))
                .foreign_key(tenant_foreign_key("users", ReferentialAction::SetNull)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration as _;

    #[test]
    fn every_scoped_table_gets_matching_names() {
        let target = Migration.target();
        assert_eq!(target.tables.len(), TENANT_SCOPED.len() + 1);
        for table in &target.tables {
            assert_eq!(table.indexes[0].name, format!("IDX_{}_tenantId", table.name));
            assert_eq!(table.foreign_keys[0].name, format!("FK_{}_tenantId", table.name));
        }
        let users = target.tables.iter().find(|t| t.name == "users").unwrap();
        assert!(users.columns[0].descriptor.nullable);
    }
}
