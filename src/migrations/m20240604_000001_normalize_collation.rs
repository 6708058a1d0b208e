use crate::schema::{Collation, TargetSchema, TargetTable};

pub struct Migration;

/// Tables created before the switch to utf8mb4
const TABLES: &[&str] = &[
    "tenants",
    "companies",
    "users",
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

impl crate::migration::Migration for Migration {
    fn name(&self) -> &str {
        "m20240604_000001_normalize_collation"
    }

    // Engines without table collations report none, which plans nothing.
    fn target(&self) -> TargetSchema {
        TABLES.iter().fold(TargetSchema::new(), |target, table| {
            target.table(
                TargetTable::new(*table)
                    .collation(Collation::new("utf8mb4", "utf8mb4_unicode_ci"))
                    .previous_collation(Collation::new("utf8", "utf8_general_ci")),
            )
        })
    }
}
