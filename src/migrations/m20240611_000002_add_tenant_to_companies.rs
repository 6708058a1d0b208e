use super::{tenant_foreign_key, tenant_index, TENANT_ID, TENANT_ID_TYPE};
use crate::backfill::BackfillSource;
use crate::schema::{ReferentialAction, TargetColumn, TargetSchema, TargetTable};

pub struct Migration;

impl crate::migration::Migration for Migration {
    fn name(&self) -> &str {
        "m20240611_000002_add_tenant_to_companies"
    }

    fn target(&self) -> TargetSchema {
        // Every tenant was created from exactly one pre-tenancy company.
        let from_tenant = BackfillSource::new("tenants", "id", "id", "legacyCompanyId");

        TargetSchema::new().table(
            TargetTable::new("companies")
                .column(
                    TargetColumn::new(TENANT_ID, TENANT_ID_TYPE)
                        .not_null()
                        .backfill(from_tenant),
                )
                .index(tenant_index("companies"))
                .foreign_key(tenant_foreign_key("companies", ReferentialAction::Restrict)),
        )
    }
}
