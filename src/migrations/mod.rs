//! Registered POS schema migrations, oldest first.

pub mod m20240604_000001_normalize_collation;
pub mod m20240611_000002_add_tenant_to_companies;
pub mod m20240611_000003_add_tenant_to_business_tables;

use crate::schema::{ForeignKeyDescriptor, IndexDescriptor, ReferentialAction};

/// Tenant identifiers are UUID strings
pub(crate) const TENANT_ID_TYPE: &str = "char(36)";
pub(crate) const TENANT_ID: &str = "tenantId";

pub(crate) fn tenant_index(table: &str) -> IndexDescriptor {
    IndexDescriptor::new(format!("IDX_{}_{}", table, TENANT_ID), [TENANT_ID])
}

pub(crate) fn tenant_foreign_key(table: &str, on_delete: ReferentialAction) -> ForeignKeyDescriptor {
    ForeignKeyDescriptor::new(format!("FK_{}_{}", table, TENANT_ID), TENANT_ID, "tenants", "id")
        .on_delete(on_delete)
}
