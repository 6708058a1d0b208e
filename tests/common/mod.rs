#![allow(dead_code)]

use pos_migrate::backfill::BackfillSource;
use pos_migrate::migration::Migration;
use pos_migrate::schema::{IndexDescriptor, TargetColumn, TargetSchema, TargetTable};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};

/// Single-connection in-memory SQLite; a second connection would see an empty database.
pub async fn memory_db() -> DatabaseConnection {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    Database::connect(opt)
        .await
        .expect("failed to open in-memory sqlite")
}

pub async fn exec(db: &DatabaseConnection, sql: &str) {
    db.execute_unprepared(sql)
        .await
        .unwrap_or_else(|e| panic!("fixture statement failed: {sql}: {e}"));
}

/// tenants, companies with a tenant each, and 100 orders of which 3 point
/// at a company that does not exist.
pub async fn seed_pos_schema(db: &DatabaseConnection) {
    exec(db, r#"CREATE TABLE "tenants" ("id" char(36) PRIMARY KEY NOT NULL, "legacyCompanyId" integer)"#).await;
    exec(
        db,
        r#"CREATE TABLE "companies" ("id" integer PRIMARY KEY NOT NULL, "name" varchar(255) NOT NULL, "tenantId" char(36))"#,
    )
    .await;
    exec(
        db,
        r#"CREATE TABLE "orders" ("id" integer PRIMARY KEY NOT NULL, "companyId" integer NOT NULL, "total" decimal(10,2) NOT NULL DEFAULT 0)"#,
    )
    .await;

    for n in 1..=4 {
        let tenant = format!("00000000-0000-0000-0000-00000000000{}", n);
        exec(
            db,
            &format!(r#"INSERT INTO "tenants" ("id", "legacyCompanyId") VALUES ('{tenant}', {n})"#),
        )
        .await;
        exec(
            db,
            &format!(
                r#"INSERT INTO "companies" ("id", "name", "tenantId") VALUES ({n}, 'Company {n}', '{tenant}')"#
            ),
        )
        .await;
    }

    exec(
        db,
        r#"WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 97)
           INSERT INTO "orders" ("id", "companyId") SELECT n, (n % 4) + 1 FROM seq"#,
    )
    .await;
    exec(
        db,
        r#"INSERT INTO "orders" ("id", "companyId") VALUES (98, 99), (99, 99), (100, 99)"#,
    )
    .await;
}

pub fn tenant_from_company() -> BackfillSource {
    BackfillSource::new("companies", "tenantId", "companyId", "id")
}

/// orders.tenantId, backfilled from the owning company
pub fn orders_tenant_target(not_null: bool) -> TargetSchema {
    let mut column = TargetColumn::new("tenantId", "char(36)").backfill(tenant_from_company());
    if not_null {
        column = column.not_null();
    }
    TargetSchema::new().table(TargetTable::new("orders").column(column))
}

/// A nullable, indexed column; everything SQLite can both add and drop
pub struct AddOrderChannel;

impl Migration for AddOrderChannel {
    fn name(&self) -> &str {
        "m20240701_000001_add_order_channel"
    }

    fn target(&self) -> TargetSchema {
        TargetSchema::new().table(
            TargetTable::new("orders")
                .column(TargetColumn::new("channel", "varchar(32)"))
                .index(IndexDescriptor::new("IDX_orders_channel", ["channel"])),
        )
    }
}
