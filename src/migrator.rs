use sea_orm_migration::prelude::*;
use tracing::{error, info};

use crate::db::DbPool;
use crate::errors::MigrationError;
use crate::migration::{Migration, TrackedMigration};
use crate::migrations::{
    m20240604_000001_normalize_collation, m20240611_000002_add_tenant_to_companies,
    m20240611_000003_add_tenant_to_business_tables,
};

/// Every registered migration, in the order it must be applied
pub fn registered() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(m20240604_000001_normalize_collation::Migration),
        Box::new(m20240611_000002_add_tenant_to_companies::Migration),
        Box::new(m20240611_000003_add_tenant_to_business_tables::Migration),
    ]
}

/// Looks a migration up by its full name
pub fn find(name: &str) -> Result<Box<dyn Migration>, MigrationError> {
    registered()
        .into_iter()
        .find(|m| m.name() == name)
        .ok_or_else(|| MigrationError::UnknownMigration(name.to_string()))
}

/// The registered migrations behind sea-orm-migration's history table.
///
/// Host applications that already run `MigratorTrait` migrators can embed
/// this one; every migration runs with the default apply options.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        registered()
            .into_iter()
            .map(|m| Box::new(TrackedMigration::new(m)) as Box<dyn MigrationTrait>)
            .collect()
    }
}

/// Runs every pending migration and records it in `seaql_migrations`
pub async fn run_migrations(pool: &DbPool) -> Result<(), MigrationError> {
    info!("Running database migrations");
    let start = std::time::Instant::now();

    let result = Migrator::up(pool, None)
        .await
        .map_err(MigrationError::db_error);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!(
            "Database migrations completed successfully in {:?}",
            elapsed
        ),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}
