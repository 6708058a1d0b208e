use std::time::Instant;

use metrics::{counter, histogram};
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::db::count_rows;
use crate::errors::{MigrationError, Result};
use crate::evolver::render::quote_ident;
use crate::schema::is_text_type;

const CHILD_ALIAS: &str = "child";
const PARENT_ALIAS: &str = "parent";

/// Which child values count as "not yet set"
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsetSentinel {
    /// Only SQL NULL
    Null,
    /// NULL or the empty string
    #[default]
    NullOrEmpty,
}

/// What to do with child rows left without a parent value after a backfill
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedPolicy {
    /// Log the count and continue; a later NOT NULL step will refuse them.
    #[default]
    Warn,
    /// Fail the backfill step with a data integrity error.
    Abort,
}

/// Where a new column's value comes from: a parent row reached through a join
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSource {
    pub parent_table: String,
    pub source_column: String,
    /// Column on the child table holding the parent key
    pub child_key: String,
    /// Key column on the parent table
    pub parent_key: String,
    #[serde(default)]
    pub sentinel: UnsetSentinel,
}

impl BackfillSource {
    /// Copies `parent_table.source_column` into rows where `child.child_key = parent.parent_key`
    pub fn new(
        parent_table: impl Into<String>,
        source_column: impl Into<String>,
        child_key: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        Self {
            parent_table: parent_table.into(),
            source_column: source_column.into(),
            child_key: child_key.into(),
            parent_key: parent_key.into(),
            sentinel: UnsetSentinel::default(),
        }
    }

    pub fn sentinel(mut self, sentinel: UnsetSentinel) -> Self {
        self.sentinel = sentinel;
        self
    }

    /// Keeps the empty-string sentinel only for character columns; any other
    /// type treats NULL alone as unset.
    pub fn for_column_type(mut self, data_type: &str) -> Self {
        if !is_text_type(data_type) {
            self.sentinel = UnsetSentinel::Null;
        }
        self
    }
}

/// A backfill bound to the child column it fills
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSpec {
    pub table: String,
    pub column: String,
    pub source: BackfillSource,
}

impl BackfillSpec {
    pub fn new(table: impl Into<String>, column: impl Into<String>, source: BackfillSource) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            source,
        }
    }

    /// The single set-based UPDATE that fills unset child values from the parent.
    ///
    /// Only rows whose value is still unset and whose parent value is set are
    /// touched, so the statement can be re-run safely.
    pub fn update_statement(&self, backend: DbBackend) -> Statement {
        let q = |ident: &str| quote_ident(backend, ident);
        let child_col = format!("{}.{}", q(CHILD_ALIAS), q(&self.column));
        let parent_src = format!("{}.{}", q(PARENT_ALIAS), q(&self.source.source_column));
        let join = format!(
            "{}.{} = {}.{}",
            q(CHILD_ALIAS),
            q(&self.source.child_key),
            q(PARENT_ALIAS),
            q(&self.source.parent_key)
        );

        let sql = match backend {
            DbBackend::MySql => format!(
                "UPDATE {} AS {} INNER JOIN {} AS {} ON {} SET {} = {} WHERE {} AND {}",
                q(&self.table),
                q(CHILD_ALIAS),
                q(&self.source.parent_table),
                q(PARENT_ALIAS),
                join,
                child_col,
                parent_src,
                self.unset_predicate(&child_col),
                self.set_predicate(&parent_src),
            ),
            // UPDATE .. FROM; the assigned column must not be qualified.
            DbBackend::Postgres | DbBackend::Sqlite => format!(
                "UPDATE {} AS {} SET {} = {} FROM {} AS {} WHERE {} AND {} AND {}",
                q(&self.table),
                q(CHILD_ALIAS),
                q(&self.column),
                parent_src,
                q(&self.source.parent_table),
                q(PARENT_ALIAS),
                join,
                self.unset_predicate(&child_col),
                self.set_predicate(&parent_src),
            ),
        };
        Statement::from_string(backend, sql)
    }

    /// Counts child rows whose value is still unset
    pub fn unresolved_statement(&self, backend: DbBackend) -> Statement {
        let column = quote_ident(backend, &self.column);
        Statement::from_string(
            backend,
            format!(
                "SELECT COUNT(*) AS count FROM {} WHERE {}",
                quote_ident(backend, &self.table),
                self.unset_predicate(&column)
            ),
        )
    }

    fn unset_predicate(&self, column: &str) -> String {
        match self.source.sentinel {
            UnsetSentinel::Null => format!("{} IS NULL", column),
            UnsetSentinel::NullOrEmpty => format!("({} IS NULL OR {} = '')", column, column),
        }
    }

    fn set_predicate(&self, column: &str) -> String {
        match self.source.sentinel {
            UnsetSentinel::Null => format!("{} IS NOT NULL", column),
            UnsetSentinel::NullOrEmpty => format!("{} IS NOT NULL AND {} <> ''", column, column),
        }
    }
}

impl std::fmt::Display for BackfillSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} <- {}.{} ON {}.{} = {}.{}",
            self.table,
            self.column,
            self.source.parent_table,
            self.source.source_column,
            self.table,
            self.source.child_key,
            self.source.parent_table,
            self.source.parent_key
        )
    }
}

/// Outcome of one backfill run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub rows_affected: u64,
    /// Child rows still unset afterwards (orphans or parents without a value)
    pub unresolved: u64,
}

/// Fills a newly added column from related parent rows
pub struct BackfillRunner<'c, C> {
    conn: &'c C,
    policy: UnresolvedPolicy,
}

impl<'c, C: ConnectionTrait> BackfillRunner<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self {
            conn,
            policy: UnresolvedPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UnresolvedPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[instrument(skip(self, spec), fields(backfill = %spec))]
    pub async fn backfill(&self, spec: &BackfillSpec) -> Result<BackfillReport> {
        let backend = self.conn.get_database_backend();
        let started = Instant::now();

        let result = self
            .conn
            .execute(spec.update_statement(backend))
            .await
            .map_err(MigrationError::db_error)?;
        let rows_affected = result.rows_affected();

        let unresolved = count_rows(self.conn, spec.unresolved_statement(backend)).await?;
        let report = BackfillReport {
            rows_affected,
            unresolved,
        };

        counter!("pos_migrate.backfill.rows", rows_affected);
        histogram!(
            "pos_migrate.backfill.duration_seconds",
            started.elapsed().as_secs_f64()
        );

        if unresolved > 0 {
            warn!(
                table = %spec.table,
                column = %spec.column,
                unresolved,
                "Backfill left rows without a parent value"
            );
            if self.policy == UnresolvedPolicy::Abort {
                return Err(MigrationError::DataIntegrity {
                    table: spec.table.clone(),
                    column: spec.column.clone(),
                    unresolved,
                });
            }
        }

        info!(rows_affected, unresolved, "Backfill complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Transaction};
    use std::collections::BTreeMap;

    fn orders_spec() -> BackfillSpec {
        BackfillSpec::new(
            "orders",
            "tenantId",
            BackfillSource::new("companies", "tenantId", "companyId", "id"),
        )
    }

    fn count_row(count: i64) -> BTreeMap<&'static str, sea_orm::Value> {
        BTreeMap::from([("count", sea_orm::Value::BigInt(Some(count)))])
    }

    #[test]
    fn mysql_update_uses_join_and_sentinel() {
        let stmt = orders_spec().update_statement(DbBackend::MySql);
        assert_eq!(
            stmt.sql,
            "UPDATE `orders` AS `child` INNER JOIN `companies` AS `parent` \
             ON `child`.`companyId` = `parent`.`id` \
             SET `child`.`tenantId` = `parent`.`tenantId` \
             WHERE (`child`.`tenantId` IS NULL OR `child`.`tenantId` = '') \
             AND `parent`.`tenantId` IS NOT NULL AND `parent`.`tenantId` <> ''"
        );
    }

    #[test]
    fn postgres_update_uses_from_clause() {
        let mut spec = orders_spec();
        spec.source.sentinel = UnsetSentinel::Null;
        let stmt = spec.update_statement(DbBackend::Postgres);
        assert_eq!(
            stmt.sql,
            r#"UPDATE "orders" AS "child" SET "tenantId" = "parent"."tenantId" FROM "companies" AS "parent" WHERE "child"."companyId" = "parent"."id" AND "child"."tenantId" IS NULL AND "parent"."tenantId" IS NOT NULL"#
        );
    }

    #[test]
    fn empty_string_sentinel_is_kept_for_text_columns_only() {
        let source = BackfillSource::new("companies", "legacyId", "companyId", "id");
        assert_eq!(
            source.clone().for_column_type("varchar(64)").sentinel,
            UnsetSentinel::NullOrEmpty
        );

        let numeric = BackfillSpec::new("orders", "legacyId", source.for_column_type("int(11)"));
        assert_eq!(numeric.source.sentinel, UnsetSentinel::Null);
        let update = numeric.update_statement(DbBackend::MySql).sql;
        assert!(!update.contains("''"), "{update}");
        let unresolved = numeric.unresolved_statement(DbBackend::Postgres).sql;
        assert_eq!(
            unresolved,
            r#"SELECT COUNT(*) AS count FROM "orders" WHERE "legacyId" IS NULL"#
        );
    }

    #[tokio::test]
    async fn reports_rows_and_unresolved_count() {
        let db = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 97,
            }])
            .append_query_results([vec![count_row(3)]])
            .into_connection();

        let spec = orders_spec();
        let report = BackfillRunner::new(&db).backfill(&spec).await.unwrap();
        assert_eq!(
            report,
            BackfillReport {
                rows_affected: 97,
                unresolved: 3
            }
        );

        let log = db.into_transaction_log();
        assert_eq!(
            log[0],
            Transaction::one(spec.update_statement(DbBackend::MySql))
        );
    }

    #[tokio::test]
    async fn abort_policy_turns_orphans_into_an_error() {
        let db = MockDatabase::new(DatabaseBackend::MySql)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .append_query_results([vec![count_row(2)]])
            .into_connection();

        let err = BackfillRunner::new(&db)
            .with_policy(UnresolvedPolicy::Abort)
            .backfill(&orders_spec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::DataIntegrity { unresolved: 2, .. }
        ));
    }
}
