//! Reads table structure from the store's catalog.
//!
//! All catalog access goes through parameterized queries; table and schema
//! names are never spliced into SQL here.

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::histogram;
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, Statement, Value};
use tracing::{debug, instrument};

use crate::errors::{MigrationError, Result};
use crate::schema::{
    Collation, ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, ReferentialAction,
    SchemaSnapshot, TableSnapshot,
};

#[derive(Debug, FromQueryResult)]
struct TableRow {
    #[allow(dead_code)]
    table_name: String,
    charset: Option<String>,
    collation: Option<String>,
}

#[derive(Debug, FromQueryResult)]
struct ColumnRow {
    column_name: String,
    data_type: String,
    is_nullable: String,
    column_default: Option<String>,
    is_primary_key: String,
}

#[derive(Debug, FromQueryResult)]
struct IndexRow {
    index_name: String,
    column_name: Option<String>,
    is_unique: String,
}

#[derive(Debug, FromQueryResult)]
struct ForeignKeyRow {
    constraint_name: String,
    column_name: String,
    referenced_table: String,
    referenced_column: Option<String>,
    on_delete: Option<String>,
}

#[derive(Debug, FromQueryResult)]
struct SchemaRow {
    name: Option<String>,
}

const MYSQL_TABLE: &str = r#"
SELECT CAST(t.TABLE_NAME AS CHAR) AS table_name,
       CAST(c.CHARACTER_SET_NAME AS CHAR) AS charset,
       CAST(t.TABLE_COLLATION AS CHAR) AS collation
FROM information_schema.TABLES t
LEFT JOIN information_schema.COLLATION_CHARACTER_SET_APPLICABILITY c
       ON c.COLLATION_NAME = t.TABLE_COLLATION
WHERE t.TABLE_SCHEMA = ? AND t.TABLE_NAME = ?"#;

const MYSQL_COLUMNS: &str = r#"
SELECT CAST(COLUMN_NAME AS CHAR) AS column_name,
       CAST(COLUMN_TYPE AS CHAR) AS data_type,
       CAST(IS_NULLABLE AS CHAR) AS is_nullable,
       CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
       CASE WHEN COLUMN_KEY = 'PRI' THEN 'YES' ELSE 'NO' END AS is_primary_key
FROM information_schema.COLUMNS
WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
ORDER BY ORDINAL_POSITION"#;

const MYSQL_INDEXES: &str = r#"
SELECT CAST(INDEX_NAME AS CHAR) AS index_name,
       CAST(COLUMN_NAME AS CHAR) AS column_name,
       CASE WHEN NON_UNIQUE = 0 THEN 'YES' ELSE 'NO' END AS is_unique
FROM information_schema.STATISTICS
WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND INDEX_NAME <> 'PRIMARY'
ORDER BY INDEX_NAME, SEQ_IN_INDEX"#;

const MYSQL_FOREIGN_KEYS: &str = r#"
SELECT CAST(k.CONSTRAINT_NAME AS CHAR) AS constraint_name,
       CAST(k.COLUMN_NAME AS CHAR) AS column_name,
       CAST(k.REFERENCED_TABLE_NAME AS CHAR) AS referenced_table,
       CAST(k.REFERENCED_COLUMN_NAME AS CHAR) AS referenced_column,
       CAST(r.DELETE_RULE AS CHAR) AS on_delete
FROM information_schema.KEY_COLUMN_USAGE k
JOIN information_schema.REFERENTIAL_CONSTRAINTS r
  ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
 AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
 AND r.TABLE_NAME = k.TABLE_NAME
WHERE k.TABLE_SCHEMA = ? AND k.TABLE_NAME = ? AND k.REFERENCED_TABLE_NAME IS NOT NULL
ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION"#;

const POSTGRES_TABLE: &str = r#"
SELECT c.relname::text AS table_name, NULL::text AS charset, NULL::text AS collation
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')"#;

const POSTGRES_COLUMNS: &str = r#"
SELECT a.attname::text AS column_name,
       format_type(a.atttypid, a.atttypmod) AS data_type,
       CASE WHEN a.attnotnull THEN 'NO' ELSE 'YES' END AS is_nullable,
       pg_get_expr(d.adbin, d.adrelid) AS column_default,
       CASE WHEN EXISTS (
           SELECT 1 FROM pg_index i
           WHERE i.indrelid = c.oid AND i.indisprimary AND a.attnum = ANY(i.indkey)
       ) THEN 'YES' ELSE 'NO' END AS is_primary_key
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum"#;

const POSTGRES_INDEXES: &str = r#"
SELECT ic.relname::text AS index_name,
       a.attname::text AS column_name,
       CASE WHEN i.indisunique THEN 'YES' ELSE 'NO' END AS is_unique
FROM pg_index i
JOIN pg_class c ON c.oid = i.indrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_class ic ON ic.oid = i.indexrelid
CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
WHERE n.nspname = $1 AND c.relname = $2 AND NOT i.indisprimary
ORDER BY ic.relname, k.ord"#;

const POSTGRES_FOREIGN_KEYS: &str = r#"
SELECT con.conname::text AS constraint_name,
       a.attname::text AS column_name,
       rc.relname::text AS referenced_table,
       ra.attname::text AS referenced_column,
       CASE con.confdeltype
           WHEN 'c' THEN 'CASCADE'
           WHEN 'n' THEN 'SET NULL'
           WHEN 'd' THEN 'SET DEFAULT'
           WHEN 'r' THEN 'RESTRICT'
           ELSE 'NO ACTION'
       END AS on_delete
FROM pg_constraint con
JOIN pg_class c ON c.oid = con.conrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_class rc ON rc.oid = con.confrelid
JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = con.conkey[1]
JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = con.confkey[1]
WHERE con.contype = 'f' AND n.nspname = $1 AND c.relname = $2
ORDER BY con.conname"#;

const SQLITE_TABLE: &str = r#"
SELECT name AS table_name, NULL AS charset, NULL AS collation
FROM sqlite_master
WHERE type = 'table' AND name = ?"#;

const SQLITE_COLUMNS: &str = r#"
SELECT name AS column_name,
       type AS data_type,
       CASE WHEN "notnull" = 1 OR pk > 0 THEN 'NO' ELSE 'YES' END AS is_nullable,
       dflt_value AS column_default,
       CASE WHEN pk > 0 THEN 'YES' ELSE 'NO' END AS is_primary_key
FROM pragma_table_info(?)
ORDER BY cid"#;

const SQLITE_INDEXES: &str = r#"
SELECT il.name AS index_name,
       ii.name AS column_name,
       CASE WHEN il."unique" = 1 THEN 'YES' ELSE 'NO' END AS is_unique
FROM pragma_index_list(?) AS il
JOIN pragma_index_info(il.name) AS ii
WHERE il.origin <> 'pk'
ORDER BY il.name, ii.seqno"#;

// SQLite foreign keys are anonymous; a stable name is derived from the column.
const SQLITE_FOREIGN_KEYS: &str = r#"
SELECT 'fk_' || ? || '_' || "from" AS constraint_name,
       "from" AS column_name,
       "table" AS referenced_table,
       "to" AS referenced_column,
       on_delete
FROM pragma_foreign_key_list(?)
ORDER BY id, seq"#;

#[derive(Clone, Copy)]
enum CatalogQuery {
    Table,
    Columns,
    Indexes,
    ForeignKeys,
}

/// Catalog reader over any sea-orm connection
pub struct SchemaInspector<'c, C> {
    conn: &'c C,
    backend: DbBackend,
}

impl<'c, C: ConnectionTrait> SchemaInspector<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self {
            conn,
            backend: conn.get_database_backend(),
        }
    }

    /// The schema the connection resolves unqualified names in
    pub async fn current_schema(&self) -> Result<String> {
        let sql = match self.backend {
            DbBackend::MySql => "SELECT CAST(DATABASE() AS CHAR) AS name",
            DbBackend::Postgres => "SELECT current_schema()::text AS name",
            DbBackend::Sqlite => return Ok("main".to_string()),
        };
        let row = SchemaRow::find_by_statement(Statement::from_string(self.backend, sql))
            .one(self.conn)
            .await
            .map_err(MigrationError::db_error)?;
        row.and_then(|r| r.name).ok_or_else(|| {
            MigrationError::InvalidPlan("the connection has no default schema selected".into())
        })
    }

    fn statement(&self, query: CatalogQuery, schema: &str, table: &str) -> Statement {
        let sql = match (self.backend, query) {
            (DbBackend::MySql, CatalogQuery::Table) => MYSQL_TABLE,
            (DbBackend::MySql, CatalogQuery::Columns) => MYSQL_COLUMNS,
            (DbBackend::MySql, CatalogQuery::Indexes) => MYSQL_INDEXES,
            (DbBackend::MySql, CatalogQuery::ForeignKeys) => MYSQL_FOREIGN_KEYS,
            (DbBackend::Postgres, CatalogQuery::Table) => POSTGRES_TABLE,
            (DbBackend::Postgres, CatalogQuery::Columns) => POSTGRES_COLUMNS,
            (DbBackend::Postgres, CatalogQuery::Indexes) => POSTGRES_INDEXES,
            (DbBackend::Postgres, CatalogQuery::ForeignKeys) => POSTGRES_FOREIGN_KEYS,
            (DbBackend::Sqlite, CatalogQuery::Table) => SQLITE_TABLE,
            (DbBackend::Sqlite, CatalogQuery::Columns) => SQLITE_COLUMNS,
            (DbBackend::Sqlite, CatalogQuery::Indexes) => SQLITE_INDEXES,
            (DbBackend::Sqlite, CatalogQuery::ForeignKeys) => SQLITE_FOREIGN_KEYS,
        };
        let values: Vec<Value> = match (self.backend, query) {
            (DbBackend::Sqlite, CatalogQuery::ForeignKeys) => vec![table.into(), table.into()],
            (DbBackend::Sqlite, _) => vec![table.into()],
            _ => vec![schema.into(), table.into()],
        };
        Statement::from_sql_and_values(self.backend, sql.trim(), values)
    }

    async fn fetch<T: FromQueryResult>(
        &self,
        query: CatalogQuery,
        schema: &str,
        table: &str,
    ) -> Result<Vec<T>> {
        T::find_by_statement(self.statement(query, schema, table))
            .all(self.conn)
            .await
            .map_err(MigrationError::db_error)
    }

    pub async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        let rows: Vec<TableRow> = self.fetch(CatalogQuery::Table, schema, table).await?;
        Ok(!rows.is_empty())
    }

    pub async fn column_exists(&self, schema: &str, table: &str, column: &str) -> Result<bool> {
        Ok(self
            .columns(schema, table)
            .await?
            .iter()
            .any(|c| c.name == column))
    }

    pub async fn index_exists(&self, schema: &str, table: &str, index: &str) -> Result<bool> {
        Ok(self.indexes(schema, table).await?.contains_key(index))
    }

    pub async fn foreign_key_exists(&self, schema: &str, table: &str, name: &str) -> Result<bool> {
        Ok(self.foreign_keys(schema, table).await?.contains_key(name))
    }

    async fn columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let rows: Vec<ColumnRow> = self.fetch(CatalogQuery::Columns, schema, table).await?;
        Ok(rows
            .into_iter()
            .map(|row| ColumnDescriptor {
                name: row.column_name,
                data_type: row.data_type,
                nullable: row.is_nullable.eq_ignore_ascii_case("YES"),
                default_value: row.column_default,
                is_primary_key: row.is_primary_key == "YES",
            })
            .collect())
    }

    async fn indexes(&self, schema: &str, table: &str) -> Result<BTreeMap<String, IndexDescriptor>> {
        let rows: Vec<IndexRow> = self.fetch(CatalogQuery::Indexes, schema, table).await?;
        let mut indexes: BTreeMap<String, IndexDescriptor> = BTreeMap::new();
        for row in rows {
            let index = indexes
                .entry(row.index_name.clone())
                .or_insert_with(|| IndexDescriptor {
                    name: row.index_name.clone(),
                    columns: Vec::new(),
                    unique: row.is_unique == "YES",
                });
            // Expression index parts have no column name.
            if let Some(column) = row.column_name {
                index.columns.push(column);
            }
        }
        Ok(indexes)
    }

    async fn foreign_keys(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<BTreeMap<String, ForeignKeyDescriptor>> {
        let rows: Vec<ForeignKeyRow> = self.fetch(CatalogQuery::ForeignKeys, schema, table).await?;
        let mut keys = BTreeMap::new();
        for row in rows {
            // Only the first column of a composite key is tracked.
            if keys.contains_key(&row.constraint_name) {
                continue;
            }
            let on_delete = row
                .on_delete
                .as_deref()
                .and_then(|rule| rule.parse::<ReferentialAction>().ok())
                .unwrap_or_default();
            let fk = ForeignKeyDescriptor {
                name: row.constraint_name,
                column: row.column_name,
                referenced_table: row.referenced_table,
                referenced_column: row.referenced_column.unwrap_or_else(|| "id".to_string()),
                on_delete,
            };
            keys.insert(fk.name.clone(), fk);
        }
        Ok(keys)
    }

    async fn load_table(&self, schema: &str, table: &str) -> Result<Option<TableSnapshot>> {
        let mut rows: Vec<TableRow> = self.fetch(CatalogQuery::Table, schema, table).await?;
        let Some(row) = rows.pop() else {
            return Ok(None);
        };
        let collation = match (row.charset, row.collation) {
            (Some(charset), Some(collation)) => Some(Collation::new(charset, collation)),
            _ => None,
        };
        Ok(Some(TableSnapshot {
            name: table.to_string(),
            columns: self.columns(schema, table).await?,
            indexes: self.indexes(schema, table).await?,
            foreign_keys: self.foreign_keys(schema, table).await?,
            collation,
        }))
    }

    /// Structure of one table; the snapshot is empty if the table does not exist
    pub async fn describe_table(&self, schema: &str, table: &str) -> Result<SchemaSnapshot> {
        self.snapshot(schema, &[table.to_string()]).await
    }

    /// Structure of every listed table that exists
    #[instrument(skip(self, tables), fields(tables = tables.len()))]
    pub async fn snapshot(&self, schema: &str, tables: &[String]) -> Result<SchemaSnapshot> {
        let started = Instant::now();
        let mut snapshot = SchemaSnapshot::new(schema);
        for table in tables {
            match self.load_table(schema, table).await? {
                Some(loaded) => snapshot.insert(loaded),
                None => debug!(table = %table, "Table not found in catalog"),
            }
        }
        histogram!("pos_migrate.inspect.duration", started.elapsed());
        Ok(snapshot)
    }
}
