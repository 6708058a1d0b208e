//! Turning plan steps into backend-specific SQL.
//!
//! DDL goes through the sea-query schema builders; the pieces sea-query has
//! no builder for (collation conversion, prechecks) are written by hand with
//! quoted identifiers.

use sea_orm::sea_query::{
    Alias, ColumnDef, Expr, ForeignKey, ForeignKeyAction, Index, Table,
};
use sea_orm::{DbBackend, Statement};

use super::step::{MigrationPlan, MigrationStep};
use crate::errors::{MigrationError, Result};
use crate::schema::{ColumnDescriptor, ColumnShape, ForeignKeyDescriptor, ReferentialAction};

/// Quotes an identifier for `backend`, doubling any embedded quote character
pub fn quote_ident(backend: DbBackend, ident: &str) -> String {
    match backend {
        DbBackend::MySql => format!("`{}`", ident.replace('`', "``")),
        DbBackend::Postgres | DbBackend::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

fn backend_name(backend: DbBackend) -> &'static str {
    match backend {
        DbBackend::MySql => "mysql",
        DbBackend::Postgres => "postgres",
        DbBackend::Sqlite => "sqlite",
    }
}

fn unsupported(backend: DbBackend, step: &MigrationStep) -> MigrationError {
    MigrationError::Unsupported {
        backend: backend_name(backend).to_string(),
        operation: step.kind().to_string(),
    }
}

fn column_def(column: &ColumnDescriptor) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(column.name.as_str()));
    apply_shape(&mut def, &column.shape());
    def
}

fn apply_shape(def: &mut ColumnDef, shape: &ColumnShape) {
    def.custom(Alias::new(shape.data_type.as_str()));
    if shape.nullable {
        def.null();
    } else {
        def.not_null();
    }
    if let Some(default) = &shape.default_value {
        def.default(Expr::cust(default.as_str()));
    }
}

fn fk_action(action: ReferentialAction) -> ForeignKeyAction {
    match action {
        ReferentialAction::Cascade => ForeignKeyAction::Cascade,
        ReferentialAction::SetNull => ForeignKeyAction::SetNull,
        ReferentialAction::SetDefault => ForeignKeyAction::SetDefault,
        ReferentialAction::Restrict => ForeignKeyAction::Restrict,
        ReferentialAction::NoAction => ForeignKeyAction::NoAction,
    }
}

/// Charset and collation names are spliced into SQL, so only plain words pass.
fn checked_word<'a>(kind: &str, word: &'a str) -> Result<&'a str> {
    if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(word)
    } else {
        Err(MigrationError::InvalidPlan(format!(
            "invalid {} name: {:?}",
            kind, word
        )))
    }
}

/// Statements that perform `step` on `backend`
pub fn render(step: &MigrationStep, backend: DbBackend) -> Result<Vec<Statement>> {
    let stmt = match step {
        MigrationStep::AddColumn { table, column } => backend.build(
            Table::alter()
                .table(Alias::new(table.as_str()))
                .add_column(&mut column_def(column)),
        ),
        MigrationStep::DropColumn { table, column } => backend.build(
            Table::alter()
                .table(Alias::new(table.as_str()))
                .drop_column(Alias::new(column.name.as_str())),
        ),
        MigrationStep::ModifyColumnConstraint {
            table, column, to, ..
        } => {
            if backend == DbBackend::Sqlite {
                return Err(unsupported(backend, step));
            }
            let mut def = ColumnDef::new(Alias::new(column.as_str()));
            apply_shape(&mut def, to);
            backend.build(
                Table::alter()
                    .table(Alias::new(table.as_str()))
                    .modify_column(&mut def),
            )
        }
        MigrationStep::AddIndex { table, index } => {
            let mut stmt = Index::create();
            stmt.name(&index.name).table(Alias::new(table.as_str()));
            for column in &index.columns {
                stmt.col(Alias::new(column.as_str()));
            }
            if index.unique {
                stmt.unique();
            }
            backend.build(&stmt)
        }
        MigrationStep::DropIndex { table, index } => {
            let mut stmt = Index::drop();
            stmt.name(&index.name);
            // Only MySQL scopes index names to a table.
            if backend == DbBackend::MySql {
                stmt.table(Alias::new(table.as_str()));
            }
            backend.build(&stmt)
        }
        MigrationStep::AddForeignKey { table, foreign_key } => {
            if backend == DbBackend::Sqlite {
                return Err(unsupported(backend, step));
            }
            backend.build(&foreign_key_create(table, foreign_key))
        }
        MigrationStep::DropForeignKey { table, foreign_key } => {
            if backend == DbBackend::Sqlite {
                return Err(unsupported(backend, step));
            }
            backend.build(
                ForeignKey::drop()
                    .name(&foreign_key.name)
                    .table(Alias::new(table.as_str())),
            )
        }
        MigrationStep::ConvertCollation { table, to, .. } => {
            if backend != DbBackend::MySql {
                return Err(unsupported(backend, step));
            }
            Statement::from_string(
                backend,
                format!(
                    "ALTER TABLE {} CONVERT TO CHARACTER SET {} COLLATE {}",
                    quote_ident(backend, table),
                    checked_word("character set", &to.charset)?,
                    checked_word("collation", &to.collation)?
                ),
            )
        }
        MigrationStep::BackfillColumn(spec) => spec.update_statement(backend),
    };
    Ok(vec![stmt])
}

fn foreign_key_create(
    table: &str,
    fk: &ForeignKeyDescriptor,
) -> sea_orm::sea_query::ForeignKeyCreateStatement {
    ForeignKey::create()
        .name(&fk.name)
        .from(Alias::new(table), Alias::new(fk.column.as_str()))
        .to(
            Alias::new(fk.referenced_table.as_str()),
            Alias::new(fk.referenced_column.as_str()),
        )
        .on_delete(fk_action(fk.on_delete))
        .to_owned()
}

/// SQL text for every step of `plan`, for dry runs
pub fn render_plan(plan: &MigrationPlan, backend: DbBackend) -> Result<Vec<String>> {
    let mut script = Vec::with_capacity(plan.len());
    for step in plan {
        for stmt in render(step, backend)? {
            script.push(format!("{};", stmt.sql));
        }
    }
    Ok(script)
}

/// Rows that would break a NOT NULL constraint on `table.column`
pub fn null_count_statement(backend: DbBackend, table: &str, column: &str) -> Statement {
    Statement::from_string(
        backend,
        format!(
            "SELECT COUNT(*) AS count FROM {} WHERE {} IS NULL",
            quote_ident(backend, table),
            quote_ident(backend, column)
        ),
    )
}

/// Rows whose non-null value has no matching referenced row
pub fn orphan_count_statement(
    backend: DbBackend,
    table: &str,
    fk: &ForeignKeyDescriptor,
) -> Statement {
    let q = |ident: &str| quote_ident(backend, ident);
    Statement::from_string(
        backend,
        format!(
            "SELECT COUNT(*) AS count FROM {} AS {} LEFT JOIN {} AS {} ON {}.{} = {}.{} \
             WHERE {}.{} IS NOT NULL AND {}.{} IS NULL",
            q(table),
            q("child"),
            q(&fk.referenced_table),
            q("parent"),
            q("child"),
            q(&fk.column),
            q("parent"),
            q(&fk.referenced_column),
            q("child"),
            q(&fk.column),
            q("parent"),
            q(&fk.referenced_column),
        ),
    )
}
