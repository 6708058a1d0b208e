use sea_orm::error::DbErr;
use thiserror::Error;

use crate::config::AppConfigError;
use crate::evolver::{AppliedLog, MigrationStep};

/// Result alias used throughout the crate
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

/// Errors raised while inspecting, planning or applying schema changes.
///
/// "Object already exists" style store errors never surface here: the executor
/// detects them with [`is_already_satisfied`] and records the step as a no-op.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// The store is unreachable or refused the credentials. Fatal.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(DbErr),

    /// Tightening or constraining a column would be rejected by live data.
    #[error("Constraint violation on {table}.{column}: {violating_rows} row(s) {detail}")]
    ConstraintViolation {
        table: String,
        column: String,
        violating_rows: u64,
        detail: String,
    },

    /// A backfill left rows without a parent value and the policy is to abort.
    #[error("Data integrity error on {table}.{column}: {unresolved} row(s) have no matching parent")]
    DataIntegrity {
        table: String,
        column: String,
        unresolved: u64,
    },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{operation} is not supported on {backend}")]
    Unsupported { backend: String, operation: String },

    /// A plan step failed. `committed` lists exactly what ran before it.
    #[error("Step {index} ({step}) failed: {source}")]
    StepFailed {
        index: usize,
        step: Box<MigrationStep>,
        committed: AppliedLog,
        #[source]
        source: Box<MigrationError>,
    },

    #[error("Verification failed, {} step(s) still pending: {}", remaining.len(), remaining.join("; "))]
    VerificationFailed { remaining: Vec<String> },

    #[error("Invalid status transition for {migration}: {from} -> {to}")]
    InvalidTransition {
        migration: String,
        from: String,
        to: String,
    },

    #[error("Unknown migration: {0}")]
    UnknownMigration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] AppConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrationError {
    /// Classifies a raw store error, splitting connection failures from query failures.
    pub fn db_error(err: DbErr) -> Self {
        match &err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => Self::Connection(err.to_string()),
            _ => Self::Database(err),
        }
    }

    /// Exit status for the CLI: 2 for configuration/connection trouble, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Connection(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }

    /// Returns the committed log when the error carries one.
    pub fn committed(&self) -> Option<&AppliedLog> {
        match self {
            Self::StepFailed { committed, .. } => Some(committed),
            _ => None,
        }
    }
}

impl From<DbErr> for MigrationError {
    fn from(err: DbErr) -> Self {
        Self::db_error(err)
    }
}

// Reported when the object a step creates is already there.
const ALREADY_EXISTS_MARKERS: &[&str] = &[
    // MySQL
    "1060",
    "duplicate column name",
    "1061",
    "duplicate key name",
    "1826",
    "duplicate foreign key constraint name",
    // Postgres
    "42701",
    "42p07",
    "42710",
    "already exists",
];

// Reported when the object a step drops is already gone.
const ALREADY_GONE_MARKERS: &[&str] = &[
    // MySQL
    "1091",
    "check that column/key exists",
    "check that it exists",
    // Postgres
    "42703",
    "42704",
    "does not exist",
    // SQLite
    "no such index",
    "no such column",
];

const CONSTRAINT_VIOLATION_MARKERS: &[&str] = &[
    // MySQL
    "1138",
    "invalid use of null value",
    "1452",
    "cannot add or update a child row",
    // Postgres
    "23502",
    "contains null values",
    "23503",
    "violates foreign key constraint",
    // SQLite
    "not null constraint failed",
    "foreign key constraint failed",
];

const AUTH_FAILURE_MARKERS: &[&str] = &[
    "access denied",
    "password authentication failed",
    "authentication failed",
    "28p01",
    "1045",
];

fn message_has(err: &DbErr, markers: &[&str]) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    markers.iter().any(|marker| message.contains(marker))
}

/// True when the store rejected a DDL statement because its effect is already in place.
///
/// `removal` selects the "already gone" family (drops) instead of "already exists".
pub fn is_already_satisfied(err: &DbErr, removal: bool) -> bool {
    let markers = if removal {
        ALREADY_GONE_MARKERS
    } else {
        ALREADY_EXISTS_MARKERS
    };
    match err {
        DbErr::Exec(_) | DbErr::Query(_) | DbErr::Custom(_) => message_has(err, markers),
        _ => false,
    }
}

/// True when the store rejected a statement because live rows break a constraint.
pub fn is_constraint_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(_) | DbErr::Query(_) | DbErr::Custom(_) => {
            message_has(err, CONSTRAINT_VIOLATION_MARKERS)
        }
        _ => false,
    }
}

/// Connection failures worth retrying. Authentication failures are not.
pub fn is_transient_connection_error(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => !message_has(err, AUTH_FAILURE_MARKERS),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::error::RuntimeErr;

    fn exec_err(message: &str) -> DbErr {
        DbErr::Exec(RuntimeErr::Internal(message.to_string()))
    }

    #[test]
    fn duplicate_objects_are_already_satisfied() {
        assert!(is_already_satisfied(
            &exec_err("error returned from database: 1060 (42S21): Duplicate column name 'tenantId'"),
            false
        ));
        assert!(is_already_satisfied(
            &exec_err(
                "error returned from database: 1061 (42000): Duplicate key name 'IDX_orders_tenantId'"
            ),
            false
        ));
        assert!(is_already_satisfied(
            &exec_err(
                "error returned from database: column \"tenantId\" of relation \"orders\" already exists"
            ),
            false
        ));
        assert!(is_already_satisfied(
            &exec_err(
                "error returned from database: 1091 (42000): Can't DROP 'FK_orders_tenantId'; check that column/key exists"
            ),
            true
        ));
    }

    #[test]
    fn ordinary_failures_are_not_already_satisfied() {
        assert!(!is_already_satisfied(
            &exec_err("error returned from database: 1146 (42S02): Table 'pos.orderz' doesn't exist"),
            false
        ));
        // A missing table while adding a column is a real failure, not a satisfied drop.
        assert!(!is_already_satisfied(
            &exec_err("error returned from database: relation \"orderz\" does not exist"),
            false
        ));
        assert!(!is_already_satisfied(
            &DbErr::Conn(RuntimeErr::Internal("connection refused".into())),
            true
        ));
    }

    #[test]
    fn null_violations_are_constraint_violations() {
        assert!(is_constraint_violation(&exec_err(
            "error returned from database: 1138 (22004): Invalid use of NULL value"
        )));
        assert!(is_constraint_violation(&exec_err(
            "error returned from database: column \"tenantId\" of relation \"orders\" contains null values"
        )));
    }

    #[test]
    fn auth_failures_are_not_retried() {
        let refused = DbErr::Conn(RuntimeErr::Internal("Connection refused (os error 111)".into()));
        let denied = DbErr::Conn(RuntimeErr::Internal(
            "error returned from database: 1045 (28000): Access denied for user 'pos'".into(),
        ));
        assert!(is_transient_connection_error(&refused));
        assert!(!is_transient_connection_error(&denied));
        assert!(!is_transient_connection_error(&exec_err("syntax error")));
    }

    #[test]
    fn connection_errors_are_classified() {
        let err = MigrationError::from(DbErr::Conn(RuntimeErr::Internal("refused".into())));
        assert!(matches!(err, MigrationError::Connection(_)));
        assert_eq!(err.exit_code(), 2);

        let err = MigrationError::from(exec_err("boom"));
        assert!(matches!(err, MigrationError::Database(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
