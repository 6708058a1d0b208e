use crate::config::AppConfig;
use crate::errors::{is_transient_connection_error, MigrationError, Result};
use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Upper bound for a single backoff delay between connection attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Configuration for the migration connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL (contains the password; never log it)
    pub url: String,
    /// URL with the password masked, for logs
    pub redacted_url: String,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Attempts after the first failed connection
    pub connect_retries: u32,
    /// Base delay for exponential backoff
    pub connect_backoff: Duration,
}

impl TryFrom<&AppConfig> for DbConfig {
    type Error = MigrationError;

    fn try_from(cfg: &AppConfig) -> Result<Self> {
        let db = &cfg.database;
        Ok(Self {
            url: db.connection_url()?,
            redacted_url: db.redacted_url(),
            connect_timeout: db.connect_timeout(),
            acquire_timeout: db.connect_timeout(),
            connect_retries: db.connect_retries,
            connect_backoff: db.connect_backoff(),
        })
    }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.checked_mul(factor)
        .map(|delay| delay.min(MAX_BACKOFF))
        .unwrap_or(MAX_BACKOFF)
}

/// Runs `connect` until it succeeds, fails with a non-transient error, or
/// `retries` extra attempts are used up.
pub async fn retry_connect<T, F, Fut>(retries: u32, base: Duration, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, DbErr>>,
{
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(conn) => return Ok(conn),
            Err(err) if attempt < retries && is_transient_connection_error(&err) => {
                let delay = backoff_delay(base, attempt);
                warn!(
                    attempt = attempt + 1,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Database connection failed, retrying"
                );
                counter!("pos_migrate.db.connect_retries", 1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(error = %err, "Database connection failed");
                return Err(MigrationError::Connection(err.to_string()));
            }
        }
    }
}

/// Opens the single connection used for a migration run
///
/// Schema changes run strictly one after another, so the pool holds exactly
/// one connection.
pub async fn establish_connection(config: &DbConfig) -> Result<DbPool> {
    debug!(url = %config.redacted_url, "Configuring database connection");

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(false);

    let start = std::time::Instant::now();
    let pool = retry_connect(config.connect_retries, config.connect_backoff, || {
        Database::connect(opt.clone())
    })
    .await?;

    histogram!("pos_migrate.db.connect_duration", start.elapsed());
    info!(url = %config.redacted_url, "Database connection established");
    Ok(pool)
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    debug!("Checking database connection");
    let start = std::time::Instant::now();

    let result = pool.ping().await.map_err(MigrationError::db_error);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("pos_migrate.db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            error!(
                "Database connection check failed after {:?}: {}",
                elapsed, e
            );
            counter!("pos_migrate.db.connection_failures", 1);
        }
    }

    result
}

/// Closes the database connection pool
pub async fn close_pool(pool: DbPool) -> Result<()> {
    info!("Closing database connection");
    pool.close().await.map_err(MigrationError::db_error)
}

/// Connects, runs `f`, and closes the connection whether `f` succeeded or not.
pub async fn with_connection<F, T>(config: &DbConfig, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a DbPool) -> BoxFuture<'a, Result<T>>,
{
    let pool = establish_connection(config).await?;
    let result = match check_connection(&pool).await {
        Ok(()) => f(&pool).await,
        Err(err) => Err(err),
    };
    if let Err(err) = close_pool(pool).await {
        warn!(error = %err, "Failed to close database connection");
    }
    result
}

/// Runs a `SELECT COUNT(*) AS count ...` statement
pub async fn count_rows<C: ConnectionTrait>(conn: &C, stmt: Statement) -> Result<u64> {
    debug!(sql = %stmt.sql, "Counting rows");
    let row = conn
        .query_one(stmt)
        .await
        .map_err(MigrationError::db_error)?;
    let count = match row {
        Some(row) => row
            .try_get::<i64>("", "count")
            .map_err(MigrationError::db_error)?,
        None => 0,
    };
    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 10), MAX_BACKOFF);
        assert_eq!(backoff_delay(base, 40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = retry_connect(3, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DbErr::Conn(RuntimeErr::Internal("connection refused".into())))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_connect(2, Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(DbErr::Conn(RuntimeErr::Internal("timed out".into()))) }
        })
        .await;
        assert!(matches!(result, Err(MigrationError::Connection(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_connect(5, Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(DbErr::Conn(RuntimeErr::Internal(
                    "1045 (28000): Access denied for user 'pos'".into(),
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
