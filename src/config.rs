use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use sea_orm::DbBackend;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::backfill::UnresolvedPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CHARSET: &str = "utf8mb4";
const DEFAULT_CONNECT_RETRIES: u32 = 3;
const DEFAULT_CONNECT_BACKOFF_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("invalid connection parameters: {0}")]
    Url(#[from] url::ParseError),
}

/// Relational engine behind the connection
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    Mysql,
    Postgres,
    Sqlite,
}

impl Backend {
    fn scheme(&self) -> &'static str {
        match self {
            Backend::Mysql => "mysql",
            Backend::Postgres => "postgres",
            Backend::Sqlite => "sqlite",
        }
    }

    fn default_port(&self) -> Option<u16> {
        match self {
            Backend::Mysql => Some(3306),
            Backend::Postgres => Some(5432),
            Backend::Sqlite => None,
        }
    }
}

impl From<Backend> for DbBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Mysql => DbBackend::MySql,
            Backend::Postgres => DbBackend::Postgres,
            Backend::Sqlite => DbBackend::Sqlite,
        }
    }
}

/// A credential that never shows up in `Debug` output or logs
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Connection parameters for the store being migrated
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Server host (ignored for SQLite)
    #[serde(default)]
    pub host: String,

    /// Server port, defaults to the engine's standard port
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: Secret,

    /// Database name, or the file path for SQLite (`:memory:` allowed)
    #[validate(length(min = 1))]
    pub database: String,

    /// Catalog schema to inspect. MySQL uses the database name, Postgres `public`.
    #[serde(default)]
    pub schema: Option<String>,

    /// Connection character set (MySQL)
    #[serde(default = "default_charset")]
    #[validate(length(min = 1))]
    pub charset: String,

    /// Bounded retries for the initial connection
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Base delay for exponential backoff between connection attempts
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Connection URL including the password. Never log this; use [`Self::redacted_url`].
    pub fn connection_url(&self) -> Result<String, AppConfigError> {
        self.build_url(true)
    }

    /// Connection URL with the password masked
    pub fn redacted_url(&self) -> String {
        self.build_url(false)
            .unwrap_or_else(|_| format!("{}://<invalid>", self.backend.scheme()))
    }

    /// Schema name used for catalog queries
    pub fn schema_name(&self) -> String {
        match (&self.schema, self.backend) {
            (Some(schema), _) => schema.clone(),
            (None, Backend::Mysql) => self.database.clone(),
            (None, Backend::Postgres) => "public".to_string(),
            (None, Backend::Sqlite) => "main".to_string(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    fn build_url(&self, with_password: bool) -> Result<String, AppConfigError> {
        if self.backend == Backend::Sqlite {
            return Ok(if self.database == ":memory:" {
                "sqlite::memory:".to_string()
            } else {
                format!("sqlite://{}?mode=rwc", self.database)
            });
        }

        let mut url = Url::parse(&format!("{}://{}", self.backend.scheme(), self.host))?;
        let parse_err = |_| AppConfigError::Url(url::ParseError::InvalidDomainCharacter);
        url.set_username(&self.username).map_err(parse_err)?;
        if !self.password.is_empty() {
            let password = if with_password {
                self.password.expose()
            } else {
                "***"
            };
            url.set_password(Some(password)).map_err(parse_err)?;
        }
        url.set_port(self.port.or_else(|| self.backend.default_port()))
            .map_err(parse_err)?;
        url.set_path(&self.database);
        if self.backend == Backend::Mysql {
            url.query_pairs_mut().append_pair("charset", &self.charset);
        }
        Ok(url.to_string())
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.backend != Backend::Sqlite {
            if self.host.trim().is_empty() {
                errors.add("host", non_empty_error("host"));
            }
            if self.username.trim().is_empty() {
                errors.add("username", non_empty_error("username"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[validate]
    pub database: DatabaseConfig,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Abort the remaining plan at the first failing step
    #[serde(default = "default_true_bool")]
    pub fail_fast: bool,

    /// What to do when a backfill leaves rows without a parent value
    #[serde(default)]
    pub unresolved_backfill: UnresolvedPolicy,
}

impl AppConfig {
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn default_backend() -> Backend {
    Backend::Mysql
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

fn default_connect_retries() -> u32 {
    DEFAULT_CONNECT_RETRIES
}

fn default_connect_backoff_ms() -> u64 {
    DEFAULT_CONNECT_BACKOFF_MS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_true_bool() -> bool {
    true
}

fn non_empty_error(field: &'static str) -> ValidationError {
    let mut err = ValidationError::new(field);
    err.message = Some(format!("{} must not be empty", field).into());
    err
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("pos_migrate={},sea_orm=warn,sqlx=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    // Logs go to stderr so `--json` output on stdout stays machine readable.
    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .with_writer(std::io::stderr)
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn base_builder() -> Result<ConfigBuilder<DefaultState>, AppConfigError> {
    Ok(Config::builder()
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?)
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = builder.build()?.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config
        .database
        .validate_additional_constraints()
        .map_err(|e| {
            error!("Database configuration validation failed: {:?}", e);
            AppConfigError::Validation(e)
        })?;

    Ok(app_config)
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, e.g. APP__DATABASE__PASSWORD)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let builder = base_builder()?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let app_config = finish(builder)?;
    info!(
        database = %app_config.database.redacted_url(),
        "Configuration loaded successfully"
    );
    Ok(app_config)
}

/// Loads configuration from a TOML document on top of the built-in defaults
pub fn load_config_from_toml(content: &str) -> Result<AppConfig, AppConfigError> {
    let builder =
        base_builder()?.add_source(File::from_str(content, config::FileFormat::Toml));
    finish(builder)
}
