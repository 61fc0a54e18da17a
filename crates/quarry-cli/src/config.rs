//! CLI configuration loading from file and environment variables.

use quarry_db::ConnectionDetails;
use serde::Deserialize;
use thiserror::Error;

/// Top-level CLI configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection details, as a URL or discrete fields.
    #[serde(default = "default_database")]
    pub database: ConnectionDetails,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Migration file settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "quarry_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Where migration files live.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `<version>_<name>.<up|down>.sql` files.
    #[serde(default = "default_migrations_path")]
    pub path: String,
}

fn default_database() -> ConnectionDetails {
    ConnectionDetails::sqlite("quarry.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_migrations_path() -> String {
    "migrations".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            logging: LoggingConfig::default(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            path: default_migrations_path(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `QUARRY_DATABASE_URL` overrides `database.url`
/// - `QUARRY_DIALECT` overrides `database.dialect`
/// - `QUARRY_MIGRATIONS_PATH` overrides `migrations.path`
/// - `QUARRY_LOG_LEVEL` overrides `logging.level`
/// - `QUARRY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };
    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

/// Applies `QUARRY_*` overrides read through `var`.
pub fn apply_env_overrides(mut config: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(url) = var("QUARRY_DATABASE_URL") {
        // Discrete fields from the file do not survive a URL override.
        config.database = ConnectionDetails {
            options: std::mem::take(&mut config.database.options),
            pool: config.database.pool,
            idle_pool: config.database.idle_pool,
            ..ConnectionDetails::from_url(url)
        };
    }
    if let Some(dialect) = var("QUARRY_DIALECT") {
        config.database.dialect = dialect;
    }
    if let Some(path) = var("QUARRY_MIGRATIONS_PATH") {
        config.migrations.path = path;
    }
    if let Some(level) = var("QUARRY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("QUARRY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    config
}
