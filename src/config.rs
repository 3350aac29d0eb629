use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 8;
const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 5;
const CONFIG_DIR: &str = "config";
const ENV_PREFIX: &str = "BAKELINE";

/// Application configuration with validation.
///
/// Sources, lowest to highest precedence: `config/default`, a per-environment
/// file (`config/{environment}`), then `BAKELINE_*` environment variables.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL (postgres or sqlite).
    #[validate(length(min = 1))]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 128))]
    pub db_max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub db_min_connections: u32,

    /// How long to wait for a pooled connection before failing.
    #[serde(default = "default_acquire_timeout")]
    pub db_acquire_timeout_secs: u64,

    /// Transaction-level lock wait budget. Operations blocked past this are
    /// surfaced as retryable `Contention` errors rather than hanging.
    #[serde(default = "default_lock_wait_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub lock_wait_timeout_secs: u64,

    /// Run migrations on startup.
    #[serde(default)]
    pub auto_migrate: bool,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_min_connections() -> u32 {
    DEFAULT_MIN_CONNECTIONS
}

fn default_acquire_timeout() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

fn default_lock_wait_timeout() -> u64 {
    DEFAULT_LOCK_WAIT_TIMEOUT_SECS
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl AppConfig {
    /// Minimal configuration around a database URL; everything else at
    /// defaults. Handy for tests and embedded use.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            db_max_connections: DEFAULT_MAX_CONNECTIONS,
            db_min_connections: DEFAULT_MIN_CONNECTIONS,
            db_acquire_timeout_secs: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            lock_wait_timeout_secs: DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
            auto_migrate: false,
            environment: DEFAULT_ENV.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Loads configuration from files and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENV_PREFIX}_ENVIRONMENT")).unwrap_or_else(|_| DEFAULT_ENV.to_string());

        let cfg: AppConfig = Config::builder()
            .add_source(File::with_name(&format!("{CONFIG_DIR}/default")).required(false))
            .add_source(File::with_name(&format!("{CONFIG_DIR}/{environment}")).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;

        cfg.validate()
            .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

        info!(
            environment = %cfg.environment,
            max_connections = cfg.db_max_connections,
            "configuration loaded"
        );
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_database_passes_validation() {
        let cfg = AppConfig::for_database("sqlite::memory:");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_database_url_is_rejected() {
        let cfg = AppConfig::for_database("");
        assert!(cfg.validate().is_err());
    }
}
