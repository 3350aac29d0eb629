use crate::config::AppConfig;
use anyhow::Context;
use metrics::gauge;
use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbBackend};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{debug, info};

/// Type alias for a database connection pool.
pub type DbPool = DatabaseConnection;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Row-lock wait budget applied server-side where the backend supports it
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
            lock_wait_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Establishes a connection pool to the database with default settings.
pub async fn establish_connection(database_url: &str) -> Result<DbPool, anyhow::Error> {
    let config = DbConfig {
        url: database_url.to_string(),
        ..Default::default()
    };
    establish_connection_with_config(&config).await
}

/// Establishes a connection pool with custom configuration.
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, anyhow::Error> {
    debug!("configuring database connection: {:?}", config);

    let url = match config.lock_wait_timeout {
        Some(timeout) => with_lock_timeout(&config.url, timeout),
        None => config.url.clone(),
    };

    let mut opt = ConnectOptions::new(url);
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(true);

    gauge!("bakeline_db.max_connections", config.max_connections as f64);

    info!(
        max_connections = config.max_connections,
        "connecting to database"
    );

    let pool = Database::connect(opt)
        .await
        .context("failed to connect to database")?;
    Ok(pool)
}

/// Builds the pool from application configuration and optionally migrates.
pub async fn establish_connection_from_app_config(
    config: &AppConfig,
) -> Result<DbPool, anyhow::Error> {
    let db_config = DbConfig {
        url: config.database_url.clone(),
        max_connections: config.db_max_connections,
        min_connections: config.db_min_connections,
        acquire_timeout: Duration::from_secs(config.db_acquire_timeout_secs),
        lock_wait_timeout: Some(Duration::from_secs(config.lock_wait_timeout_secs)),
        ..Default::default()
    };

    let pool = establish_connection_with_config(&db_config).await?;

    if config.auto_migrate {
        run_migrations(&pool).await?;
    }

    Ok(pool)
}

/// Applies all pending migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), anyhow::Error> {
    info!("running database migrations");
    crate::migrator::Migrator::up(pool, None)
        .await
        .context("database migration failed")?;
    Ok(())
}

/// True when the backend honors `SELECT ... FOR UPDATE` row locks. SQLite's
/// grammar has no `FOR UPDATE`; its single-writer lock serializes the whole
/// transaction instead, so the hint must be skipped there.
pub fn backend_supports_row_locks(backend: DbBackend) -> bool {
    !matches!(backend, DbBackend::Sqlite)
}

// libpq carries session settings in the `options` URL parameter. A blocked
// lock wait then fails server-side within the budget and surfaces as a
// retryable contention error instead of hanging the request.
fn with_lock_timeout(url: &str, timeout: Duration) -> String {
    if url.starts_with("postgres") && !url.contains("options=") {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!(
            "{url}{sep}options=-c%20lock_timeout%3D{}ms",
            timeout.as_millis()
        )
    } else {
        url.to_string()
    }
}
