//! SQLite connection pool management.

use super::DbError;
use std::time::Duration;

/// Options for creating a database connection pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Maximum time to wait for a connection.
    pub acquire_timeout: Duration,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8);

        let acquire_timeout_secs = std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Creates a SQLite pool from a `sqlite:` URL.
///
/// In-memory databases (`sqlite::memory:`) are limited to one connection,
/// since each connection would otherwise see its own empty database.
#[cfg(feature = "database")]
pub async fn create_pool(database_url: &str) -> Result<sqlx::SqlitePool, DbError> {
    create_pool_with_options(database_url, PoolOptions::default()).await
}

/// Creates a SQLite pool with custom options.
#[cfg(feature = "database")]
pub async fn create_pool_with_options(
    database_url: &str,
    options: PoolOptions,
) -> Result<sqlx::SqlitePool, DbError> {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use tracing::info;

    if !database_url.starts_with("sqlite:") {
        return Err(DbError::Configuration(format!(
            "Unsupported database URL scheme. Expected sqlite:, got: {}",
            database_url.split(':').next().unwrap_or("unknown")
        )));
    }

    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        options.max_connections
    };

    info!(max_connections, "Creating SQLite connection pool");
    let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(options.acquire_timeout)
        .idle_timeout(options.idle_timeout)
        .connect_with(connect_options)
        .await?;

    Ok(pool)
}

#[cfg(not(feature = "database"))]
pub async fn create_pool(_database_url: &str) -> Result<(), DbError> {
    Err(DbError::Configuration(
        "Database support not enabled. Compile with --features database".to_string(),
    ))
}

/// Runs the embedded SQLite migrations.
#[cfg(feature = "database")]
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<(), DbError> {
    tracing::info!("Running SQLite migrations");
    sqlx::migrate!("src/db/migrations/sqlite").run(pool).await?;
    tracing::info!("Migrations completed successfully");
    Ok(())
}
