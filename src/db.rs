//! Connection pool initialization and schema migrations.

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const CONNECT_MAX_ATTEMPTS: u32 = 30;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connect to postgres after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("connect to postgres cancelled")]
    Cancelled,

    #[error("apply migrations: {0}")]
    Migrate(#[from] MigrateError),
}

/// Initialize a connection pool to the PostgreSQL database.
///
/// Connection limits are env-tunable so test runs can cap them.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(10);

    let acquire_timeout_secs = std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(3);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_secs))
        .connect(database_url)
        .await
}

/// Connects with a bounded retry loop so the service can come up before its
/// database does. Cancellable by the shutdown token.
pub async fn connect_with_retry(
    database_url: &str,
    shutdown: &CancellationToken,
) -> Result<PgPool, DbError> {
    let mut attempts = 0;
    loop {
        match init_pool(database_url).await {
            Ok(pool) => return Ok(pool),
            Err(err) => {
                attempts += 1;
                if attempts >= CONNECT_MAX_ATTEMPTS {
                    return Err(DbError::Connect {
                        attempts,
                        source: err,
                    });
                }
                tracing::warn!(
                    error = %err,
                    attempt = attempts,
                    max_attempts = CONNECT_MAX_ATTEMPTS,
                    "postgres connection failed, retrying in {}s",
                    CONNECT_RETRY_INTERVAL.as_secs()
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(DbError::Cancelled),
                    _ = tokio::time::sleep(CONNECT_RETRY_INTERVAL) => {}
                }
            }
        }
    }
}

/// Applies every pending migration from `migrations_dir`.
pub async fn run_migrations(pool: &PgPool, migrations_dir: &str) -> Result<(), DbError> {
    let migrator = Migrator::new(PathBuf::from(migrations_dir)).await?;
    migrator.run(pool).await?;
    Ok(())
}
