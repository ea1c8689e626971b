//! Application configuration: CLI flags overridden by environment
//! variables.

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "loyalty-rs", about = "Loyalty points service")]
struct Flags {
    /// HTTP listen address in host:port form
    #[arg(short = 'a', long = "run-address", default_value = "localhost:8080")]
    run_address: String,

    /// Database DSN
    #[arg(short = 'd', long = "database-uri", default_value = "")]
    database_uri: String,

    /// Directory with SQL migrations
    #[arg(short = 'm', long = "migrations-dir", default_value = "migrations")]
    migrations_dir: String,

    /// Base URL of the external accrual provider
    #[arg(
        short = 'f',
        long = "accrual-address",
        default_value = "http://localhost:8081"
    )]
    accrual_address: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("database DSN is not set (DATABASE_URI env or -d flag)")]
    MissingDatabaseUri,

    #[error("JWT_USER_SECRET env is not set")]
    MissingJwtSecret,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub run_address: String,
    pub database_uri: String,
    pub migrations_dir: String,
    pub accrual_address: String,
    pub jwt_secret: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_flags(Flags::parse())
    }

    fn from_flags(flags: Flags) -> Result<Self, ConfigError> {
        let database_uri = env_or("DATABASE_URI", flags.database_uri);
        if database_uri.is_empty() {
            return Err(ConfigError::MissingDatabaseUri);
        }

        let jwt_secret = std::env::var("JWT_USER_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }

        Ok(Config {
            run_address: env_or("RUN_ADDRESS", flags.run_address),
            database_uri,
            migrations_dir: env_or("MIGRATIONS_DIR", flags.migrations_dir),
            accrual_address: env_or("ACCRUAL_SYSTEM_ADDRESS", flags.accrual_address),
            jwt_secret,
        })
    }
}

/// An environment variable, when present and non-empty, wins over the flag.
fn env_or(key: &str, flag_value: String) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => flag_value,
    }
}
