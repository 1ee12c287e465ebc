//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The connection string is wrapped in secrecy::SecretString since it
//! usually carries credentials.

use crate::error::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub queue: QueueConfig,
    pub polling_interval: Duration,
    /// 0 = run until stopped.
    pub max_cycles: u64,
    pub bulk_size: usize,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// Engine settings, handed to `Engine` / `Db` at construction.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Waiting requests with the oldest LastUpdate considered for a claim.
    pub oldest_window: usize,
    /// Waiting requests with the newest LastUpdate considered for a claim.
    pub newest_window: usize,
    /// How long a SQLite call waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            oldest_window: 100,
            newest_window: 50,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the request store lives, parsed from the database URL.
#[derive(Debug)]
pub enum StoreLocation {
    SqliteMemory,
    Sqlite(PathBuf),
    Postgres(SecretString),
}

impl StoreLocation {
    pub fn parse(url: &SecretString) -> Result<Self> {
        let raw = url.expose_secret();
        if raw == "sqlite::memory:" {
            Ok(StoreLocation::SqliteMemory)
        } else if let Some(path) = raw.strip_prefix("sqlite:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(Error::Config("sqlite URL has no path".to_string()));
            }
            Ok(StoreLocation::Sqlite(PathBuf::from(path)))
        } else if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
            Ok(StoreLocation::Postgres(url.clone()))
        } else {
            Err(Error::Config(
                "RMSQ_DATABASE_URL must start with sqlite: or postgres://".to_string(),
            ))
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = QueueConfig::default();
        Ok(Self {
            database_url: SecretString::from(required_var("RMSQ_DATABASE_URL")?),
            queue: QueueConfig {
                oldest_window: parsed_var("RMSQ_OLDEST_WINDOW", defaults.oldest_window)?,
                newest_window: parsed_var("RMSQ_NEWEST_WINDOW", defaults.newest_window)?,
                busy_timeout: Duration::from_millis(parsed_var("RMSQ_BUSY_TIMEOUT_MS", 5000)?),
            },
            polling_interval: Duration::from_secs(parsed_var("RMSQ_POLLING_SECS", 120)?),
            max_cycles: parsed_var("RMSQ_MAX_CYCLES", 500)?,
            bulk_size: parsed_var("RMSQ_BULK_SIZE", 10)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn store_location(&self) -> Result<StoreLocation> {
        StoreLocation::parse(&self.database_url)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
