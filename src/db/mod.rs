//! Postgres backend: connection pool, migrations, and health check.
//!
//! Serves the same operations as the embedded engine, for deployments where
//! many worker hosts share one store.

pub mod requests;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::telemetry::{NoopMonitor, QueueMonitor};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
    config: QueueConfig,
    monitor: Arc<dyn QueueMonitor>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, config: QueueConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(config.busy_timeout)
            .connect(url)
            .await
            .map_err(|e| Error::Config(format!("cannot connect to Postgres: {e}")))?;
        Ok(Self {
            pool,
            config,
            monitor: Arc::new(NoopMonitor),
        })
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn QueueMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
