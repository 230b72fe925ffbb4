//! Environment-based configuration.

use std::time::Duration;

use crate::engine::{DEFAULT_RETRY_DELAY, EngineConfig};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Max connections in the store pool
    pub db_max_connections: u32,

    /// Delay between reconciliation passes
    pub retry_delay: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("CAPSTAN_DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("CAPSTAN_DATABASE_URL must be set"))?;

        let db_max_connections: u32 = std::env::var("CAPSTAN_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let retry_delay = std::env::var("CAPSTAN_RETRY_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY);

        Ok(Config {
            database_url,
            db_max_connections,
            retry_delay,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            retry_delay: self.retry_delay,
        }
    }
}
