use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationSettings {
    pub interval_seconds: u64,
    /// How long a journal may stay open before the reconciler takes over
    pub grace_seconds: u64,
}

impl ReconciliationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub port: u16,
    pub use_in_memory_db: bool,
    pub db_host: String,
    pub db_username: String,
    pub db_password: String,
    pub catalog_url: String,
    pub legacy_collections: bool,
    pub retry: RetryPolicy,
    pub reconciliation: ReconciliationSettings,
}

impl Settings {
    /// Defaults overridden by environment variables, nested keys separated
    /// by `__` (e.g. `RETRY__MAX_RETRIES`)
    pub fn load() -> anyhow::Result<Self> {
        Self::from_environment(Environment::default())
    }

    fn from_environment(environment: Environment) -> anyhow::Result<Self> {
        let defaults = RetryPolicy::default();
        Ok(Config::builder()
            .set_default("port", 8080)?
            .set_default("use_in_memory_db", false)?
            .set_default("db_host", "127.0.0.1")?
            .set_default("db_username", "postgres")?
            .set_default("db_password", "postgres")?
            .set_default("catalog_url", "http://localhost:8080")?
            .set_default("legacy_collections", false)?
            .set_default("retry.max_retries", defaults.max_retries)?
            .set_default(
                "retry.initial_delay_ms",
                defaults.initial_delay.as_millis() as u64,
            )?
            .set_default("retry.max_delay_ms", defaults.max_delay.as_millis() as u64)?
            .set_default("reconciliation.interval_seconds", 60)?
            .set_default("reconciliation.grace_seconds", 30)?
            .add_source(environment.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?)
    }
}
