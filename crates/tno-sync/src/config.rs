use std::{str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{bounded::BoundedRun, error::ConfigError};

pub const ENV_DRAIN_TIMEOUT_MS: &str = "TNO_DRAIN_TIMEOUT_MS";
pub const ENV_CONCURRENCY: &str = "TNO_CONCURRENCY";

/// Tunables for batch execution and shutdown draining.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a shutdown waits for in-flight work (default: 30 seconds).
    pub drain_timeout_ms: u64,
    /// Default concurrency limit for batches (default: 8).
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 30_000,
            concurrency: 8,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `TNO_DRAIN_TIMEOUT_MS` and `TNO_CONCURRENCY` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup(ENV_DRAIN_TIMEOUT_MS) {
            cfg.drain_timeout_ms = parse(ENV_DRAIN_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY) {
            cfg.concurrency = parse(ENV_CONCURRENCY, &v)?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    #[inline]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Runner with the configured limit, registered with the process-wide coordinator.
    #[inline]
    pub fn runner(&self) -> BoundedRun {
        BoundedRun::new(self.concurrency)
    }
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
