// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the vigil task engine.

use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`sqlite:` or `postgres://`)
    pub database_url: String,
    /// Wall-clock budget of one cron-triggered invocation
    pub max_execution: Duration,
    /// Percentage of `max_execution` work may use
    pub execution_bias: u8,
    /// Delay before a task that returned WILL_RESUME becomes due again
    pub resume_delay: Duration,
    /// Age after which a RUNNING task's lock is considered abandoned
    pub stale_lock_after: Duration,
    /// Identifier written into `tasks.locked_by`
    pub runner_id: String,
    /// Sites claimed per site-info fan-out batch
    pub site_info_batch: i64,
    /// Minimum age of a site's last refresh before it is claimed again
    pub site_info_staleness: Duration,
    /// Maximum in-flight requests in one fan-out batch
    pub fanout_concurrency: usize,
}

impl Config {
    /// Default settings for the given database URL.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_execution: Duration::from_secs(60),
            execution_bias: 75,
            resume_delay: Duration::from_secs(1),
            stale_lock_after: Duration::from_secs(180),
            runner_id: default_runner_id(),
            site_info_batch: 10,
            site_info_staleness: Duration::from_secs(900),
            fanout_concurrency: 10,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("VIGIL_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("VIGIL_DATABASE_URL"))?;

        let mut config = Self::with_database_url(database_url);

        config.max_execution = Duration::from_secs(env_number(
            "VIGIL_MAX_EXECUTION_SECS",
            config.max_execution.as_secs(),
        )?);
        config.execution_bias = env_number("VIGIL_EXECUTION_BIAS", config.execution_bias)?;
        config.resume_delay = Duration::from_secs(env_number(
            "VIGIL_RESUME_DELAY_SECS",
            config.resume_delay.as_secs(),
        )?);
        config.stale_lock_after = Duration::from_secs(env_number(
            "VIGIL_STALE_LOCK_SECS",
            config.stale_lock_after.as_secs(),
        )?);
        config.site_info_batch = env_number("VIGIL_SITE_INFO_BATCH", config.site_info_batch)?;
        config.site_info_staleness = Duration::from_secs(env_number(
            "VIGIL_SITE_INFO_STALENESS_SECS",
            config.site_info_staleness.as_secs(),
        )?);
        config.fanout_concurrency =
            env_number("VIGIL_FANOUT_CONCURRENCY", config.fanout_concurrency)?;

        if let Ok(runner_id) = std::env::var("VIGIL_RUNNER_ID") {
            config.runner_id = runner_id;
        }

        if config.execution_bias == 0 || config.execution_bias > 100 {
            return Err(ConfigError::InvalidValue {
                var: "VIGIL_EXECUTION_BIAS",
                value: config.execution_bias.to_string(),
            });
        }

        Ok(config)
    }
}

fn env_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

fn default_runner_id() -> String {
    format!("runner-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be used.
    #[error("Invalid value '{value}' for {var}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::with_database_url("sqlite::memory:");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.max_execution, Duration::from_secs(60));
        assert_eq!(config.execution_bias, 75);
        assert_eq!(config.resume_delay, Duration::from_secs(1));
        assert_eq!(config.stale_lock_after, Duration::from_secs(180));
        assert_eq!(config.site_info_batch, 10);
        assert!(config.runner_id.starts_with("runner-"));
    }

    #[test]
    fn test_runner_ids_differ() {
        let a = Config::with_database_url("x");
        let b = Config::with_database_url("x");
        assert_ne!(a.runner_id, b.runner_id);
    }
}
