// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry and backoff settings shared by save-with-retry and queue re-pushes.

use std::time::Duration;

/// Determines how delay between retry attempts is calculated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Exponential backoff: delay * 2^(attempt-1)
    #[default]
    ExponentialBackoff,
    /// Linear backoff: delay * attempt
    Linear,
}

/// Retry budget with a backoff curve.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just one attempt).
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub delay_ms: u64,
    /// Retry strategy for calculating delays.
    pub strategy: RetryStrategy,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32, delay_ms: u64, strategy: RetryStrategy) -> Self {
        Self {
            max_retries,
            delay_ms,
            strategy,
        }
    }

    /// Settings for optimistic site config writes: a handful of quick tries
    /// with growing sleeps.
    pub fn config_save() -> Self {
        Self::new(5, 50, RetryStrategy::ExponentialBackoff)
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            RetryStrategy::ExponentialBackoff => 2u64.saturating_pow(attempt.saturating_sub(1)),
            RetryStrategy::Linear => attempt.max(1) as u64,
        };
        Duration::from_millis(self.delay_ms.saturating_mul(multiplier))
    }

    /// Whether another attempt is allowed after `attempts_made` retries.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 1000,
            strategy: RetryStrategy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.delay_ms, 1000);
        assert_eq!(config.strategy, RetryStrategy::ExponentialBackoff);
        assert!(!config.allows(0));
    }

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig::new(3, 100, RetryStrategy::ExponentialBackoff);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_delays() {
        let config = RetryConfig::new(3, 100, RetryStrategy::Linear);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_allows_counts_retries() {
        let config = RetryConfig::new(2, 10, RetryStrategy::Linear);
        assert!(config.allows(0));
        assert!(config.allows(1));
        assert!(!config.allows(2));
    }
}
