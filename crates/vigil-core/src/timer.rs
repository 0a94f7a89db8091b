// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution budget tracking for a single invocation.
//!
//! The process running tasks is started by an external trigger and must exit
//! before its host kills it. A [`Timer`] is created once per invocation with
//! the configured maximum execution time and a bias: the percentage of that
//! time work is allowed to use. Loop-style handlers poll it between round
//! trips and return [`Status::WillResume`](crate::status::Status::WillResume)
//! once it expires.
//!
//! The timer is advisory. It never interrupts in-flight work.

use std::time::{Duration, Instant};

/// Lowest accepted bias, in percent.
const MIN_BIAS: u8 = 10;
/// Highest accepted bias, in percent.
const MAX_BIAS: u8 = 100;

/// Tracks elapsed and remaining time against a biased budget.
#[derive(Debug, Clone)]
pub struct Timer {
    started: Instant,
    budget: Duration,
}

impl Timer {
    /// Create a timer for `max_execution`, of which only `bias_percent` percent
    /// is usable. The bias is clamped to 10..=100.
    pub fn new(max_execution: Duration, bias_percent: u8) -> Self {
        let bias = bias_percent.clamp(MIN_BIAS, MAX_BIAS) as u32;
        Self {
            started: Instant::now(),
            budget: max_execution * bias / 100,
        }
    }

    /// A timer that never expires within any realistic run. Used by tests and
    /// operator-triggered runs without a host time limit.
    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            budget: Duration::from_secs(u32::MAX as u64),
        }
    }

    /// The usable budget after applying the bias.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time spent since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Remaining usable time, zero once expired.
    pub fn time_left(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Whether the usable budget is spent.
    pub fn is_expired(&self) -> bool {
        self.time_left().is_zero()
    }

    /// Restart the budget from now.
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }
}
