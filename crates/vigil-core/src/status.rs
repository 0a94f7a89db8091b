// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task outcome codes.
//!
//! Every handler invocation ends in one of these. The integer code is what
//! gets persisted in `tasks.last_exit_code`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of outcomes for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Scheduled but never run.
    InitialSchedule,
    /// Finished successfully.
    Ok,
    /// Failed fatally; needs an operator or a director pass to re-arm.
    KnockedOut,
    /// No handler is registered for the task type.
    NoRoutine,
    /// Ran out of budget or needs another round trip; call again with the
    /// stored continuation state.
    WillResume,
    /// Was found running past its lock window and was reset.
    Timeout,
    /// Currently held by a runner.
    Running,
}

impl Status {
    /// All statuses, in code order.
    pub const ALL: [Status; 7] = [
        Status::InitialSchedule,
        Status::Ok,
        Status::KnockedOut,
        Status::NoRoutine,
        Status::WillResume,
        Status::Timeout,
        Status::Running,
    ];

    /// Persisted integer code.
    pub fn code(self) -> i32 {
        match self {
            Status::InitialSchedule => -1,
            Status::Ok => 0,
            Status::KnockedOut => 1,
            Status::NoRoutine => 2,
            Status::WillResume => 8,
            Status::Timeout => 9,
            Status::Running => 11,
        }
    }

    /// Map a persisted code back to a status.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Fatal outcomes stop the task until something re-arms it.
    pub fn is_fatal(self) -> bool {
        matches!(self, Status::KnockedOut | Status::NoRoutine)
    }

    /// Upper-case name as used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::InitialSchedule => "INITIAL_SCHEDULE",
            Status::Ok => "OK",
            Status::KnockedOut => "KNOCKED_OUT",
            Status::NoRoutine => "NO_ROUTINE",
            Status::WillResume => "WILL_RESUME",
            Status::Timeout => "TIMEOUT",
            Status::Running => "RUNNING",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
