// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Errors shared by the fire-and-forget delivery consumers.

use std::time::Duration;

use thiserror::Error;

/// Delay before a failed delivery is retried.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Why a single delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The destination no longer exists. Retrying is pointless.
    #[error("destination gone: {0}")]
    Gone(String),

    /// Anything else; worth another attempt.
    #[error("delivery failed: {0}")]
    Failed(String),
}
