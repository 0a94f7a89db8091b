// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site action log.

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use vigil_core::persistence::{NewReport, Persistence};

/// Report action of a core update.
pub const CORE_UPDATE: &str = "core.update";
/// Report action of an extension update.
pub const EXTENSION_UPDATE: &str = "extension.update";
/// Report action of a backup.
pub const BACKUP: &str = "backup";
/// Report action of a file integrity scan.
pub const FILE_SCAN: &str = "filescanner";

/// Append a report. A failed write is logged and swallowed so it never masks
/// the outcome being reported.
pub async fn record(persistence: &dyn Persistence, site_id: i64, action: &str, success: bool, context: Value) {
    let report = NewReport {
        site_id: Some(site_id),
        action: action.to_string(),
        success,
        context,
        created_at: Utc::now(),
    };
    if let Err(e) = persistence.insert_report(&report).await {
        warn!(site_id, action, error = %e, "Failed to write report");
    }
}
