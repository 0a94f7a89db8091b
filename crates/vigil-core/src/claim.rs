// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site claim protocol.
//!
//! Overlapping invocations of the scheduler select disjoint batches of sites
//! by stamping a per-purpose "last attempt" timestamp inside each site's
//! config. Selection and stamping happen in one write-locked transaction, so
//! a second caller only ever sees stamped rows as fresh and skips them.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Which piece of work the sites are being claimed for. Each purpose owns one
/// last-attempt stamp in the site config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimPurpose {
    /// Core version refresh (`core.lastAttempt`).
    SiteInfo,
    /// Automatic core update decisions (`core.lastAutoUpdateAttempt`).
    CoreUpdates,
    /// Automatic extension update decisions (`extensions.lastAttempt`).
    ExtensionUpdates,
}

impl ClaimPurpose {
    /// Config path of the stamp.
    pub fn path(self) -> &'static [&'static str] {
        match self {
            ClaimPurpose::SiteInfo => &["core", "lastAttempt"],
            ClaimPurpose::CoreUpdates => &["core", "lastAutoUpdateAttempt"],
            ClaimPurpose::ExtensionUpdates => &["extensions", "lastAttempt"],
        }
    }

    /// SQLite JSON path of the stamp.
    pub fn sqlite_path(self) -> String {
        format!("$.{}", self.path().join("."))
    }

    /// PostgreSQL `#>>` path of the stamp.
    pub fn pg_path(self) -> String {
        format!("{{{}}}", self.path().join(","))
    }
}

/// Parameters of one claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// What the sites are claimed for.
    pub purpose: ClaimPurpose,
    /// Offset into the eligible set, for paginating large fleets.
    pub limit_start: i64,
    /// Maximum sites returned.
    pub limit: i64,
    /// Ignore staleness. Only operator-triggered runs set this; it may
    /// double-process sites.
    pub force: bool,
    /// Restrict to these site ids.
    pub only_ids: Option<Vec<i64>>,
    /// Minimum age of the stamp before a site is eligible again.
    pub staleness: Duration,
    /// Reference time; stamps are set to this.
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    /// Claim up to `limit` stale sites for `purpose`, starting from the first.
    pub fn new(purpose: ClaimPurpose, limit: i64, staleness: Duration) -> Self {
        Self {
            purpose,
            limit_start: 0,
            limit,
            force: false,
            only_ids: None,
            staleness,
            now: Utc::now(),
        }
    }

    /// Skip the first `limit_start` eligible sites.
    pub fn starting_at(mut self, limit_start: i64) -> Self {
        self.limit_start = limit_start;
        self
    }

    /// Bypass staleness.
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Restrict to specific sites.
    pub fn only(mut self, ids: Vec<i64>) -> Self {
        self.only_ids = Some(ids);
        self
    }

    /// Override the reference time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Stamps at or after this unix timestamp are fresh.
    pub fn cutoff_unix(&self) -> i64 {
        let staleness = chrono::Duration::from_std(self.staleness).unwrap_or(chrono::Duration::MAX);
        self.now
            .checked_sub_signed(staleness)
            .map(|t| t.timestamp())
            .unwrap_or(i64::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_paths() {
        assert_eq!(ClaimPurpose::SiteInfo.sqlite_path(), "$.core.lastAttempt");
        assert_eq!(ClaimPurpose::CoreUpdates.pg_path(), "{core,lastAutoUpdateAttempt}");
        assert_eq!(
            ClaimPurpose::ExtensionUpdates.path(),
            &["extensions", "lastAttempt"]
        );
    }

    #[test]
    fn test_cutoff() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 15, 0).unwrap();
        let request = ClaimRequest::new(ClaimPurpose::SiteInfo, 10, Duration::from_secs(900)).at(now);
        assert_eq!(request.cutoff_unix(), now.timestamp() - 900);
    }
}
