// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batched site selection for fleet-wide tasks.
//!
//! Normal runs re-claim from offset zero: claimed sites are stamped and drop
//! out of the eligible set, so the next claim returns the next batch. Forced
//! runs ignore stamps, so they page through the fleet with `limit_start`
//! kept in task storage under `offset`.

use std::time::Duration;

use tracing::debug;
use vigil_core::persistence::SiteRecord;
use vigil_core::{ClaimPurpose, ClaimRequest, Storage, TaskContext, TaskError, TaskParams};

const OFFSET_KEY: &str = "offset";

/// Claims successive batches of sites for one purpose.
#[derive(Debug, Clone)]
pub struct SiteBatches {
    purpose: ClaimPurpose,
    batch: i64,
    staleness: Duration,
}

impl SiteBatches {
    /// Batches of `batch` sites not attempted for `staleness`.
    pub fn new(purpose: ClaimPurpose, batch: i64, staleness: Duration) -> Self {
        Self {
            purpose,
            batch: batch.max(1),
            staleness,
        }
    }

    /// Claim the next batch and load the enabled sites in it. `None` means
    /// nothing was left to claim.
    pub async fn next(
        &self,
        ctx: &TaskContext,
        params: &TaskParams,
        storage: &mut Storage,
    ) -> Result<Option<Vec<SiteRecord>>, TaskError> {
        let force = params.force();
        let offset: i64 = if force { storage.get(OFFSET_KEY).unwrap_or(0) } else { 0 };

        let mut request = ClaimRequest::new(self.purpose, self.batch, self.staleness)
            .starting_at(offset)
            .forced(force);
        if let Some(ids) = only_site_ids(params) {
            request = request.only(ids);
        }

        let ids = ctx.persistence.claim_sites(&request).await?;
        if force {
            storage.set(OFFSET_KEY, offset + ids.len() as i64)?;
        }
        debug!(purpose = ?self.purpose, offset, claimed = ids.len(), "Claimed site batch");
        if ids.is_empty() {
            return Ok(None);
        }

        let mut sites = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(site) = ctx.persistence.get_site(id).await?
                && site.enabled
            {
                sites.push(site);
            }
        }
        Ok(Some(sites))
    }

    /// Forget the paging offset once the fleet is exhausted, so the next
    /// forced run starts from the beginning.
    pub fn reset(&self, storage: &mut Storage) {
        storage.remove(OFFSET_KEY);
    }
}

/// Optional `site_ids` array restricting a fleet task to some sites.
fn only_site_ids(params: &TaskParams) -> Option<Vec<i64>> {
    let ids: Vec<i64> = params
        .get("site_ids")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_i64())
        .collect();
    (!ids.is_empty()).then_some(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_only_site_ids() {
        let params = TaskParams::new().with("site_ids", json!([3, 5, "x"]));
        assert_eq!(only_site_ids(&params), Some(vec![3, 5]));
        assert_eq!(only_site_ids(&TaskParams::new()), None);
        assert_eq!(only_site_ids(&TaskParams::new().with("site_ids", json!([]))), None);
    }
}
