// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent per-site requests joined once.
//!
//! A [`SiteContinuation`] describes one request per site plus what to do with
//! its answer. [`FanOut::run`] drives up to `concurrency` of them at a time and
//! returns when every site has either succeeded or failed. A failing site
//! never aborts the batch.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};
use vigil_core::persistence::SiteRecord;

use crate::error::RemoteError;

/// Per-site request with success and failure continuations.
#[async_trait]
pub trait SiteContinuation: Send + Sync {
    /// Value produced by a successful continuation.
    type Output: Send;

    /// Issue the request.
    async fn request(&self, site: &SiteRecord) -> Result<serde_json::Value, RemoteError>;

    /// Consume a successful response. Errors returned here are routed to
    /// [`on_failure`](Self::on_failure) like request errors.
    async fn on_success(
        &self,
        site: &SiteRecord,
        response: serde_json::Value,
    ) -> Result<Self::Output, RemoteError>;

    /// Record a failure. Must not fail itself.
    async fn on_failure(&self, site: &SiteRecord, error: &RemoteError);
}

/// Result for one site.
#[derive(Debug)]
pub enum SiteOutcome<T> {
    /// The request and its success continuation completed.
    Succeeded {
        /// Site id.
        site_id: i64,
        /// Continuation output.
        output: T,
    },
    /// The request or its success continuation failed.
    Failed {
        /// Site id.
        site_id: i64,
        /// What went wrong.
        error: RemoteError,
    },
}

impl<T> SiteOutcome<T> {
    /// Site this outcome belongs to.
    pub fn site_id(&self) -> i64 {
        match self {
            SiteOutcome::Succeeded { site_id, .. } | SiteOutcome::Failed { site_id, .. } => *site_id,
        }
    }

    /// Whether the site succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, SiteOutcome::Succeeded { .. })
    }
}

/// Bounded-concurrency driver.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    concurrency: usize,
}

impl FanOut {
    /// Driver running at most `concurrency` requests at once.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Run `handler` for every site and join. Outcomes come back in
    /// completion order.
    pub async fn run<H>(&self, sites: Vec<SiteRecord>, handler: &H) -> Vec<SiteOutcome<H::Output>>
    where
        H: SiteContinuation,
    {
        let total = sites.len();
        let outcomes: Vec<_> = stream::iter(sites)
            .map(|site| async move { Self::one(handler, site).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        debug!(total, failed, "Fan-out joined");
        outcomes
    }

    async fn one<H>(handler: &H, site: SiteRecord) -> SiteOutcome<H::Output>
    where
        H: SiteContinuation,
    {
        let result = match handler.request(&site).await {
            Ok(response) => handler.on_success(&site, response).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => SiteOutcome::Succeeded {
                site_id: site.id,
                output,
            },
            Err(error) => {
                warn!(site_id = site.id, error = %error, "Site request failed");
                handler.on_failure(&site, &error).await;
                SiteOutcome::Failed {
                    site_id: site.id,
                    error,
                }
            }
        }
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(10)
    }
}
