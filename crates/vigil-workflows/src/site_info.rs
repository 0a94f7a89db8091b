// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site information refresh.
//!
//! Claims stale sites in batches, asks each for its core version information
//! concurrently and saves the answer into the site config. The success
//! continuation chains two best-effort lookups (installed extensions and the
//! favicon); the failure continuation records the error on the site.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};
use vigil_core::persistence::{Persistence, SiteRecord, TaskRecord};
use vigil_core::site::update_site_config;
use vigil_core::{
    ClaimPurpose, CoreError, RetryConfig, SiteConfig, Status, Storage, TaskContext, TaskError,
    TaskHandler, TaskType,
};
use vigil_remote::{FanOut, RemoteError, SiteClient, SiteContinuation, SiteOutcome};

use crate::extensions::ExtensionInfo;
use crate::site_batch::SiteBatches;
use crate::version::is_newer;

/// Core version information as reported by a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    /// Installed version.
    pub current: String,
    /// Newest available version.
    pub latest: Option<String>,
    /// Whether the site can update to `latest`.
    pub can_upgrade: bool,
    /// PHP version of the server.
    pub php: Option<String>,
}

impl CoreInfo {
    /// Read the attributes of a `core/update` answer.
    pub fn from_attributes(attributes: &Value) -> Result<Self, RemoteError> {
        let current = attr_text(attributes, "current")
            .ok_or_else(|| RemoteError::Malformed("core information without a current version".into()))?;
        let latest = attr_text(attributes, "latest");
        let can_upgrade = attributes
            .get("canUpgrade")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| latest.as_deref().is_some_and(|l| is_newer(Some(&current), l)));
        let php = attr_text(attributes, "phpVersion").or_else(|| attr_text(attributes, "php"));

        Ok(Self {
            current,
            latest,
            can_upgrade,
            php,
        })
    }

    /// Write into a site config, clearing any previous error.
    pub fn apply(&self, config: &mut SiteConfig) {
        config.set(&["core", "current", "version"], self.current.as_str());
        if let Some(latest) = &self.latest {
            config.set(&["core", "latest", "version"], latest.as_str());
        }
        config.set(&["core", "canUpgrade"], self.can_upgrade);
        if let Some(php) = &self.php {
            config.set(&["core", "php"], php.as_str());
        }
        config.remove(&["core", "lastErrorMessage"]);
    }
}

/// Non-empty string (or number) attribute.
pub(crate) fn attr_text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Save core information with the optimistic config update.
pub async fn save_core_info(
    persistence: &dyn Persistence,
    site_id: i64,
    info: &CoreInfo,
) -> Result<SiteConfig, CoreError> {
    update_site_config(persistence, site_id, &RetryConfig::config_save(), |config| {
        info.apply(config)
    })
    .await
}

/// Look for `/favicon.ico`. Any failure means no favicon.
pub async fn find_favicon(client: &SiteClient) -> Option<String> {
    let url = client.site_url("favicon.ico");
    match client.http().get(&url).send().await {
        Ok(response) if response.status().is_success() => Some(url),
        Ok(response) => {
            debug!(site_id = client.site_id(), status = response.status().as_u16(), "No favicon");
            None
        }
        Err(e) => {
            debug!(site_id = client.site_id(), error = %e, "Favicon lookup failed");
            None
        }
    }
}

/// Fan-out continuation refreshing one site.
#[derive(Clone)]
pub struct SiteInfoRefresh {
    http: Client,
    persistence: Arc<dyn Persistence>,
}

impl SiteInfoRefresh {
    /// Continuation saving through `persistence`.
    pub fn new(http: Client, persistence: Arc<dyn Persistence>) -> Self {
        Self { http, persistence }
    }
}

#[async_trait]
impl SiteContinuation for SiteInfoRefresh {
    type Output = CoreInfo;

    async fn request(&self, site: &SiteRecord) -> Result<Value, RemoteError> {
        SiteClient::new(self.http.clone(), site)?.get("core/update").await
    }

    async fn on_success(&self, site: &SiteRecord, response: Value) -> Result<CoreInfo, RemoteError> {
        let info = CoreInfo::from_attributes(&response)?;
        let client = SiteClient::new(self.http.clone(), site)?;

        let extensions = match client.get("extensions").await {
            Ok(list) => Some(ExtensionInfo::list_to_value(&ExtensionInfo::list_from_value(&list))),
            Err(e) => {
                debug!(site_id = site.id, error = %e, "Extension list unavailable");
                None
            }
        };
        let favicon = find_favicon(&client).await;

        update_site_config(self.persistence.as_ref(), site.id, &RetryConfig::config_save(), |config| {
            info.apply(config);
            if let Some(list) = &extensions {
                config.set(&["extensions", "list"], list.clone());
            }
            if let Some(favicon) = &favicon {
                config.set(&["core", "favicon"], favicon.as_str());
            }
        })
        .await?;

        debug!(site_id = site.id, current = %info.current, latest = ?info.latest, "Site info saved");
        Ok(info)
    }

    async fn on_failure(&self, site: &SiteRecord, error: &RemoteError) {
        let message = error.to_string();
        let saved = update_site_config(self.persistence.as_ref(), site.id, &RetryConfig::config_save(), |config| {
            config.set(&["core", "lastErrorMessage"], message.as_str())
        })
        .await;
        if let Err(e) = saved {
            warn!(site_id = site.id, error = %e, "Could not record site error");
        }
    }
}

/// `refreshsiteinfo` task.
pub struct RefreshSiteInfoTask {
    http: Client,
}

impl RefreshSiteInfoTask {
    /// Handler using `http` for all site requests.
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TaskHandler for RefreshSiteInfoTask {
    fn task_type(&self) -> TaskType {
        TaskType::RefreshSiteInfo
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let params = task.params()?;
        let batches = SiteBatches::new(
            ClaimPurpose::SiteInfo,
            ctx.config.site_info_batch,
            ctx.config.site_info_staleness,
        );
        let fanout = FanOut::new(ctx.config.fanout_concurrency);
        let refresh = SiteInfoRefresh::new(self.http.clone(), ctx.persistence.clone());

        loop {
            if ctx.timer.is_expired() {
                return Ok(Status::WillResume);
            }

            let Some(sites) = batches.next(ctx, &params, storage).await? else {
                batches.reset(storage);
                return Ok(Status::Ok);
            };

            let outcomes = fanout.run(sites, &refresh).await;
            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            let updatable = outcomes
                .iter()
                .filter(|o| matches!(o, SiteOutcome::Succeeded { output, .. } if output.can_upgrade))
                .count();
            info!(
                task_id = task.id,
                refreshed = outcomes.len() - failed,
                failed,
                updatable,
                "Site info batch refreshed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_core_info_from_attributes() {
        let info = CoreInfo::from_attributes(&json!({
            "current": "4.0.2",
            "latest": "4.0.4",
            "phpVersion": "8.1.27"
        }))
        .unwrap();
        assert!(info.can_upgrade);
        assert_eq!(info.php.as_deref(), Some("8.1.27"));

        let explicit = CoreInfo::from_attributes(&json!({
            "current": "4.0.2",
            "latest": "4.0.4",
            "canUpgrade": false
        }))
        .unwrap();
        assert!(!explicit.can_upgrade);

        assert!(CoreInfo::from_attributes(&json!({"latest": "1.0"})).is_err());
    }

    #[test]
    fn test_apply_clears_error() {
        let mut config = SiteConfig::from_value(json!({"core": {"lastErrorMessage": "timeout"}}));
        CoreInfo {
            current: "6.4.1".into(),
            latest: Some("6.5.0".into()),
            can_upgrade: true,
            php: None,
        }
        .apply(&mut config);

        assert_eq!(config.current_version().as_deref(), Some("6.4.1"));
        assert_eq!(config.latest_version().as_deref(), Some("6.5.0"));
        assert!(config.can_upgrade());
        assert!(config.pointer(&["core", "lastErrorMessage"]).is_none());
    }
}
