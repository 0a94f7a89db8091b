// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Automatic extension updates.
//!
//! The director walks claimed sites, compares every known extension against
//! the site's update preference and pushes one item per extension onto the
//! site's `extensions.<site_id>` queue. The per-site consumer pops those items
//! one at a time, installs each update remotely and re-reads the extension
//! list to confirm.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use vigil_core::persistence::{SiteRecord, TaskRecord};
use vigil_core::site::update_site_config;
use vigil_core::{
    ClaimPurpose, CoreUpdatePreference, MailTemplate, NewTask, Queue, QueueType, RecipientRule,
    RetryConfig, SiteConfig, Status, Storage, TaskContext, TaskError, TaskHandler, TaskType, When,
};
use vigil_remote::SiteClient;

use crate::report;
use crate::site_batch::SiteBatches;
use crate::version::{auto_update_allowed, is_newer};

/// One installed extension, as kept in `extensions.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Extension id on the site.
    pub id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Installed and available versions.
    #[serde(default)]
    pub version: ExtensionVersion,
}

/// Installed and available versions of an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionVersion {
    /// Installed.
    #[serde(default)]
    pub current: Option<String>,
    /// Available update, if any.
    #[serde(default)]
    pub new: Option<String>,
}

impl ExtensionInfo {
    /// Whether a newer version is available.
    pub fn has_update(&self) -> bool {
        self.version
            .new
            .as_deref()
            .is_some_and(|new| is_newer(self.version.current.as_deref(), new))
    }

    /// Parse a list, skipping entries that do not look like extensions.
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize a list for the site config.
    pub fn list_to_value(list: &[Self]) -> Value {
        Value::Array(list.iter().filter_map(|e| serde_json::to_value(e).ok()).collect())
    }

    /// The list stored in a site config.
    pub fn from_config(config: &SiteConfig) -> Vec<Self> {
        config
            .pointer(&["extensions", "list"])
            .map(Self::list_from_value)
            .unwrap_or_default()
    }
}

/// Queued extension update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionUpdateItem {
    /// Extension id on the site.
    pub extension_id: i64,
    /// Display name, for reports and mail.
    pub name: String,
    /// Version installed when queued.
    pub from: Option<String>,
    /// Version to install.
    pub to: String,
    /// User who asked for the update.
    #[serde(default)]
    pub initiating_user: Option<i64>,
}

/// Queue eligible extension updates of one site. Returns how many items were
/// added; extensions already pending are skipped.
pub async fn enqueue_site_updates(
    ctx: &TaskContext,
    site: &SiteRecord,
    initiating_user: Option<i64>,
) -> Result<usize, TaskError> {
    let config = site.site_config()?;
    let preference = config.extension_update_install();
    if matches!(preference, CoreUpdatePreference::None | CoreUpdatePreference::Email) {
        return Ok(0);
    }

    let queue = Queue::new(ctx.persistence.clone(), QueueType::Extensions(site.id));
    let mut queued = 0;

    for extension in ExtensionInfo::from_config(&config) {
        let Some(target) = extension.version.new.clone() else {
            continue;
        };
        if !extension.has_update()
            || !auto_update_allowed(preference, extension.version.current.as_deref(), &target)
        {
            continue;
        }

        let pending = queue
            .count_matching(|item: &ExtensionUpdateItem| item.extension_id == extension.id)
            .await?;
        if pending > 0 {
            debug!(site_id = site.id, extension_id = extension.id, "Extension update already queued");
            continue;
        }

        let item = ExtensionUpdateItem {
            extension_id: extension.id,
            name: extension.name.clone(),
            from: extension.version.current.clone(),
            to: target,
            initiating_user,
        };
        queue.push(&item, When::Now).await?;
        queued += 1;
    }

    if queued > 0 || queue.count().await? > 0 {
        let now = Utc::now();
        let consumer = NewTask::one_off(TaskType::ExtensionsUpdate).site(site.id).due_at(now);
        match ctx.persistence.rearm_site_task(&consumer, now).await? {
            Some(task_id) => debug!(site_id = site.id, task_id, "Extension update task armed"),
            None => debug!(site_id = site.id, "Extension update task already running"),
        }
    }

    Ok(queued)
}

/// `extensionupdatesdirector` task.
#[derive(Debug, Default)]
pub struct ExtensionUpdatesDirectorTask;

#[async_trait]
impl TaskHandler for ExtensionUpdatesDirectorTask {
    fn task_type(&self) -> TaskType {
        TaskType::ExtensionUpdatesDirector
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let params = task.params()?;
        let batches = SiteBatches::new(
            ClaimPurpose::ExtensionUpdates,
            ctx.config.site_info_batch,
            ctx.config.site_info_staleness,
        );

        loop {
            if ctx.timer.is_expired() {
                return Ok(Status::WillResume);
            }

            let Some(sites) = batches.next(ctx, &params, storage).await? else {
                batches.reset(storage);
                return Ok(Status::Ok);
            };

            for site in sites {
                let queued = enqueue_site_updates(ctx, &site, params.initiating_user()).await?;
                if queued > 0 {
                    info!(site_id = site.id, queued, "Queued extension updates");
                }
            }
        }
    }
}

/// `extensionsupdate` task: installs queued updates for one site.
pub struct ExtensionsUpdateTask {
    http: Client,
}

impl ExtensionsUpdateTask {
    /// Handler using `http` for site requests.
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn install(&self, client: &SiteClient, item: &ExtensionUpdateItem) -> Result<Vec<ExtensionInfo>, TaskError> {
        let answer = client
            .post("extensions/install", &[("id", item.extension_id.to_string())])
            .await?;
        if answer.get("status").and_then(Value::as_bool) == Some(false) {
            let message = answer
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("installer reported failure");
            return Err(TaskError::transient(message.to_string()));
        }

        let list = ExtensionInfo::list_from_value(&client.get("extensions").await?);
        let installed = list
            .iter()
            .find(|e| e.id == item.extension_id)
            .and_then(|e| e.version.current.clone());
        if installed.as_deref() != Some(item.to.as_str()) {
            return Err(TaskError::transient(format!(
                "{} is at {} after installing {}",
                item.name,
                installed.as_deref().unwrap_or("unknown"),
                item.to
            )));
        }
        Ok(list)
    }
}

#[async_trait]
impl TaskHandler for ExtensionsUpdateTask {
    fn task_type(&self) -> TaskType {
        TaskType::ExtensionsUpdate
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        _storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let site_id = task
            .site_id
            .ok_or_else(|| TaskError::logic("extension update task has no site"))?;
        let Some(site) = ctx.persistence.get_site(site_id).await? else {
            return Err(TaskError::expected_stop(format!("site {site_id} no longer exists")));
        };
        let client = SiteClient::new(self.http.clone(), &site)?;
        let config = site.site_config()?;
        let queue = Queue::new(ctx.persistence.clone(), QueueType::Extensions(site_id));

        loop {
            if ctx.timer.is_expired() {
                return Ok(Status::WillResume);
            }
            let Some(item) = queue.pop::<ExtensionUpdateItem>().await? else {
                return Ok(Status::Ok);
            };

            let mut vars = Map::new();
            vars.insert("site_name".into(), json!(site.name));
            vars.insert("site_url".into(), json!(site.url));
            vars.insert("extension".into(), json!(item.name));
            vars.insert("old_version".into(), json!(item.from));
            vars.insert("new_version".into(), json!(item.to));
            let recipients = RecipientRule::site_admins().with_user(item.initiating_user);

            match self.install(&client, &item).await {
                Ok(list) => {
                    info!(site_id, extension_id = item.extension_id, version = %item.to, "Extension updated");
                    let list = ExtensionInfo::list_to_value(&list);
                    update_site_config(ctx.persistence.as_ref(), site_id, &RetryConfig::config_save(), |c| {
                        c.set(&["extensions", "list"], list.clone())
                    })
                    .await?;
                    report::record(ctx.persistence.as_ref(), site_id, report::EXTENSION_UPDATE, true, Value::Object(vars.clone())).await;
                    if config.email_after_update() {
                        ctx.notifier
                            .enqueue_email(MailTemplate::ExtensionUpdateInstalled, Some(site_id), vars, recipients)
                            .await?;
                    }
                }
                Err(error) => {
                    warn!(site_id, extension_id = item.extension_id, error = %error, "Extension update failed");
                    vars.insert("error".into(), json!(error.message));
                    report::record(ctx.persistence.as_ref(), site_id, report::EXTENSION_UPDATE, false, Value::Object(vars.clone())).await;
                    if config.email_on_error() {
                        ctx.notifier
                            .enqueue_email(MailTemplate::ExtensionUpdateFailed, Some(site_id), vars, recipients)
                            .await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_list_parsing() {
        let value = json!([
            {"id": 1, "name": "Akeeba Backup", "version": {"current": "9.0.1", "new": "9.0.2"}},
            {"id": 2, "name": "Up to date", "version": {"current": "1.0.0"}},
            {"name": "no id"}
        ]);
        let list = ExtensionInfo::list_from_value(&value);

        assert_eq!(list.len(), 2);
        assert!(list[0].has_update());
        assert!(!list[1].has_update());
        assert_eq!(ExtensionInfo::list_from_value(&ExtensionInfo::list_to_value(&list)), list);
    }
}
