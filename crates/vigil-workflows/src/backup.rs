// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable remote backups.
//!
//! A backup is started once and then stepped until the site reports it done.
//! Progress lives in a storage document, so the same routine serves the
//! standalone `akeebabackup` task and the `backup` state of the update
//! workflows, which hands it its own `backup` sub-document.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use vigil_core::persistence::TaskRecord;
use vigil_core::{
    MailTemplate, RecipientRule, SiteConfig, Status, Storage, TaskContext, TaskError, TaskHandler,
    TaskType, Timer,
};
use vigil_remote::{RemoteError, SiteClient};

use crate::report;

const DEFAULT_PROFILE: i64 = 1;

/// Backup progress kept in storage between invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    /// Identifier the site assigned when the backup started.
    #[serde(default)]
    pub backup_id: Option<String>,
    /// Backup record id on the site.
    #[serde(default)]
    pub record_id: Option<i64>,
    /// Steps taken so far.
    #[serde(default)]
    pub steps: u32,
    /// Percentage reported by the site.
    #[serde(default)]
    pub progress: f64,
    /// Whether the site reported completion.
    #[serde(default)]
    pub done: bool,
}

/// What one start or step call returned.
#[derive(Debug, Clone, PartialEq)]
struct BackupStep {
    backup_id: Option<String>,
    record_id: Option<i64>,
    progress: f64,
    done: bool,
}

impl BackupStep {
    fn from_attributes(attributes: &Value) -> Result<Self, TaskError> {
        if attributes.get("status").and_then(Value::as_bool) == Some(false) {
            let message = attributes
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("backup engine reported failure");
            return Err(TaskError::transient(format!("Backup failed: {message}")));
        }

        Ok(Self {
            backup_id: attributes
                .get("backupid")
                .and_then(Value::as_str)
                .map(str::to_string),
            record_id: attributes.get("id").and_then(Value::as_i64),
            progress: attributes.get("progress").and_then(Value::as_f64).unwrap_or(0.0),
            done: attributes.get("done").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Backup profile for a site: task parameter first, then
/// `config.backupProfile`, then the default profile.
pub fn backup_profile(config: &SiteConfig, override_profile: Option<i64>) -> i64 {
    override_profile
        .or_else(|| config.get_f64(&["config", "backupProfile"]).map(|p| p as i64))
        .unwrap_or(DEFAULT_PROFILE)
}

/// Advance a backup until it finishes or `timer` runs out.
///
/// Returns [`Status::Ok`] once the site reports completion and
/// [`Status::WillResume`] when out of time. A backup id that differs from the
/// one recorded at start is an integrity error.
pub async fn run_backup(
    client: &SiteClient,
    storage: &mut Storage,
    timer: &Timer,
    profile: i64,
    description: &str,
) -> Result<Status, TaskError> {
    let mut state: BackupProgress = storage.load()?;

    loop {
        if state.done {
            return Ok(Status::Ok);
        }
        if timer.is_expired() {
            return Ok(Status::WillResume);
        }

        let answer = match &state.backup_id {
            None => {
                client
                    .post(
                        "akeebabackup/backup",
                        &[("profile", profile.to_string()), ("description", description.to_string())],
                    )
                    .await?
            }
            Some(backup_id) => {
                client
                    .post("akeebabackup/step", &[("backupid", backup_id.clone())])
                    .await?
            }
        };
        let step = BackupStep::from_attributes(&answer)?;

        if let (Some(expected), Some(reported)) = (&state.backup_id, &step.backup_id)
            && expected != reported
        {
            return Err(TaskError::integrity(format!(
                "Backup id changed from {expected} to {reported} mid-run"
            )));
        }
        if state.backup_id.is_none() {
            let started = step
                .backup_id
                .clone()
                .ok_or_else(|| RemoteError::Malformed("backup started without a backup id".into()))?;
            state.backup_id = Some(started);
        }

        state.record_id = step.record_id.or(state.record_id);
        state.progress = step.progress;
        state.done = step.done;
        state.steps += 1;
        storage.store(&state)?;

        debug!(
            site_id = client.site_id(),
            backup_id = ?state.backup_id,
            steps = state.steps,
            progress = state.progress,
            done = state.done,
            "Backup stepped"
        );
    }
}

/// `akeebabackup` task.
pub struct AkeebaBackupTask {
    http: Client,
}

impl AkeebaBackupTask {
    /// Handler using `http` for site requests.
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TaskHandler for AkeebaBackupTask {
    fn task_type(&self) -> TaskType {
        TaskType::AkeebaBackup
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let site_id = task
            .site_id
            .ok_or_else(|| TaskError::logic("backup task has no site"))?;
        let Some(site) = ctx.persistence.get_site(site_id).await? else {
            return Err(TaskError::expected_stop(format!("site {site_id} no longer exists")));
        };
        let params = task.params()?;
        let config = site.site_config()?;
        let profile = backup_profile(&config, params.get_i64("profile_id"));
        let description = params
            .get_str("description")
            .unwrap_or_else(|| "Scheduled backup".to_string());

        let result = match SiteClient::new(self.http.clone(), &site) {
            Ok(client) => run_backup(&client, storage, &ctx.timer, profile, &description).await,
            Err(e) => Err(e.into()),
        };

        let progress: BackupProgress = storage.load().unwrap_or_default();
        let mut context = Map::new();
        context.insert("profile".into(), json!(profile));
        context.insert("backup_id".into(), json!(progress.backup_id));
        context.insert("steps".into(), json!(progress.steps));

        match result {
            Ok(Status::Ok) => {
                info!(site_id, backup_id = ?progress.backup_id, steps = progress.steps, "Backup finished");
                report::record(ctx.persistence.as_ref(), site_id, report::BACKUP, true, Value::Object(context)).await;
                Ok(Status::Ok)
            }
            Ok(status) => Ok(status),
            Err(error) => {
                context.insert("error".into(), json!(error.message));
                report::record(ctx.persistence.as_ref(), site_id, report::BACKUP, false, Value::Object(context.clone())).await;
                if error.is_notifying() && config.email_on_error() {
                    context.insert("site_name".into(), json!(site.name));
                    context.insert("site_url".into(), json!(site.url));
                    ctx.notifier
                        .enqueue_email(
                            MailTemplate::BackupFailed,
                            Some(site_id),
                            context,
                            RecipientRule::site_admins().with_user(params.initiating_user()),
                        )
                        .await?;
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_parsing() {
        let step = BackupStep::from_attributes(&json!({
            "status": true, "backupid": "id-42", "id": 7, "progress": 55.5, "done": false
        }))
        .unwrap();
        assert_eq!(step.backup_id.as_deref(), Some("id-42"));
        assert_eq!(step.record_id, Some(7));
        assert!(!step.done);

        let failed = BackupStep::from_attributes(&json!({"status": false, "error": "disk full"})).unwrap_err();
        assert!(failed.message.contains("disk full"));
    }

    #[test]
    fn test_backup_profile() {
        let config = SiteConfig::from_value(json!({"config": {"backupProfile": 3}}));
        assert_eq!(backup_profile(&config, None), 3);
        assert_eq!(backup_profile(&config, Some(5)), 5);
        assert_eq!(backup_profile(&SiteConfig::default(), None), DEFAULT_PROFILE);
    }
}
