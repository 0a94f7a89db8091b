// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote file integrity scan.
//!
//! The scanner engine lives on the site. `filescanner/start` opens a session
//! and `filescanner/step` advances it; the session id and counters are kept in
//! the `scan` storage sub-document so a scan spans as many invocations as the
//! site needs.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};
use vigil_core::persistence::TaskRecord;
use vigil_core::{
    MailTemplate, RecipientRule, Status, Storage, TaskContext, TaskError, TaskHandler, TaskType,
};
use vigil_remote::{RemoteError, SiteClient};

use crate::report;
use crate::site_info::attr_text;

/// `scan` sub-document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Scanner session on the site.
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub steps: u32,
    /// Files examined so far.
    #[serde(default)]
    pub files: i64,
    /// Suspicious files found so far.
    #[serde(default)]
    pub suspicious: i64,
    #[serde(default)]
    pub done: bool,
}

impl ScanProgress {
    fn absorb(&mut self, answer: &Value) -> Result<(), TaskError> {
        if answer.get("status").and_then(Value::as_bool) == Some(false) {
            let message = attr_text(answer, "error").unwrap_or_else(|| "scanner reported failure".to_string());
            return Err(TaskError::transient(format!("File scan failed: {message}")));
        }
        if let Some(session) = attr_text(answer, "session") {
            if let Some(known) = &self.session
                && *known != session
            {
                return Err(TaskError::integrity(format!("Scan session changed from {known} to {session}")));
            }
            self.session = Some(session);
        }
        if self.session.is_none() {
            return Err(RemoteError::Malformed("scan started without a session".into()).into());
        }

        self.steps += 1;
        self.files = answer.get("files").and_then(Value::as_i64).unwrap_or(self.files);
        self.suspicious = answer.get("suspicious").and_then(Value::as_i64).unwrap_or(self.suspicious);
        self.done = answer.get("done").and_then(Value::as_bool).unwrap_or(false);
        Ok(())
    }
}

/// `filescanner` task.
pub struct FileScannerTask {
    http: Client,
}

impl FileScannerTask {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TaskHandler for FileScannerTask {
    fn task_type(&self) -> TaskType {
        TaskType::FileScanner
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let site_id = task
            .site_id
            .ok_or_else(|| TaskError::logic("file scanner task has no site"))?;
        let Some(site) = ctx.persistence.get_site(site_id).await? else {
            return Err(TaskError::expected_stop(format!("site {site_id} no longer exists")));
        };
        let client = SiteClient::new(self.http.clone(), &site)?;
        let mut scan: ScanProgress = storage.get("scan").unwrap_or_default();

        while !scan.done {
            if ctx.timer.is_expired() {
                return Ok(Status::WillResume);
            }
            let answer = match &scan.session {
                None => client.post("filescanner/start", &[]).await?,
                Some(session) => client.post("filescanner/step", &[("session", session.clone())]).await?,
            };
            scan.absorb(&answer)?;
            storage.set("scan", &scan)?;
            debug!(site_id, steps = scan.steps, files = scan.files, done = scan.done, "Scan stepped");
        }

        info!(site_id, files = scan.files, suspicious = scan.suspicious, "File scan finished");
        let context = json!({
            "session": scan.session,
            "files": scan.files,
            "suspicious": scan.suspicious,
            "steps": scan.steps,
        });
        report::record(ctx.persistence.as_ref(), site_id, report::FILE_SCAN, true, context).await;

        let params = task.params()?;
        let mut vars = Map::new();
        vars.insert("site_name".into(), json!(site.name));
        vars.insert("site_url".into(), json!(site.url));
        vars.insert("files".into(), json!(scan.files));
        vars.insert("suspicious".into(), json!(scan.suspicious));
        ctx.notifier
            .enqueue_email(
                MailTemplate::ScanFinished,
                Some(site_id),
                vars,
                RecipientRule::site_admins().with_user(params.initiating_user()),
            )
            .await?;

        // Next run starts a fresh scan.
        storage.remove("scan");
        Ok(Status::Ok)
    }
}
