// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Joomla core update workflow.
//!
//! ```text
//! init → beforeEvents → backup → download → enable → extract → postExtract
//!      → finalise → reloadUpdates → siteInfo → afterEvents → email → finish
//! ```
//!
//! Extraction talks to one of two scripts under
//! `administrator/components/com_joomlaupdate/`. Sites at 4.0.3 or older ship
//! `restore.php`, which takes AES-CTR encrypted JSON in a `json` form field
//! and answers with an encrypted document between `###` markers. Newer sites
//! ship `extract.php`, which takes a plain form with the shared password.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use vigil_core::persistence::TaskRecord;
use vigil_core::{Status, Storage, TaskContext, TaskError, TaskHandler, TaskType};
use vigil_remote::legacy_cipher::unwrap_marked;
use vigil_remote::{LegacyCipher, RemoteError};

use crate::fsm::{
    CommonStep, DownloadMode, ExtractDialect, ExtractPhase, RestoreProgress, RunContext,
    StepOutcome, UpdateRun, UpdateWorkflow, WorkflowHook, WorkflowState, drive,
};
use crate::site_info::attr_text;
use crate::version::uses_legacy_extractor;

/// Legacy extraction script, relative to the site root.
pub const LEGACY_SCRIPT: &str = "administrator/components/com_joomlaupdate/restore.php";
/// Modern extraction script, relative to the site root.
pub const MODERN_SCRIPT: &str = "administrator/components/com_joomlaupdate/extract.php";

/// States of the Joomla update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JoomlaState {
    Init,
    BeforeEvents,
    Backup,
    Download,
    Enable,
    Extract,
    PostExtract,
    Finalise,
    ReloadUpdates,
    SiteInfo,
    AfterEvents,
    Email,
    Finish,
}

impl JoomlaState {
    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            JoomlaState::Init => "init",
            JoomlaState::BeforeEvents => "beforeEvents",
            JoomlaState::Backup => "backup",
            JoomlaState::Download => "download",
            JoomlaState::Enable => "enable",
            JoomlaState::Extract => "extract",
            JoomlaState::PostExtract => "postExtract",
            JoomlaState::Finalise => "finalise",
            JoomlaState::ReloadUpdates => "reloadUpdates",
            JoomlaState::SiteInfo => "siteInfo",
            JoomlaState::AfterEvents => "afterEvents",
            JoomlaState::Email => "email",
            JoomlaState::Finish => "finish",
        }
    }
}

impl fmt::Display for JoomlaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowState for JoomlaState {
    const ORDER: &'static [Self] = &[
        JoomlaState::Init,
        JoomlaState::BeforeEvents,
        JoomlaState::Backup,
        JoomlaState::Download,
        JoomlaState::Enable,
        JoomlaState::Extract,
        JoomlaState::PostExtract,
        JoomlaState::Finalise,
        JoomlaState::ReloadUpdates,
        JoomlaState::SiteInfo,
        JoomlaState::AfterEvents,
        JoomlaState::Email,
        JoomlaState::Finish,
    ];

    fn common(self) -> Option<CommonStep> {
        match self {
            JoomlaState::Init => Some(CommonStep::Init),
            JoomlaState::BeforeEvents => Some(CommonStep::BeforeEvents),
            JoomlaState::Backup => Some(CommonStep::Backup),
            JoomlaState::ReloadUpdates => Some(CommonStep::ReloadUpdates),
            JoomlaState::SiteInfo => Some(CommonStep::SiteInfo),
            JoomlaState::AfterEvents => Some(CommonStep::AfterEvents),
            JoomlaState::Email => Some(CommonStep::Email),
            JoomlaState::Finish => Some(CommonStep::Finish),
            JoomlaState::Download
            | JoomlaState::Enable
            | JoomlaState::Extract
            | JoomlaState::PostExtract
            | JoomlaState::Finalise => None,
        }
    }
}

/// `joomlaupdate` task.
pub struct JoomlaUpdateTask {
    http: Client,
    hooks: Vec<Arc<dyn WorkflowHook>>,
}

impl JoomlaUpdateTask {
    /// Handler using `http` for site requests.
    pub fn new(http: Client) -> Self {
        Self {
            http,
            hooks: Vec::new(),
        }
    }

    /// Add a pre/post update hook.
    pub fn with_hook(mut self, hook: Arc<dyn WorkflowHook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

#[async_trait]
impl TaskHandler for JoomlaUpdateTask {
    fn task_type(&self) -> TaskType {
        TaskType::JoomlaUpdate
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        drive(self, ctx, task, storage).await
    }
}

#[async_trait]
impl UpdateWorkflow for JoomlaUpdateTask {
    type State = JoomlaState;

    fn http(&self) -> &Client {
        &self.http
    }

    fn hooks(&self) -> &[Arc<dyn WorkflowHook>] {
        &self.hooks
    }

    async fn step(
        &self,
        rc: &RunContext<'_>,
        state: JoomlaState,
        run: &mut UpdateRun<JoomlaState>,
    ) -> Result<StepOutcome, TaskError> {
        match state {
            JoomlaState::Download => download(rc, run).await,
            JoomlaState::Enable => enable(rc, run).await,
            JoomlaState::Extract => extract(rc, run).await,
            JoomlaState::PostExtract => {
                let answer = rc.client.post("core/update/postupdate", &[]).await?;
                ensure_status(&answer, "Post-update script")?;
                Ok(StepOutcome::Advance)
            }
            JoomlaState::Finalise => {
                let answer = rc.client.post("core/update/finalise", &[]).await?;
                ensure_status(&answer, "Finalising the update")?;
                Ok(StepOutcome::Advance)
            }
            other => Err(TaskError::logic(format!("{other} is not a Joomla-specific state"))),
        }
    }
}

/// Fail when the answer carries `status: false`.
fn ensure_status(answer: &Value, what: &str) -> Result<(), TaskError> {
    if answer.get("status").and_then(Value::as_bool) == Some(false) {
        let message = attr_text(answer, "message").unwrap_or_else(|| "no details given".to_string());
        return Err(TaskError::transient(format!("{what} failed: {message}")));
    }
    Ok(())
}

async fn download(rc: &RunContext<'_>, run: &mut UpdateRun<JoomlaState>) -> Result<StepOutcome, TaskError> {
    let site_id = rc.site.id;
    match run.update.mode {
        DownloadMode::Single => {
            let result = rc
                .client
                .post("core/update/download", &[])
                .await
                .map_err(TaskError::from)
                .and_then(|answer| ensure_status(&answer, "Download").map(|_| answer));
            match result {
                Ok(answer) => {
                    run.update.file = attr_text(&answer, "basename");
                    info!(site_id, file = ?run.update.file, "Update package downloaded");
                    Ok(StepOutcome::Advance)
                }
                Err(e) => {
                    warn!(site_id, error = %e.message, "Single-shot download failed, switching to chunked download");
                    run.update.mode = DownloadMode::Chunked;
                    run.update.frag = 0;
                    Ok(StepOutcome::Stay)
                }
            }
        }
        DownloadMode::Chunked => {
            let answer = rc
                .client
                .post("core/update/chunked", &[("frag", run.update.frag.to_string())])
                .await?;
            ensure_status(&answer, "Chunked download")?;

            run.update.frag += 1;
            if let Some(file) = attr_text(&answer, "basename") {
                run.update.file = Some(file);
            }
            let done = answer.get("done").and_then(Value::as_bool).unwrap_or(false);
            debug!(site_id, frag = run.update.frag, done, "Fetched package fragment");
            Ok(if done { StepOutcome::Advance } else { StepOutcome::Stay })
        }
    }
}

async fn enable(rc: &RunContext<'_>, run: &mut UpdateRun<JoomlaState>) -> Result<StepOutcome, TaskError> {
    let answer = rc.client.post("core/update/activate", &[]).await?;
    ensure_status(&answer, "Enabling the extraction script")?;

    let password = attr_text(&answer, "password")
        .ok_or_else(|| RemoteError::Malformed("activation answer carries no password".into()))?;
    run.update.password = Some(password);
    if let Some(file) = attr_text(&answer, "file") {
        run.update.file = Some(file);
    }
    Ok(StepOutcome::Advance)
}

async fn extract(rc: &RunContext<'_>, run: &mut UpdateRun<JoomlaState>) -> Result<StepOutcome, TaskError> {
    let from = run.from_version.clone();
    let dialect = *run.restore.dialect.get_or_insert_with(|| {
        if uses_legacy_extractor(from.as_deref()) {
            ExtractDialect::Legacy
        } else {
            ExtractDialect::Modern
        }
    });
    let password = run
        .update
        .password
        .clone()
        .ok_or_else(|| TaskError::logic("no extraction password recorded"))?;

    loop {
        if run.restore.phase == ExtractPhase::Done {
            info!(site_id = rc.site.id, dialect = ?dialect, steps = run.restore.steps, "Update extracted");
            return Ok(StepOutcome::Advance);
        }
        if rc.ctx.timer.is_expired() {
            return Ok(StepOutcome::Stay);
        }
        match dialect {
            ExtractDialect::Legacy => legacy_step(rc, &password, &mut run.restore).await?,
            ExtractDialect::Modern => modern_step(rc, &password, &mut run.restore).await?,
        }
    }
}

/// POST a form to a script under the site root. Returns status and body.
async fn post_script(
    rc: &RunContext<'_>,
    url: &str,
    form: &[(&str, String)],
    with_basic_auth: bool,
) -> Result<(u16, String), RemoteError> {
    let mut request = rc.client.http().post(url).form(form);
    if with_basic_auth && let Some(auth) = rc.client.basic_auth() {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    Ok((status, body))
}

async fn legacy_step(rc: &RunContext<'_>, password: &str, restore: &mut RestoreProgress) -> Result<(), TaskError> {
    let task = match restore.phase {
        ExtractPhase::Start => "startRestore",
        ExtractPhase::Step => "stepRestore",
        ExtractPhase::Finalize => "finalizeRestore",
        ExtractPhase::Done => return Ok(()),
    };

    let mut request = json!({ "task": task });
    if restore.phase != ExtractPhase::Start {
        let factory = restore
            .factory
            .clone()
            .ok_or_else(|| TaskError::logic(format!("no factory to send with {task}")))?;
        request["factory"] = json!(factory);
    }

    let cipher = LegacyCipher::new(password);
    let url = rc.client.site_url(LEGACY_SCRIPT);
    let (status, body) = post_script(rc, &url, &[("json", cipher.encrypt(&request.to_string()))], false).await?;
    if !(200..300).contains(&status) {
        return Err(RemoteError::Status { status, url }.into());
    }

    let plain = cipher.decrypt(unwrap_marked(&body)?)?;
    let answer: Value = serde_json::from_str(&plain)
        .map_err(|e| RemoteError::Malformed(format!("{task} answer is not JSON: {e}")))?;
    if answer.get("status").and_then(Value::as_bool) != Some(true) {
        let message = attr_text(&answer, "message").unwrap_or_else(|| "no details given".to_string());
        return Err(TaskError::transient(format!("{task} failed: {message}")));
    }
    restore.steps += 1;

    let done = answer.get("done").and_then(Value::as_bool).unwrap_or(false);
    match restore.phase {
        ExtractPhase::Start | ExtractPhase::Step => {
            let factory = attr_text(&answer, "factory")
                .ok_or_else(|| TaskError::logic(format!("{task} answer carries no factory")))?;
            restore.factory = Some(factory);
            restore.phase = if done { ExtractPhase::Finalize } else { ExtractPhase::Step };
        }
        ExtractPhase::Finalize => restore.phase = ExtractPhase::Done,
        ExtractPhase::Done => {}
    }
    debug!(site_id = rc.site.id, task, done, "Legacy extraction step");
    Ok(())
}

async fn modern_step(rc: &RunContext<'_>, password: &str, restore: &mut RestoreProgress) -> Result<(), TaskError> {
    let task = match restore.phase {
        ExtractPhase::Start => "startExtract",
        ExtractPhase::Step => "stepExtract",
        ExtractPhase::Finalize => "finalizeUpdate",
        ExtractPhase::Done => return Ok(()),
    };

    let mut form = vec![("task", task.to_string()), ("password", password.to_string())];
    if restore.phase != ExtractPhase::Start
        && let Some(instance) = &restore.instance
    {
        form.push(("instance", instance.clone()));
    }

    let url = rc.client.site_url(MODERN_SCRIPT);
    let (mut status, mut body) = post_script(rc, &url, &form, restore.basic_auth).await?;
    if matches!(status, 401 | 403) && !restore.basic_auth && rc.client.basic_auth().is_some() {
        warn!(site_id = rc.site.id, status, "Extraction script wants HTTP authentication, retrying with site credentials");
        restore.basic_auth = true;
        (status, body) = post_script(rc, &url, &form, true).await?;
    }
    if !(200..300).contains(&status) {
        return Err(RemoteError::Status { status, url }.into());
    }

    let document = if body.contains("###") { unwrap_marked(&body)? } else { body.trim() };
    let answer: Value = serde_json::from_str(document)
        .map_err(|e| RemoteError::Malformed(format!("{task} answer is not JSON: {e}")))?;
    if answer.get("status").and_then(Value::as_bool) != Some(true) {
        let message = attr_text(&answer, "message").unwrap_or_else(|| "no details given".to_string());
        return Err(TaskError::transient(format!("{task} failed: {message}")));
    }
    restore.steps += 1;

    let done = answer.get("done").and_then(Value::as_bool).unwrap_or(false);
    match restore.phase {
        ExtractPhase::Start => {
            restore.instance = attr_text(&answer, "instance");
            restore.phase = if done { ExtractPhase::Finalize } else { ExtractPhase::Step };
        }
        ExtractPhase::Step => {
            if done {
                restore.phase = ExtractPhase::Finalize;
            }
        }
        ExtractPhase::Finalize => restore.phase = ExtractPhase::Done,
        ExtractPhase::Done => {}
    }
    debug!(site_id = rc.site.id, task, done, "Extraction step");
    Ok(())
}
