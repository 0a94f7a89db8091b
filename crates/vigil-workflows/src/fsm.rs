// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Update workflow state machine.
//!
//! A core update is a fixed, linear sequence of named states. The whole run
//! lives in task storage as an [`UpdateRun`] document: the current state plus
//! namespaced sub-documents each state reads and writes. [`drive`] runs states
//! until one stays put, the invocation budget runs out, or `finish` is
//! reached, and saves the document after every step, so calling it again with
//! the last written storage picks up exactly where it stopped.
//!
//! ```text
//!   init → beforeEvents → backup → <cms specific states> → reloadUpdates
//!        → siteInfo → afterEvents → email → finish
//! ```
//!
//! States shared by every CMS are implemented here; a workflow only supplies
//! its own states through [`UpdateWorkflow::step`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};
use vigil_core::persistence::{SiteRecord, TaskRecord};
use vigil_core::{
    ErrorKind, MailTemplate, RecipientRule, SiteConfig, Status, Storage, TaskContext, TaskError,
    TaskParams,
};
use vigil_remote::SiteClient;

use crate::backup::{backup_profile, run_backup};
use crate::report;
use crate::site_info::{CoreInfo, save_core_info};

/// Version of the [`UpdateRun`] document layout.
pub const SCHEMA_VERSION: u32 = 1;

/// States every update workflow shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonStep {
    /// Decide source and target versions.
    Init,
    /// Run pre-update hooks.
    BeforeEvents,
    /// Take a backup when the site asks for one.
    Backup,
    /// Make the site refresh its update information.
    ReloadUpdates,
    /// Read back the installed version.
    SiteInfo,
    /// Run post-update hooks.
    AfterEvents,
    /// Queue the success email.
    Email,
    /// Terminal state.
    Finish,
}

/// A workflow's closed set of states.
pub trait WorkflowState:
    Copy + Eq + fmt::Debug + fmt::Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Every state in execution order. The first is the entry state, the last
    /// is terminal.
    const ORDER: &'static [Self];

    /// The shared step this state stands for, if any.
    fn common(self) -> Option<CommonStep>;

    /// Entry state.
    fn initial() -> Self {
        Self::ORDER[0]
    }

    /// Fixed successor. The terminal state is its own successor.
    fn next(self) -> Self {
        Self::ORDER
            .iter()
            .position(|s| *s == self)
            .and_then(|i| Self::ORDER.get(i + 1))
            .copied()
            .unwrap_or(self)
    }

    /// Whether this is `finish`.
    fn is_terminal(self) -> bool {
        self.common() == Some(CommonStep::Finish)
    }
}

/// How a package download is being fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// One request for the whole package.
    #[default]
    Single,
    /// One fragment per invocation.
    Chunked,
}

/// `update` sub-document: download and activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProgress {
    /// Download mode in use.
    #[serde(default)]
    pub mode: DownloadMode,
    /// Next fragment to fetch in chunked mode.
    #[serde(default)]
    pub frag: u32,
    /// Package file name.
    #[serde(default)]
    pub file: Option<String>,
    /// Shared secret for the extraction script.
    #[serde(default)]
    pub password: Option<String>,
}

/// Extraction script flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractDialect {
    /// Encrypted `restore.php`.
    Legacy,
    /// Form-encoded `extract.php`.
    Modern,
}

/// Where the extraction script is in its own protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractPhase {
    /// Nothing sent yet.
    #[default]
    Start,
    /// Extracting.
    Step,
    /// Extraction done, finalization pending.
    Finalize,
    /// Finished.
    Done,
}

/// `restore` sub-document: extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreProgress {
    /// Dialect chosen at first entry. Never changes within a run.
    #[serde(default)]
    pub dialect: Option<ExtractDialect>,
    /// Protocol phase.
    #[serde(default)]
    pub phase: ExtractPhase,
    /// Opaque engine state the legacy script hands back every step.
    #[serde(default)]
    pub factory: Option<String>,
    /// Session id of the modern script.
    #[serde(default)]
    pub instance: Option<String>,
    /// Whether HTTP Basic credentials must accompany script requests.
    #[serde(default)]
    pub basic_auth: bool,
    /// Requests made.
    #[serde(default)]
    pub steps: u32,
}

/// The persisted run of an update workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRun<S> {
    /// Layout version.
    pub schema_version: u32,
    /// Current state.
    pub state: S,
    /// Version installed when the run started.
    #[serde(default)]
    pub from_version: Option<String>,
    /// Target version.
    #[serde(default)]
    pub to_version: Option<String>,
    /// Version the site reported after updating.
    #[serde(default)]
    pub installed_version: Option<String>,
    /// Mail template variables.
    #[serde(default)]
    pub email: Map<String, Value>,
    /// Whether the success email was queued.
    #[serde(default)]
    pub email_sent: bool,
    /// Download and activation.
    #[serde(default)]
    pub update: UpdateProgress,
    /// Extraction.
    #[serde(default)]
    pub restore: RestoreProgress,
    /// Nested backup storage.
    #[serde(default)]
    pub backup: Storage,
    /// States completed, in order.
    #[serde(default)]
    pub progress: Vec<String>,
}

impl<S: WorkflowState> Default for UpdateRun<S> {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            state: S::initial(),
            from_version: None,
            to_version: None,
            installed_version: None,
            email: Map::new(),
            email_sent: false,
            update: UpdateProgress::default(),
            restore: RestoreProgress::default(),
            backup: Storage::default(),
            progress: Vec::new(),
        }
    }
}

/// Result of one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move to the fixed successor.
    Advance,
    /// Re-enter this state on the next invocation.
    Stay,
}

/// Pre- and post-update extension points.
#[async_trait]
pub trait WorkflowHook: Send + Sync {
    /// Runs in `beforeEvents`. An error aborts the update.
    async fn before_update(&self, _site: &SiteRecord, _from: Option<&str>, _to: &str) -> Result<(), TaskError> {
        Ok(())
    }

    /// Runs in `afterEvents`.
    async fn after_update(&self, _site: &SiteRecord, _installed: Option<&str>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Everything a state may use during one invocation.
pub struct RunContext<'a> {
    /// Runner context.
    pub ctx: &'a TaskContext,
    /// The task being run.
    pub task: &'a TaskRecord,
    /// Task parameters.
    pub params: TaskParams,
    /// Site as loaded at the start of the invocation.
    pub site: SiteRecord,
    /// Its config.
    pub config: SiteConfig,
    /// API client for the site.
    pub client: SiteClient,
}

/// A CMS-specific update workflow.
#[async_trait]
pub trait UpdateWorkflow: Send + Sync {
    /// State set.
    type State: WorkflowState;

    /// HTTP client for site requests.
    fn http(&self) -> &Client;

    /// Registered hooks.
    fn hooks(&self) -> &[Arc<dyn WorkflowHook>];

    /// Run a CMS-specific state.
    async fn step(
        &self,
        rc: &RunContext<'_>,
        state: Self::State,
        run: &mut UpdateRun<Self::State>,
    ) -> Result<StepOutcome, TaskError>;
}

/// Drive `workflow` from whatever state `storage` holds.
///
/// A failing state passes a boundary that writes a failure report and, unless
/// the stop was expected, queues one failure email before the error is handed
/// to the runner. States never recover from logic errors themselves.
pub async fn drive<W: UpdateWorkflow>(
    workflow: &W,
    ctx: &TaskContext,
    task: &TaskRecord,
    storage: &mut Storage,
) -> Result<Status, TaskError> {
    let params = task
        .params()
        .map_err(|e| TaskError::logic(format!("Unreadable task parameters: {e}")))?;
    let mut run = load_run::<W::State>(storage)?;

    let result = run_states(workflow, ctx, task, &params, &mut run, storage).await;
    storage.store(&run)?;

    match result {
        Ok(status) => Ok(status),
        Err(error) => Err(failure_boundary(ctx, task, &params, &run, error).await),
    }
}

fn load_run<S: WorkflowState>(storage: &Storage) -> Result<UpdateRun<S>, TaskError> {
    let run: UpdateRun<S> = storage
        .load()
        .map_err(|e| TaskError::logic(format!("Unreadable workflow state: {e}")))?;
    if run.schema_version != SCHEMA_VERSION {
        return Err(TaskError::logic(format!(
            "Workflow state has schema version {}, expected {SCHEMA_VERSION}",
            run.schema_version
        )));
    }
    Ok(run)
}

async fn run_states<W: UpdateWorkflow>(
    workflow: &W,
    ctx: &TaskContext,
    task: &TaskRecord,
    params: &TaskParams,
    run: &mut UpdateRun<W::State>,
    storage: &mut Storage,
) -> Result<Status, TaskError> {
    let site_id = task
        .site_id
        .ok_or_else(|| TaskError::logic("update task has no site"))?;
    let Some(site) = ctx.persistence.get_site(site_id).await? else {
        return Err(TaskError::expected_stop(format!("site {site_id} no longer exists")));
    };
    if !site.enabled {
        return Err(TaskError::expected_stop(format!("site {site_id} is disabled")));
    }

    let rc = RunContext {
        ctx,
        task,
        params: params.clone(),
        config: site.site_config()?,
        client: SiteClient::new(workflow.http().clone(), &site)?,
        site,
    };

    loop {
        let state = run.state;
        if state.is_terminal() {
            finish(&rc, run).await?;
            return Ok(Status::Ok);
        }
        if ctx.timer.is_expired() {
            debug!(task_id = task.id, state = %state, "Out of time, will resume");
            return Ok(Status::WillResume);
        }

        let outcome = match state.common() {
            Some(common) => common_step(workflow, &rc, common, run).await?,
            None => workflow.step(&rc, state, run).await?,
        };

        match outcome {
            StepOutcome::Advance => {
                run.progress.push(state.to_string());
                run.state = state.next();
                storage.store(&*run)?;
                debug!(task_id = task.id, site_id, from = %state, to = %run.state, "Advanced");
            }
            StepOutcome::Stay => {
                debug!(task_id = task.id, site_id, state = %state, "Staying");
                return Ok(Status::WillResume);
            }
        }
    }
}

async fn common_step<W: UpdateWorkflow>(
    workflow: &W,
    rc: &RunContext<'_>,
    step: CommonStep,
    run: &mut UpdateRun<W::State>,
) -> Result<StepOutcome, TaskError> {
    match step {
        CommonStep::Init => init(rc, run),
        CommonStep::BeforeEvents => {
            let to = run.to_version.clone().unwrap_or_default();
            for hook in workflow.hooks() {
                hook.before_update(&rc.site, run.from_version.as_deref(), &to).await?;
            }
            Ok(StepOutcome::Advance)
        }
        CommonStep::Backup => {
            if !rc.config.backup_on_update() {
                return Ok(StepOutcome::Advance);
            }
            let profile = backup_profile(&rc.config, rc.params.get_i64("profile_id"));
            let description = format!(
                "Before updating to {}",
                run.to_version.as_deref().unwrap_or("the latest version")
            );
            match run_backup(&rc.client, &mut run.backup, &rc.ctx.timer, profile, &description).await? {
                Status::Ok => Ok(StepOutcome::Advance),
                Status::WillResume => Ok(StepOutcome::Stay),
                other => Err(TaskError::transient(format!("Backup ended with {other}"))),
            }
        }
        CommonStep::ReloadUpdates => {
            rc.client.post("updates/refresh", &[("force", "1".to_string())]).await?;
            Ok(StepOutcome::Advance)
        }
        CommonStep::SiteInfo => {
            let attributes = rc.client.get("core/update").await?;
            let info = CoreInfo::from_attributes(&attributes)?;
            save_core_info(rc.ctx.persistence.as_ref(), rc.site.id, &info).await?;
            run.installed_version = Some(info.current);
            Ok(StepOutcome::Advance)
        }
        CommonStep::AfterEvents => {
            for hook in workflow.hooks() {
                hook.after_update(&rc.site, run.installed_version.as_deref()).await?;
            }
            Ok(StepOutcome::Advance)
        }
        CommonStep::Email => {
            let changed = run.installed_version.is_some() && run.installed_version != run.from_version;
            if !run.email_sent && changed && rc.config.email_after_update() {
                let mut vars = run.email.clone();
                vars.insert("new_version".into(), json!(run.installed_version));
                rc.ctx
                    .notifier
                    .enqueue_email(
                        MailTemplate::CoreUpdateInstalled,
                        Some(rc.site.id),
                        vars,
                        recipients(&rc.params),
                    )
                    .await?;
                run.email_sent = true;
            }
            Ok(StepOutcome::Advance)
        }
        CommonStep::Finish => Ok(StepOutcome::Stay),
    }
}

fn init<S: WorkflowState>(rc: &RunContext<'_>, run: &mut UpdateRun<S>) -> Result<StepOutcome, TaskError> {
    run.from_version = rc.config.current_version();
    run.to_version = rc.params.to_version().or_else(|| rc.config.latest_version());

    let Some(to) = run.to_version.clone() else {
        return Err(TaskError::expected_stop("no update available"));
    };
    if !rc.params.force() && run.from_version.as_deref() == Some(to.as_str()) {
        return Err(TaskError::expected_stop(format!("already at version {to}")));
    }

    run.email.insert("site_id".into(), json!(rc.site.id));
    run.email.insert("site_name".into(), json!(rc.site.name));
    run.email.insert("site_url".into(), json!(rc.site.url));
    run.email.insert("old_version".into(), json!(run.from_version));
    run.email.insert("new_version".into(), json!(to));

    info!(site_id = rc.site.id, from = ?run.from_version, to = %to, "Starting core update");
    Ok(StepOutcome::Advance)
}

async fn finish<S: WorkflowState>(rc: &RunContext<'_>, run: &UpdateRun<S>) -> Result<(), TaskError> {
    report::record(
        rc.ctx.persistence.as_ref(),
        rc.site.id,
        report::CORE_UPDATE,
        true,
        json!({
            "from": run.from_version,
            "to": run.to_version,
            "installed": run.installed_version,
            "steps": run.progress,
        }),
    )
    .await;
    info!(site_id = rc.site.id, installed = ?run.installed_version, "Core update finished");
    Ok(())
}

fn recipients(params: &TaskParams) -> RecipientRule {
    RecipientRule::site_admins().with_user(params.initiating_user())
}

async fn failure_boundary<S: WorkflowState>(
    ctx: &TaskContext,
    task: &TaskRecord,
    params: &TaskParams,
    run: &UpdateRun<S>,
    error: TaskError,
) -> TaskError {
    let Some(site_id) = task.site_id else {
        return error;
    };

    if error.kind == ErrorKind::Logic {
        error!(task_id = task.id, site_id, state = %run.state, error = %error.message, "Update workflow inconsistent");
    } else {
        warn!(task_id = task.id, site_id, state = %run.state, kind = %error.kind, error = %error.message, "Core update failed");
    }
    report::record(
        ctx.persistence.as_ref(),
        site_id,
        report::CORE_UPDATE,
        false,
        json!({
            "state": run.state.to_string(),
            "kind": error.kind.to_string(),
            "error": error.message,
            "from": run.from_version,
            "to": run.to_version,
        }),
    )
    .await;

    if !error.is_notifying() {
        return error;
    }

    let wants_email = match ctx.persistence.get_site(site_id).await {
        Ok(Some(site)) => site.site_config().map(|c| c.email_on_error()).unwrap_or(true),
        Ok(None) => false,
        Err(e) => {
            warn!(site_id, error = %e, "Could not load site for failure email");
            false
        }
    };
    if wants_email {
        let mut vars = run.email.clone();
        vars.insert("state".into(), json!(run.state.to_string()));
        vars.insert("error".into(), json!(error.message));
        if let Err(e) = ctx
            .notifier
            .enqueue_email(MailTemplate::CoreUpdateFailed, Some(site_id), vars, recipients(params))
            .await
        {
            warn!(site_id, error = %e, "Could not queue failure email");
        }
    }

    error
}
