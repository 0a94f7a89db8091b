// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WordPress core update workflow.
//!
//! WordPress installs the update itself in one call, so the only
//! site-specific state is `update`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use vigil_core::persistence::TaskRecord;
use vigil_core::{Status, Storage, TaskContext, TaskError, TaskHandler, TaskType};

use crate::fsm::{
    CommonStep, RunContext, StepOutcome, UpdateRun, UpdateWorkflow, WorkflowHook, WorkflowState,
    drive,
};
use crate::site_info::attr_text;

/// States of the WordPress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WordPressState {
    Init,
    BeforeEvents,
    Backup,
    Update,
    ReloadUpdates,
    SiteInfo,
    AfterEvents,
    Email,
    Finish,
}

impl fmt::Display for WordPressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WordPressState::Init => "init",
            WordPressState::BeforeEvents => "beforeEvents",
            WordPressState::Backup => "backup",
            WordPressState::Update => "update",
            WordPressState::ReloadUpdates => "reloadUpdates",
            WordPressState::SiteInfo => "siteInfo",
            WordPressState::AfterEvents => "afterEvents",
            WordPressState::Email => "email",
            WordPressState::Finish => "finish",
        };
        f.write_str(name)
    }
}

impl WorkflowState for WordPressState {
    const ORDER: &'static [Self] = &[
        WordPressState::Init,
        WordPressState::BeforeEvents,
        WordPressState::Backup,
        WordPressState::Update,
        WordPressState::ReloadUpdates,
        WordPressState::SiteInfo,
        WordPressState::AfterEvents,
        WordPressState::Email,
        WordPressState::Finish,
    ];

    fn common(self) -> Option<CommonStep> {
        match self {
            WordPressState::Init => Some(CommonStep::Init),
            WordPressState::BeforeEvents => Some(CommonStep::BeforeEvents),
            WordPressState::Backup => Some(CommonStep::Backup),
            WordPressState::Update => None,
            WordPressState::ReloadUpdates => Some(CommonStep::ReloadUpdates),
            WordPressState::SiteInfo => Some(CommonStep::SiteInfo),
            WordPressState::AfterEvents => Some(CommonStep::AfterEvents),
            WordPressState::Email => Some(CommonStep::Email),
            WordPressState::Finish => Some(CommonStep::Finish),
        }
    }
}

/// `wordpressupdate` task.
pub struct WordPressUpdateTask {
    http: Client,
    hooks: Vec<Arc<dyn WorkflowHook>>,
}

impl WordPressUpdateTask {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn WorkflowHook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

#[async_trait]
impl TaskHandler for WordPressUpdateTask {
    fn task_type(&self) -> TaskType {
        TaskType::WordPressUpdate
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
impl UpdateWorkflow for WordPressUpdateTask {
    type State = WordPressState;

    fn http(&self) -> &Client {
        &self.http
    }

    fn hooks(&self) -> &[Arc<dyn WorkflowHook>] {
        &self.hooks
    }

    async fn step(
        &self,
        rc: &RunContext<'_>,
        state: WordPressState,
        run: &mut UpdateRun<WordPressState>,
    ) -> Result<StepOutcome, TaskError> {
        if state != WordPressState::Update {
            return Err(TaskError::logic(format!("{state} is not a WordPress-specific state")));
        }

        let mut form = Vec::new();
        if let Some(to) = &run.to_version {
            form.push(("version", to.clone()));
        }
        let answer = rc.client.post("core/update", &form).await?;
        if answer.get("status").and_then(Value::as_bool) == Some(false) {
            let message = attr_text(&answer, "message").unwrap_or_else(|| "no details given".to_string());
            return Err(TaskError::transient(format!("WordPress update failed: {message}")));
        }

        info!(site_id = rc.site.id, to = ?run.to_version, "WordPress core updated");
        Ok(StepOutcome::Advance)
    }
}
