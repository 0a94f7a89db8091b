// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core update director.
//!
//! For every claimed site with a core update it has not yet acted on, either
//! tell the admins or schedule the CMS update workflow, then stamp the version
//! as handled in `core.lastAutoUpdateVersion` so the next pass skips it.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, json};
use tracing::{debug, info};
use vigil_core::persistence::{SiteRecord, TaskRecord};
use vigil_core::site::update_site_config;
use vigil_core::{
    ClaimPurpose, CmsType, CoreUpdatePreference, MailTemplate, NewTask, RecipientRule,
    RetryConfig, Status, Storage, TaskContext, TaskError, TaskHandler, TaskType,
};

use crate::site_batch::SiteBatches;
use crate::version::auto_update_allowed;

/// What the director did for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing new, or the site opted out.
    Skip,
    /// Admins were told an update exists.
    Notified,
    /// An update task was armed.
    Scheduled(i64),
    /// A sibling update is already running; retry next pass.
    Busy,
}

/// Update task type for a CMS.
pub fn update_task_type(cms: CmsType) -> TaskType {
    match cms {
        CmsType::Joomla => TaskType::JoomlaUpdate,
        CmsType::WordPress => TaskType::WordPressUpdate,
    }
}

/// Act on one site's pending core update.
pub async fn direct_site(ctx: &TaskContext, site: &SiteRecord) -> Result<Decision, TaskError> {
    let config = site.site_config()?;
    let Some(latest) = config.latest_version() else {
        return Ok(Decision::Skip);
    };
    if !config.can_upgrade() || config.last_auto_update_version().as_deref() == Some(latest.as_str()) {
        return Ok(Decision::Skip);
    }

    let current = config.current_version();
    let preference = config.core_update_install();
    let decision = match preference {
        CoreUpdatePreference::None => Decision::Skip,
        CoreUpdatePreference::Patch | CoreUpdatePreference::Minor | CoreUpdatePreference::Major
            if auto_update_allowed(preference, current.as_deref(), &latest) =>
        {
            let now = Utc::now();
            let update = NewTask::one_off(update_task_type(site.cms()?))
                .site(site.id)
                .param("to_version", latest.as_str())
                .due_at(now);
            match ctx.persistence.rearm_site_task(&update, now).await? {
                Some(task_id) => Decision::Scheduled(task_id),
                None => Decision::Busy,
            }
        }
        // Email, or an automatic preference that does not cover this jump.
        _ => {
            let mut vars = Map::new();
            vars.insert("site_id".into(), json!(site.id));
            vars.insert("site_name".into(), json!(site.name));
            vars.insert("site_url".into(), json!(site.url));
            vars.insert("old_version".into(), json!(current));
            vars.insert("new_version".into(), json!(latest));
            ctx.notifier
                .enqueue_email(MailTemplate::CoreUpdateFound, Some(site.id), vars, RecipientRule::site_admins())
                .await?;
            Decision::Notified
        }
    };

    // A busy sibling leaves the version unstamped so the next pass retries.
    if decision != Decision::Busy {
        update_site_config(ctx.persistence.as_ref(), site.id, &RetryConfig::config_save(), |c| {
            c.set(&["core", "lastAutoUpdateVersion"], latest.as_str())
        })
        .await?;
    }
    Ok(decision)
}

/// `coreupdatedirector` task.
#[derive(Debug, Default)]
pub struct CoreUpdateDirectorTask;

#[async_trait]
impl TaskHandler for CoreUpdateDirectorTask {
    fn task_type(&self) -> TaskType {
        TaskType::CoreUpdateDirector
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let params = task.params()?;
        let batches = SiteBatches::new(
            ClaimPurpose::CoreUpdates,
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
                match direct_site(ctx, &site).await? {
                    Decision::Skip => {}
                    Decision::Notified => info!(site_id = site.id, "Core update available, admins notified"),
                    Decision::Scheduled(task_id) => info!(site_id = site.id, task_id, "Core update scheduled"),
                    Decision::Busy => debug!(site_id = site.id, "Core update already running"),
                }
            }
        }
    }
}
