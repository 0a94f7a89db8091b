// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler registry and system task bootstrap.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use tracing::info;
use vigil_core::persistence::Persistence;
use vigil_core::{CoreError, HandlerRegistry, NewTask, TaskType};

use crate::backup::AkeebaBackupTask;
use crate::core_update_director::CoreUpdateDirectorTask;
use crate::extensions::{ExtensionUpdatesDirectorTask, ExtensionsUpdateTask};
use crate::file_scanner::FileScannerTask;
use crate::joomla_update::JoomlaUpdateTask;
use crate::mail::{Mailer, SendMailTask};
use crate::site_info::RefreshSiteInfoTask;
use crate::webpush::{PushTransport, WebPushTask};
use crate::wordpress_update::WordPressUpdateTask;

/// Recurring fleet-wide tasks every installation runs, with their schedules.
pub const SYSTEM_TASKS: &[(TaskType, &str)] = &[
    (TaskType::RefreshSiteInfo, "* * * * *"),
    (TaskType::CoreUpdateDirector, "*/10 * * * *"),
    (TaskType::ExtensionUpdatesDirector, "*/10 * * * *"),
    (TaskType::SendMail, "* * * * *"),
    (TaskType::WebPush, "* * * * *"),
];

/// Register a handler for every task type.
pub fn build_registry(
    http: Client,
    mailer: Arc<dyn Mailer>,
    push: Arc<dyn PushTransport>,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(RefreshSiteInfoTask::new(http.clone())))
        .with(Arc::new(CoreUpdateDirectorTask))
        .with(Arc::new(JoomlaUpdateTask::new(http.clone())))
        .with(Arc::new(WordPressUpdateTask::new(http.clone())))
        .with(Arc::new(AkeebaBackupTask::new(http.clone())))
        .with(Arc::new(ExtensionUpdatesDirectorTask))
        .with(Arc::new(ExtensionsUpdateTask::new(http.clone())))
        .with(Arc::new(SendMailTask::new(mailer)))
        .with(Arc::new(WebPushTask::new(push)))
        .with(Arc::new(FileScannerTask::new(http)))
}

/// Create any missing [`SYSTEM_TASKS`]. Existing rows, enabled or not, are
/// left alone. Returns how many were created.
pub async fn ensure_system_tasks(persistence: &dyn Persistence) -> Result<usize, CoreError> {
    let mut created = 0;
    for (task_type, cron) in SYSTEM_TASKS {
        let existing = persistence.list_tasks(Some(*task_type), None).await?;
        if existing.iter().any(|t| t.site_id.is_none()) {
            continue;
        }
        let id = persistence
            .create_task(&NewTask::recurring(*task_type, *cron), Utc::now())
            .await?;
        info!(task_id = id, task_type = %task_type, cron, "Created system task");
        created += 1;
    }
    Ok(created)
}
