// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for vigil-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Every timestamp is bound from Rust rather than taken from the database
//! clock, so callers (and tests) control what "now" means.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::claim::ClaimRequest;
use crate::error::{CoreError, Result};
use crate::site::{CmsType, SiteConfig};
use crate::status::Status;
use crate::storage::Storage;
use crate::task::{NewTask, TaskParams, TaskType};

/// Task record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRecord {
    /// Database primary key.
    pub id: i64,
    /// Handler selector (see [`TaskType`]).
    pub task_type: String,
    /// Site the task works on, if site-scoped.
    pub site_id: Option<i64>,
    /// Disabled tasks are never claimed.
    pub enabled: bool,
    /// Recurrence.
    pub cron_expression: String,
    /// When the task is next due.
    pub next_execution: Option<DateTime<Utc>>,
    /// When the task was last claimed.
    pub last_execution: Option<DateTime<Utc>>,
    /// When the last invocation ended.
    pub last_run_end: Option<DateTime<Utc>>,
    /// Persisted [`Status`] code.
    pub last_exit_code: i32,
    /// Runner holding the task.
    pub locked_by: Option<String>,
    /// When the lock was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// JSON parameters fixed at scheduling time.
    pub params: String,
    /// JSON continuation state.
    pub storage: String,
    /// Completed invocations.
    pub times_executed: i64,
    /// Invocations that ended in an error.
    pub times_failed: i64,
    /// Lower runs first.
    pub priority: i32,
}

impl TaskRecord {
    /// Typed task type.
    pub fn kind(&self) -> Result<TaskType> {
        self.task_type.parse()
    }

    /// Last outcome, if the code is known.
    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.last_exit_code)
    }

    /// Parsed parameters.
    pub fn params(&self) -> Result<TaskParams> {
        Ok(TaskParams::from_json_str(&self.params)?)
    }

    /// Parsed storage.
    pub fn storage(&self) -> Result<Storage> {
        Ok(Storage::from_json_str(&self.storage)?)
    }
}

/// Site record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SiteRecord {
    /// Database primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Base URL of the installation.
    pub url: String,
    /// Disabled sites are never claimed.
    pub enabled: bool,
    /// CMS kind (`joomla`, `wordpress`).
    pub cms_type: String,
    /// JSON configuration document.
    pub config: String,
}

impl SiteRecord {
    /// Typed CMS kind.
    pub fn cms(&self) -> Result<CmsType> {
        self.cms_type.parse()
    }

    /// Parsed configuration.
    pub fn site_config(&self) -> Result<SiteConfig> {
        Ok(SiteConfig::from_json_str(&self.config)?)
    }
}

/// A site to be created.
#[derive(Debug, Clone)]
pub struct NewSite {
    /// Display name.
    pub name: String,
    /// Base URL.
    pub url: String,
    /// CMS kind.
    pub cms_type: CmsType,
    /// Whether the site is monitored.
    pub enabled: bool,
    /// Initial configuration.
    pub config: SiteConfig,
}

impl NewSite {
    /// Enabled site with an empty configuration.
    pub fn new(name: impl Into<String>, url: impl Into<String>, cms_type: CmsType) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            cms_type,
            enabled: true,
            config: SiteConfig::default(),
        }
    }

    /// Replace the initial configuration.
    pub fn with_config(mut self, config: SiteConfig) -> Self {
        self.config = config;
        self
    }
}

/// Queue item from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueItem {
    /// Database primary key.
    pub id: i64,
    /// Queue partition.
    pub queue_type: String,
    /// Site the item belongs to, if any.
    pub site_id: Option<i64>,
    /// Opaque JSON payload.
    pub data: String,
    /// When the item was pushed.
    pub created_at: DateTime<Utc>,
    /// Items are not popped before this time.
    pub available_at: DateTime<Utc>,
}

impl QueueItem {
    /// Parsed payload.
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Report record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReportRecord {
    /// Database primary key.
    pub id: i64,
    /// Site the report is about.
    pub site_id: Option<i64>,
    /// Action name, e.g. `core.update`.
    pub action: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// JSON context.
    pub context: String,
    /// When the report was written.
    pub created_at: DateTime<Utc>,
}

/// A report to be written.
#[derive(Debug, Clone)]
pub struct NewReport {
    /// Site the report is about.
    pub site_id: Option<i64>,
    /// Action name.
    pub action: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Free-form context.
    pub context: Value,
    /// Report time.
    pub created_at: DateTime<Utc>,
}

/// Web push destination.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushSubscriptionRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Push service endpoint URL.
    pub endpoint: String,
    /// Deactivated subscriptions receive nothing.
    pub enabled: bool,
}

/// What the runner writes back after an invocation.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Outcome code.
    pub status: Status,
    /// Storage to persist.
    pub storage: String,
    /// Whether the task stays enabled.
    pub enabled: bool,
    /// Next due time.
    pub next_execution: Option<DateTime<Utc>>,
    /// When the invocation ended.
    pub finished_at: DateTime<Utc>,
    /// Count the invocation as failed.
    pub failed: bool,
    /// Delete the row instead of updating it.
    pub delete: bool,
}

/// Persistence trait for the task engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- tasks ----

    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<i64>;

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>>;

    /// Tasks filtered by type and site, ordered by id.
    async fn list_tasks(
        &self,
        task_type: Option<TaskType>,
        site_id: Option<i64>,
    ) -> Result<Vec<TaskRecord>>;

    async fn set_task_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    async fn delete_task(&self, id: i64) -> Result<()>;

    /// Atomically pick the next due task and mark it RUNNING for `runner_id`.
    ///
    /// A task RUNNING with a lock taken after `stale_before` is never
    /// returned.
    async fn claim_next_task(
        &self,
        runner_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>>;

    /// Write an invocation outcome and clear the lock.
    async fn release_task(&self, id: i64, outcome: &TaskOutcome) -> Result<()>;

    /// Mark RUNNING tasks locked before `stale_before` as TIMEOUT and clear
    /// their locks. Returns the number of tasks reset.
    async fn reset_stale_tasks(&self, stale_before: DateTime<Utc>) -> Result<u64>;

    /// Under the write lock, make `task` the one enabled task of its type for
    /// its site: siblings are disabled and the most recent one is re-armed
    /// with fresh params and empty storage, or a new row is inserted.
    ///
    /// Returns `None` without changes while a sibling is RUNNING.
    async fn rearm_site_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Option<i64>>;

    // ---- sites ----

    async fn create_site(&self, site: &NewSite) -> Result<i64>;

    async fn get_site(&self, id: i64) -> Result<Option<SiteRecord>>;

    async fn list_sites(&self) -> Result<Vec<SiteRecord>>;

    async fn set_site_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    /// Replace a site's config only if it still equals `expected`.
    async fn compare_and_set_site_config(
        &self,
        id: i64,
        expected: &str,
        new_config: &str,
    ) -> Result<bool>;

    /// Select and stamp a batch of sites in one write-locked transaction.
    async fn claim_sites(&self, request: &ClaimRequest) -> Result<Vec<i64>>;

    // ---- queue ----

    async fn queue_push(
        &self,
        queue_type: &str,
        site_id: Option<i64>,
        data: &str,
        created_at: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Remove and return the oldest item available at `now`.
    async fn queue_pop(&self, queue_type: &str, now: DateTime<Utc>) -> Result<Option<QueueItem>>;

    /// All items of a queue, oldest first, regardless of availability.
    async fn queue_items(&self, queue_type: &str) -> Result<Vec<QueueItem>>;

    async fn queue_count(&self, queue_type: &str) -> Result<i64>;

    async fn queue_clear(&self, queue_type: &str) -> Result<u64>;

    // ---- reports ----

    async fn insert_report(&self, report: &NewReport) -> Result<i64>;

    async fn list_reports(&self, site_id: Option<i64>) -> Result<Vec<ReportRecord>>;

    // ---- push subscriptions ----

    async fn create_push_subscription(&self, user_id: i64, endpoint: &str) -> Result<i64>;

    async fn get_push_subscription(&self, id: i64) -> Result<Option<PushSubscriptionRecord>>;

    /// Disable a subscription. Returns true only if it was enabled.
    async fn deactivate_push_subscription(&self, id: i64) -> Result<bool>;

    // ---- health ----

    async fn health_check_db(&self) -> Result<bool>;
}

/// Connect to `database_url`, run migrations and return the matching backend.
pub async fn connect(database_url: &str) -> Result<std::sync::Arc<dyn Persistence>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let persistence = PostgresPersistence::connect(database_url).await?;
        Ok(std::sync::Arc::new(persistence))
    } else if let Some(path) = database_url.strip_prefix("sqlite://").or_else(|| database_url.strip_prefix("sqlite:")) {
        let persistence = SqlitePersistence::from_path(path).await?;
        Ok(std::sync::Arc::new(persistence))
    } else {
        Err(CoreError::Other(format!(
            "Unsupported database URL scheme: {database_url}"
        )))
    }
}
