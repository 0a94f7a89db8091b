// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Racy mutations (task claiming, sibling re-arming, site claiming) run in a
//! transaction opened with `BEGIN IMMEDIATE`, which takes the database write
//! lock up front. The transaction guard rolls back if it is dropped before
//! commit, so an abandoned claim never returns a locked connection to the pool.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::claim::ClaimRequest;
use crate::error::{CoreError, Result};
use crate::migrations::SQLITE as MIGRATOR;
use crate::site::SiteConfig;
use crate::status::Status;
use crate::task::{NewTask, TaskType};

use super::{
    NewReport, NewSite, Persistence, PushSubscriptionRecord, QueueItem, ReportRecord, SiteRecord,
    TaskOutcome, TaskRecord,
};

const TASK_COLUMNS: &str = "id, task_type, site_id, enabled, cron_expression, next_execution, \
     last_execution, last_run_end, last_exit_code, locked_by, locked_at, params, storage, \
     times_executed, times_failed, priority";

const QUEUE_COLUMNS: &str = "id, queue_type, site_id, data, created_at, available_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL so overlapping invocations can read while one writes
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/vigil.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction holding the database write lock.
    pub async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

/// Commit on success, roll back on failure.
async fn finish_locked<T>(tx: Transaction<'static, Sqlite>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Failed to roll back locked transaction");
            }
            Err(e)
        }
    }
}

async fn insert_task(conn: &mut SqliteConnection, task: &NewTask, now: DateTime<Utc>) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (task_type, site_id, enabled, cron_expression, next_execution,
                           last_exit_code, params, storage, priority)
        VALUES (?, ?, ?, ?, ?, ?, ?, '{}', ?)
        RETURNING id
        "#,
    )
    .bind(task.task_type.as_str())
    .bind(task.site_id)
    .bind(task.enabled)
    .bind(&task.cron_expression)
    .bind(task.next_execution.unwrap_or(now))
    .bind(Status::InitialSchedule.code())
    .bind(task.params.to_json_string())
    .bind(task.priority)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

async fn claim_next_task_locked(
    conn: &mut SqliteConnection,
    runner_id: &str,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> Result<Option<TaskRecord>> {
    let candidate: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM tasks
        WHERE enabled = 1
          AND next_execution IS NOT NULL
          AND next_execution <= ?
          AND NOT (last_exit_code = ? AND locked_at IS NOT NULL AND locked_at > ?)
        ORDER BY priority ASC, next_execution ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(now)
    .bind(Status::Running.code())
    .bind(stale_before)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    let sql = format!(
        "UPDATE tasks SET last_exit_code = ?, locked_by = ?, locked_at = ?, last_execution = ? \
         WHERE id = ? RETURNING {TASK_COLUMNS}"
    );
    let record = sqlx::query_as::<_, TaskRecord>(&sql)
        .bind(Status::Running.code())
        .bind(runner_id)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(Some(record))
}

async fn rearm_site_task_locked(
    conn: &mut SqliteConnection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let siblings: Vec<(i64, i32)> = sqlx::query_as(
        r#"
        SELECT id, last_exit_code FROM tasks
        WHERE task_type = ? AND site_id IS ?
        ORDER BY id DESC
        "#,
    )
    .bind(task.task_type.as_str())
    .bind(task.site_id)
    .fetch_all(&mut *conn)
    .await?;

    if siblings
        .iter()
        .any(|(_, code)| *code == Status::Running.code())
    {
        return Ok(None);
    }

    let Some(&(latest, _)) = siblings.first() else {
        return insert_task(conn, task, now).await.map(Some);
    };

    sqlx::query("UPDATE tasks SET enabled = 0 WHERE task_type = ? AND site_id IS ? AND id != ?")
        .bind(task.task_type.as_str())
        .bind(task.site_id)
        .bind(latest)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        UPDATE tasks
        SET enabled = ?, cron_expression = ?, next_execution = ?, last_exit_code = ?,
            params = ?, storage = '{}', priority = ?, locked_by = NULL, locked_at = NULL
        WHERE id = ?
        "#,
    )
    .bind(task.enabled)
    .bind(&task.cron_expression)
    .bind(task.next_execution.unwrap_or(now))
    .bind(Status::InitialSchedule.code())
    .bind(task.params.to_json_string())
    .bind(task.priority)
    .bind(latest)
    .execute(&mut *conn)
    .await?;

    Ok(Some(latest))
}

async fn claim_sites_locked(conn: &mut SqliteConnection, request: &ClaimRequest) -> Result<Vec<i64>> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT id, config FROM sites WHERE enabled = 1");

    if !request.force {
        builder
            .push(" AND COALESCE(CAST(json_extract(config, ")
            .push_bind(request.purpose.sqlite_path())
            .push(") AS INTEGER), 0) < ")
            .push_bind(request.cutoff_unix());
    }

    if let Some(ids) = &request.only_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }

    builder
        .push(" ORDER BY id ASC LIMIT ")
        .push_bind(request.limit)
        .push(" OFFSET ")
        .push_bind(request.limit_start);

    let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(&mut *conn).await?;

    let stamp = request.now.timestamp();
    let mut claimed = Vec::with_capacity(rows.len());
    for (id, raw) in rows {
        let mut config = SiteConfig::from_json_str(&raw)?;
        config.set(request.purpose.path(), stamp);
        sqlx::query("UPDATE sites SET config = ? WHERE id = ?")
            .bind(config.to_json_string())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        claimed.push(id);
    }

    Ok(claimed)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_task(&mut conn, task, now).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let record = sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_tasks(
        &self,
        task_type: Option<TaskType>,
        site_id: Option<i64>,
    ) -> Result<Vec<TaskRecord>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (?1 IS NULL OR task_type = ?1) AND (?2 IS NULL OR site_id = ?2) \
             ORDER BY id ASC"
        );
        let records = sqlx::query_as::<_, TaskRecord>(&sql)
            .bind(task_type.map(TaskType::as_str))
            .bind(site_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn set_task_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_next_task(
        &self,
        runner_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>> {
        let mut tx = self.begin_immediate().await?;
        let result = claim_next_task_locked(&mut tx, runner_id, now, stale_before).await;
        finish_locked(tx, result).await
    }

    async fn release_task(&self, id: i64, outcome: &TaskOutcome) -> Result<()> {
        if outcome.delete {
            self.delete_task(id).await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET last_exit_code = ?,
                storage = ?,
                enabled = ?,
                next_execution = ?,
                last_run_end = ?,
                locked_by = NULL,
                locked_at = NULL,
                times_executed = times_executed + 1,
                times_failed = times_failed + ?
            WHERE id = ?
            "#,
        )
        .bind(outcome.status.code())
        .bind(&outcome.storage)
        .bind(outcome.enabled)
        .bind(outcome.next_execution)
        .bind(outcome.finished_at)
        .bind(i64::from(outcome.failed))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset_stale_tasks(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET last_exit_code = ?, locked_by = NULL, locked_at = NULL
            WHERE last_exit_code = ?
              AND (locked_at IS NULL OR locked_at <= ?)
            "#,
        )
        .bind(Status::Timeout.code())
        .bind(Status::Running.code())
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn rearm_site_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Option<i64>> {
        let mut tx = self.begin_immediate().await?;
        let result = rearm_site_task_locked(&mut tx, task, now).await;
        finish_locked(tx, result).await
    }

    async fn create_site(&self, site: &NewSite) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sites (name, url, enabled, cms_type, config)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&site.name)
        .bind(&site.url)
        .bind(site.enabled)
        .bind(site.cms_type.as_str())
        .bind(site.config.to_json_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_site(&self, id: i64) -> Result<Option<SiteRecord>> {
        let record = sqlx::query_as::<_, SiteRecord>(
            "SELECT id, name, url, enabled, cms_type, config FROM sites WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let records = sqlx::query_as::<_, SiteRecord>(
            "SELECT id, name, url, enabled, cms_type, config FROM sites ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn set_site_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE sites SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::SiteNotFound(id));
        }
        Ok(())
    }

    async fn compare_and_set_site_config(
        &self,
        id: i64,
        expected: &str,
        new_config: &str,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE sites SET config = ? WHERE id = ? AND config = ?")
            .bind(new_config)
            .bind(id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_sites(&self, request: &ClaimRequest) -> Result<Vec<i64>> {
        let mut tx = self.begin_immediate().await?;
        let result = claim_sites_locked(&mut tx, request).await;
        let claimed = finish_locked(tx, result).await?;

        debug!(
            purpose = ?request.purpose,
            count = claimed.len(),
            force = request.force,
            "Claimed sites"
        );
        Ok(claimed)
    }

    async fn queue_push(
        &self,
        queue_type: &str,
        site_id: Option<i64>,
        data: &str,
        created_at: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue (queue_type, site_id, data, created_at, available_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(queue_type)
        .bind(site_id)
        .bind(data)
        .bind(created_at)
        .bind(available_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn queue_pop(&self, queue_type: &str, now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        // Single statement: select-and-delete is atomic against other consumers.
        let sql = format!(
            "DELETE FROM queue WHERE id = ( \
                SELECT id FROM queue \
                WHERE queue_type = ? AND available_at <= ? \
                ORDER BY available_at ASC, id ASC LIMIT 1 \
             ) RETURNING {QUEUE_COLUMNS}"
        );
        let item = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(queue_type)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    async fn queue_items(&self, queue_type: &str) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue WHERE queue_type = ? ORDER BY available_at ASC, id ASC"
        );
        let items = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(queue_type)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn queue_count(&self, queue_type: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE queue_type = ?")
            .bind(queue_type)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn queue_clear(&self, queue_type: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue WHERE queue_type = ?")
            .bind(queue_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_report(&self, report: &NewReport) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reports (site_id, action, success, context, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(report.site_id)
        .bind(&report.action)
        .bind(report.success)
        .bind(report.context.to_string())
        .bind(report.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_reports(&self, site_id: Option<i64>) -> Result<Vec<ReportRecord>> {
        let records = sqlx::query_as::<_, ReportRecord>(
            r#"
            SELECT id, site_id, action, success, context, created_at
            FROM reports
            WHERE (?1 IS NULL OR site_id = ?1)
            ORDER BY id ASC
            "#,
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn create_push_subscription(&self, user_id: i64, endpoint: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO push_subscriptions (user_id, endpoint, enabled) VALUES (?, ?, 1) RETURNING id",
        )
        .bind(user_id)
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_push_subscription(&self, id: i64) -> Result<Option<PushSubscriptionRecord>> {
        let record = sqlx::query_as::<_, PushSubscriptionRecord>(
            "SELECT id, user_id, endpoint, enabled FROM push_subscriptions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn deactivate_push_subscription(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE push_subscriptions SET enabled = 0 WHERE id = ? AND enabled = 1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool> {
        let value: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(value == 1)
    }
}
