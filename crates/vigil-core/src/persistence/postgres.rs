// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! Task claiming and queue pops use `FOR UPDATE SKIP LOCKED` so concurrent
//! runners never wait on each other's rows. Site claims and sibling re-arming
//! take an explicit table lock for the length of their transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;

use crate::claim::ClaimRequest;
use crate::error::{CoreError, Result};
use crate::migrations::POSTGRES as MIGRATOR;
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

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation from a migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_task<'e, E>(executor: E, task: &NewTask, now: DateTime<Utc>) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (task_type, site_id, enabled, cron_expression, next_execution,
                           last_exit_code, params, storage, priority)
        VALUES ($1, $2, $3, $4, $5, $6, $7, '{}', $8)
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
    .fetch_one(executor)
    .await?;

    Ok(id)
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<i64> {
        insert_task(&self.pool, task, now).await
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
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
             WHERE ($1::text IS NULL OR task_type = $1) AND ($2::bigint IS NULL OR site_id = $2) \
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
        let result = sqlx::query("UPDATE tasks SET enabled = $1 WHERE id = $2")
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
        sqlx::query("DELETE FROM tasks WHERE id = $1")
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
        let sql = r#"
            WITH next AS (
                SELECT id FROM tasks
                WHERE enabled
                  AND next_execution IS NOT NULL
                  AND next_execution <= $1
                  AND NOT (last_exit_code = $2 AND locked_at IS NOT NULL AND locked_at > $3)
                ORDER BY priority ASC, next_execution ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks AS t
            SET last_exit_code = $2, locked_by = $4, locked_at = $1, last_execution = $1
            FROM next
            WHERE t.id = next.id
            RETURNING t.*
            "#;

        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, TaskRecord>(sql)
            .bind(now)
            .bind(Status::Running.code())
            .bind(stale_before)
            .bind(runner_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn release_task(&self, id: i64, outcome: &TaskOutcome) -> Result<()> {
        if outcome.delete {
            return self.delete_task(id).await;
        }

        sqlx::query(
            r#"
            UPDATE tasks
            SET last_exit_code = $1,
                storage = $2,
                enabled = $3,
                next_execution = $4,
                last_run_end = $5,
                locked_by = NULL,
                locked_at = NULL,
                times_executed = times_executed + 1,
                times_failed = times_failed + $6
            WHERE id = $7
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
            SET last_exit_code = $1, locked_by = NULL, locked_at = NULL
            WHERE last_exit_code = $2
              AND (locked_at IS NULL OR locked_at <= $3)
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
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE tasks IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let siblings: Vec<(i64, i32)> = sqlx::query_as(
            r#"
            SELECT id, last_exit_code FROM tasks
            WHERE task_type = $1 AND site_id IS NOT DISTINCT FROM $2
            ORDER BY id DESC
            "#,
        )
        .bind(task.task_type.as_str())
        .bind(task.site_id)
        .fetch_all(&mut *tx)
        .await?;

        if siblings
            .iter()
            .any(|(_, code)| *code == Status::Running.code())
        {
            tx.rollback().await?;
            return Ok(None);
        }

        let id = match siblings.first() {
            None => insert_task(&mut *tx, task, now).await?,
            Some(&(latest, _)) => {
                sqlx::query(
                    "UPDATE tasks SET enabled = FALSE \
                     WHERE task_type = $1 AND site_id IS NOT DISTINCT FROM $2 AND id <> $3",
                )
                .bind(task.task_type.as_str())
                .bind(task.site_id)
                .bind(latest)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET enabled = $1, cron_expression = $2, next_execution = $3,
                        last_exit_code = $4, params = $5, storage = '{}', priority = $6,
                        locked_by = NULL, locked_at = NULL
                    WHERE id = $7
                    "#,
                )
                .bind(task.enabled)
                .bind(&task.cron_expression)
                .bind(task.next_execution.unwrap_or(now))
                .bind(Status::InitialSchedule.code())
                .bind(task.params.to_json_string())
                .bind(task.priority)
                .bind(latest)
                .execute(&mut *tx)
                .await?;
                latest
            }
        };

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn create_site(&self, site: &NewSite) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sites (name, url, enabled, cms_type, config)
            VALUES ($1, $2, $3, $4, $5)
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
            "SELECT id, name, url, enabled, cms_type, config FROM sites WHERE id = $1",
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
        let result = sqlx::query("UPDATE sites SET enabled = $1 WHERE id = $2")
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
        let result = sqlx::query("UPDATE sites SET config = $1 WHERE id = $2 AND config = $3")
            .bind(new_config)
            .bind(id)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_sites(&self, request: &ClaimRequest) -> Result<Vec<i64>> {
        if matches!(&request.only_ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE sites IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT id, config FROM sites WHERE enabled");

        if !request.force {
            builder
                .push(" AND COALESCE((config::jsonb #>> ")
                .push_bind(request.purpose.pg_path())
                .push("::text[])::double precision, 0) < ")
                .push_bind(request.cutoff_unix() as f64);
        }

        if let Some(ids) = &request.only_ids {
            builder.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }

        builder
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(request.limit)
            .push(" OFFSET ")
            .push_bind(request.limit_start);

        let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(&mut *tx).await?;

        let stamp = request.now.timestamp();
        let mut claimed = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            let mut config = SiteConfig::from_json_str(&raw)?;
            config.set(request.purpose.path(), stamp);
            sqlx::query("UPDATE sites SET config = $1 WHERE id = $2")
                .bind(config.to_json_string())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            claimed.push(id);
        }

        tx.commit().await?;

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
            VALUES ($1, $2, $3, $4, $5)
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
        let sql = format!(
            r#"
            DELETE FROM queue
            WHERE id = (
                SELECT id FROM queue
                WHERE queue_type = $1 AND available_at <= $2
                ORDER BY available_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {QUEUE_COLUMNS}
            "#
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
            "SELECT {QUEUE_COLUMNS} FROM queue WHERE queue_type = $1 ORDER BY available_at ASC, id ASC"
        );
        let items = sqlx::query_as::<_, QueueItem>(&sql)
            .bind(queue_type)
            .fetch_all(&self.pool)
            .await?;
        Ok(items)
    }

    async fn queue_count(&self, queue_type: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE queue_type = $1")
            .bind(queue_type)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn queue_clear(&self, queue_type: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue WHERE queue_type = $1")
            .bind(queue_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_report(&self, report: &NewReport) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reports (site_id, action, success, context, created_at)
            VALUES ($1, $2, $3, $4, $5)
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
            WHERE ($1::bigint IS NULL OR site_id = $1)
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
            "INSERT INTO push_subscriptions (user_id, endpoint, enabled) VALUES ($1, $2, TRUE) RETURNING id",
        )
        .bind(user_id)
        .bind(endpoint)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_push_subscription(&self, id: i64) -> Result<Option<PushSubscriptionRecord>> {
        let record = sqlx::query_as::<_, PushSubscriptionRecord>(
            "SELECT id, user_id, endpoint, enabled FROM push_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn deactivate_push_subscription(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE push_subscriptions SET enabled = FALSE WHERE id = $1 AND enabled",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool> {
        let value: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(value == 1)
    }
}
