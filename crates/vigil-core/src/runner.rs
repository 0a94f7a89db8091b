// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task runner.
//!
//! Picks due tasks one at a time, hands each to its registered handler inside
//! a failure boundary, and writes the outcome back. The runner is the only
//! place that turns handler results into persisted status codes.
//!
//! # Outcome mapping
//!
//! | Handler result          | Persisted                                              |
//! |-------------------------|--------------------------------------------------------|
//! | `Ok(WILL_RESUME)`       | storage kept, due again after the resume delay         |
//! | `Ok(OK)`                | storage cleared, next cron slot, one-offs disabled/deleted |
//! | `Err(_)` / panic / fatal status | storage + `error` kept, `KNOCKED_OUT`, failure counted |
//! | no handler              | `NO_ROUTINE`, task disabled                            |

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::handler::{HandlerRegistry, TaskContext, TaskError};
use crate::persistence::{Persistence, TaskOutcome, TaskRecord};
use crate::status::Status;
use crate::storage::Storage;
use crate::task::{RunOnce, TaskParams, next_cron_run};
use crate::timer::Timer;

/// Summary of one `run_due` pass.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Stuck tasks reset to TIMEOUT before running anything.
    pub reset_stale: u64,
    /// Task id and outcome of every task run, in order.
    pub executed: Vec<(i64, Status)>,
}

/// Runs due tasks against a handler registry.
#[derive(Clone)]
pub struct TaskRunner {
    persistence: Arc<dyn Persistence>,
    registry: Arc<HandlerRegistry>,
    config: Arc<Config>,
}

impl TaskRunner {
    /// Create a runner.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<HandlerRegistry>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            persistence,
            registry,
            config,
        }
    }

    /// Run due tasks until the configured execution budget is spent or
    /// nothing is due.
    pub async fn run_due(&self) -> Result<RunSummary> {
        let timer = Timer::new(self.config.max_execution, self.config.execution_bias);
        self.run_due_with(&timer).await
    }

    /// Run due tasks until `timer` expires or nothing is due.
    pub async fn run_due_with(&self, timer: &Timer) -> Result<RunSummary> {
        let mut summary = RunSummary {
            reset_stale: self.reset_stale(Utc::now()).await?,
            ..RunSummary::default()
        };

        while !timer.is_expired() {
            match self.run_next(timer).await? {
                Some(result) => summary.executed.push(result),
                None => break,
            }
        }

        info!(
            runner_id = %self.config.runner_id,
            executed = summary.executed.len(),
            reset_stale = summary.reset_stale,
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(summary)
    }

    /// Reset RUNNING tasks whose lock is older than the stale-lock window.
    pub async fn reset_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let reset = self.persistence.reset_stale_tasks(self.stale_before(now)).await?;
        if reset > 0 {
            warn!(count = reset, "Reset stuck tasks to TIMEOUT");
        }
        Ok(reset)
    }

    /// Claim and run a single due task. Returns `None` when nothing is due.
    pub async fn run_next(&self, timer: &Timer) -> Result<Option<(i64, Status)>> {
        let now = Utc::now();
        let Some(task) = self
            .persistence
            .claim_next_task(&self.config.runner_id, now, self.stale_before(now))
            .await?
        else {
            return Ok(None);
        };

        info!(
            task_id = task.id,
            task_type = %task.task_type,
            site_id = ?task.site_id,
            "Running task"
        );

        let status = self.execute(task, timer).await?;
        Ok(Some(status))
    }

    async fn execute(&self, task: TaskRecord, timer: &Timer) -> Result<(i64, Status)> {
        let params = task.params().unwrap_or_else(|e| {
            warn!(task_id = task.id, error = %e, "Unreadable task params, using none");
            TaskParams::default()
        });
        let mut storage = task.storage().unwrap_or_else(|e| {
            warn!(task_id = task.id, error = %e, "Unreadable task storage, starting fresh");
            Storage::default()
        });

        let handler = task
            .kind()
            .ok()
            .and_then(|task_type| self.registry.get(task_type));

        let Some(handler) = handler else {
            warn!(task_id = task.id, task_type = %task.task_type, "No handler registered, disabling task");
            let outcome = TaskOutcome {
                status: Status::NoRoutine,
                storage: storage.to_json_string(),
                enabled: false,
                next_execution: task.next_execution,
                finished_at: Utc::now(),
                failed: false,
                delete: false,
            };
            self.persistence.release_task(task.id, &outcome).await?;
            return Ok((task.id, Status::NoRoutine));
        };

        let ctx = TaskContext::new(self.persistence.clone(), timer.clone(), self.config.clone());
        let result = AssertUnwindSafe(handler.run(&ctx, &task, &mut storage))
            .catch_unwind()
            .await;

        let finished_at = Utc::now();
        let outcome = match result {
            Ok(Ok(Status::WillResume)) => {
                debug!(task_id = task.id, "Task will resume");
                TaskOutcome {
                    status: Status::WillResume,
                    storage: storage.to_json_string(),
                    enabled: true,
                    next_execution: Some(finished_at + self.resume_delay()),
                    finished_at,
                    failed: false,
                    delete: false,
                }
            }
            Ok(Ok(Status::Ok)) => self.completed(&task, &params, finished_at),
            Ok(Ok(other)) => {
                let error = TaskError::transient(format!("Handler reported {other}"));
                self.failed(&task, &params, &mut storage, &error, finished_at)
            }
            Ok(Err(error)) => self.failed(&task, &params, &mut storage, &error, finished_at),
            Err(panic) => {
                let error = TaskError::logic(format!("Handler panicked: {}", panic_message(panic.as_ref())));
                self.failed(&task, &params, &mut storage, &error, finished_at)
            }
        };

        let status = outcome.status;
        self.persistence.release_task(task.id, &outcome).await?;
        info!(task_id = task.id, status = %status, "Task released");
        Ok((task.id, status))
    }

    fn completed(&self, task: &TaskRecord, params: &TaskParams, finished_at: DateTime<Utc>) -> TaskOutcome {
        let mut outcome = TaskOutcome {
            status: Status::Ok,
            storage: Storage::default().to_json_string(),
            enabled: true,
            next_execution: None,
            finished_at,
            failed: false,
            delete: false,
        };

        match params.run_once() {
            Some(RunOnce::Delete) => outcome.delete = true,
            Some(RunOnce::Disable) => {
                outcome.enabled = false;
                outcome.next_execution = task.next_execution;
            }
            None => match next_cron_run(&task.cron_expression, finished_at) {
                Ok(next) => outcome.next_execution = Some(next),
                Err(e) => {
                    error!(task_id = task.id, error = %e, "Cannot schedule next run, disabling task");
                    outcome.enabled = false;
                    outcome.next_execution = task.next_execution;
                }
            },
        }

        outcome
    }

    fn failed(
        &self,
        task: &TaskRecord,
        params: &TaskParams,
        storage: &mut Storage,
        error: &TaskError,
        finished_at: DateTime<Utc>,
    ) -> TaskOutcome {
        error!(
            task_id = task.id,
            task_type = %task.task_type,
            site_id = ?task.site_id,
            kind = %error.kind,
            error = %error.message,
            "Task knocked out"
        );

        if let Err(e) = storage.set("error", &error.message) {
            warn!(task_id = task.id, error = %e, "Could not record error in storage");
        }

        // One-offs wait for an operator or a director pass; recurring tasks
        // keep their schedule.
        let (enabled, next_execution) = if params.run_once().is_some() {
            (false, task.next_execution)
        } else {
            match next_cron_run(&task.cron_expression, finished_at) {
                Ok(next) => (true, Some(next)),
                Err(_) => (false, task.next_execution),
            }
        };

        TaskOutcome {
            status: Status::KnockedOut,
            storage: storage.to_json_string(),
            enabled,
            next_execution,
            finished_at,
            failed: true,
            delete: false,
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.stale_lock_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(now)
    }

    fn resume_delay(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.resume_delay).unwrap_or_else(|_| chrono::Duration::seconds(1))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
