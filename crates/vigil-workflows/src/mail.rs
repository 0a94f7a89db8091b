// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound mail consumer.
//!
//! Workflows push [`MailMessage`]s onto the `mail` queue through the
//! notifier. `sendmail` pops them and hands each to a [`Mailer`]; a failed
//! delivery goes back to the tail with its retry counter bumped and never
//! blocks the messages behind it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use vigil_core::persistence::TaskRecord;
use vigil_core::{
    MailMessage, Queue, QueueType, Status, Storage, TaskContext, TaskError, TaskHandler, TaskType,
    When,
};

use crate::delivery::{DEFAULT_RETRY_DELAY, DeliveryError};

/// Attempts after which a message is dropped.
pub const MAX_MAIL_RETRIES: u32 = 3;

/// Renders and delivers one message.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), DeliveryError>;
}

/// Mailer that only logs. Used when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), DeliveryError> {
        info!(
            template = message.template.as_str(),
            site_id = ?message.site_id,
            permissions = ?message.recipients.permissions,
            user_ids = ?message.recipients.user_ids,
            "Mail delivered to log"
        );
        Ok(())
    }
}

/// `sendmail` task.
pub struct SendMailTask {
    mailer: Arc<dyn Mailer>,
    retry_delay: Duration,
}

impl SendMailTask {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self {
            mailer,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Delay before a failed message becomes poppable again.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl TaskHandler for SendMailTask {
    fn task_type(&self) -> TaskType {
        TaskType::SendMail
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        _storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let queue = Queue::new(ctx.persistence.clone(), QueueType::Mail);
        // Only what is queued now; re-pushed retries wait for the next run.
        let budget = queue.count().await?;
        let (mut sent, mut failed) = (0usize, 0usize);

        for _ in 0..budget {
            if ctx.timer.is_expired() {
                info!(task_id = task.id, sent, failed, "Mail run out of time");
                return Ok(Status::WillResume);
            }
            let Some(mut message) = queue.pop::<MailMessage>().await? else {
                break;
            };

            match self.mailer.send(&message).await {
                Ok(()) => {
                    sent += 1;
                    debug!(template = message.template.as_str(), site_id = ?message.site_id, "Mail sent");
                }
                Err(e) => {
                    failed += 1;
                    message.retries += 1;
                    if matches!(e, DeliveryError::Gone(_)) || message.retries > MAX_MAIL_RETRIES {
                        error!(
                            template = message.template.as_str(),
                            site_id = ?message.site_id,
                            retries = message.retries,
                            error = %e,
                            "Dropping undeliverable mail"
                        );
                        continue;
                    }
                    warn!(
                        template = message.template.as_str(),
                        retries = message.retries,
                        error = %e,
                        "Mail delivery failed, requeueing"
                    );
                    queue.push(&message, When::After(self.retry_delay)).await?;
                }
            }
        }

        if sent + failed > 0 {
            info!(task_id = task.id, sent, failed, "Mail queue processed");
        }
        Ok(Status::Ok)
    }
}
