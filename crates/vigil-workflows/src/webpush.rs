// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Web push consumer.
//!
//! Each queued [`PushMessage`] carries its own retry counter. A transient
//! failure bumps the counter and pushes the message back to the tail; once the
//! counter would pass [`MAX_RETRIES`] the subscription is deactivated and the
//! message dropped. A push service answering 404 or 410 deactivates the
//! subscription at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use vigil_core::persistence::{PushSubscriptionRecord, TaskRecord};
use vigil_core::{
    Queue, QueueType, Status, Storage, TaskContext, TaskError, TaskHandler, TaskType, When,
};

use crate::delivery::{DEFAULT_RETRY_DELAY, DeliveryError};

/// Failed attempts tolerated before a subscription is given up on.
pub const MAX_RETRIES: u32 = 3;

/// Queued push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Target subscription.
    pub subscription_id: i64,
    pub title: String,
    pub body: String,
    /// Page to open on click.
    #[serde(default)]
    pub url: Option<String>,
    /// Failed attempts so far.
    #[serde(default)]
    pub retries: u32,
}

impl PushMessage {
    pub fn new(subscription_id: i64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subscription_id,
            title: title.into(),
            body: body.into(),
            url: None,
            retries: 0,
        }
    }
}

/// Delivers one push message to a subscription endpoint.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        subscription: &PushSubscriptionRecord,
        message: &PushMessage,
    ) -> Result<(), DeliveryError>;
}

/// Posts the message as JSON to the subscription endpoint.
#[derive(Clone)]
pub struct HttpPushTransport {
    http: Client,
}

impl HttpPushTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn deliver(
        &self,
        subscription: &PushSubscriptionRecord,
        message: &PushMessage,
    ) -> Result<(), DeliveryError> {
        let payload = json!({
            "title": message.title,
            "body": message.body,
            "url": message.url,
        });
        let response = self
            .http
            .post(&subscription.endpoint)
            .header("TTL", "86400")
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(DeliveryError::Gone(format!("push service answered {}", response.status())))
            }
            s => Err(DeliveryError::Failed(format!("push service answered {s}"))),
        }
    }
}

/// `webpush` task.
pub struct WebPushTask {
    transport: Arc<dyn PushTransport>,
    retry_delay: Duration,
}

impl WebPushTask {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Delay before a failed message becomes poppable again.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn deactivate(ctx: &TaskContext, subscription_id: i64, reason: &str) -> Result<(), TaskError> {
        if ctx.persistence.deactivate_push_subscription(subscription_id).await? {
            info!(subscription_id, reason, "Push subscription deactivated");
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for WebPushTask {
    fn task_type(&self) -> TaskType {
        TaskType::WebPush
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        _storage: &mut Storage,
    ) -> Result<Status, TaskError> {
        let queue = Queue::new(ctx.persistence.clone(), QueueType::WebPush);
        let budget = queue.count().await?;
        let mut delivered = 0usize;

        for _ in 0..budget {
            if ctx.timer.is_expired() {
                return Ok(Status::WillResume);
            }
            let Some(mut message) = queue.pop::<PushMessage>().await? else {
                break;
            };

            let subscription = match ctx.persistence.get_push_subscription(message.subscription_id).await? {
                Some(s) if s.enabled => s,
                _ => {
                    debug!(subscription_id = message.subscription_id, "Subscription gone or disabled, dropping push");
                    continue;
                }
            };

            match self.transport.deliver(&subscription, &message).await {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Gone(reason)) => {
                    Self::deactivate(ctx, subscription.id, &reason).await?;
                }
                Err(DeliveryError::Failed(reason)) => {
                    message.retries += 1;
                    if message.retries > MAX_RETRIES {
                        warn!(subscription_id = subscription.id, retries = message.retries, error = %reason, "Push retries exhausted");
                        Self::deactivate(ctx, subscription.id, &reason).await?;
                        continue;
                    }
                    debug!(subscription_id = subscription.id, retries = message.retries, error = %reason, "Push failed, requeueing");
                    queue.push(&message, When::After(self.retry_delay)).await?;
                }
            }
        }

        if budget > 0 {
            info!(task_id = task.id, delivered, processed = budget, "Push queue processed");
        }
        Ok(Status::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_default_on_decode() {
        let message: PushMessage =
            serde_json::from_value(json!({"subscription_id": 1, "title": "t", "body": "b"})).unwrap();
        assert_eq!(message.retries, 0);
        assert_eq!(message, PushMessage::new(1, "t", "b"));
    }
}
