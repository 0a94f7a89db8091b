// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mail and web push consumers: retry counters and destination deactivation.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use vigil_core::persistence::{Persistence, PushSubscriptionRecord};
use vigil_core::{
    MailMessage, MailTemplate, NewTask, Queue, QueueType, RecipientRule, Status, Storage,
    TaskHandler, TaskType, When,
};
use vigil_workflows::mail::{MAX_MAIL_RETRIES, SendMailTask};
use vigil_workflows::webpush::{HttpPushTransport, PushMessage, WebPushTask};
use vigil_workflows::{DeliveryError, Mailer, PushTransport};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{context, create_task, http, memory_persistence};

/// Push transport that always fails the same way.
struct FailingTransport {
    gone: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl PushTransport for FailingTransport {
    async fn deliver(&self, _s: &PushSubscriptionRecord, _m: &PushMessage) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gone {
            Err(DeliveryError::Gone("410".into()))
        } else {
            Err(DeliveryError::Failed("503".into()))
        }
    }
}

async fn push_items(persistence: Arc<dyn Persistence>) -> Vec<PushMessage> {
    let queue = Queue::new(persistence, QueueType::WebPush);
    let mut items = Vec::new();
    while let Some(item) = queue.pop::<PushMessage>().await.unwrap() {
        items.push(item);
    }
    items
}

#[tokio::test]
async fn test_push_retry_ceiling_deactivates_subscription() {
    let persistence = memory_persistence().await;
    let subscription = persistence.create_push_subscription(7, "https://push.test/ep").await.unwrap();
    let queue = Queue::new(persistence.clone(), QueueType::WebPush);
    let mut message = PushMessage::new(subscription, "Update", "Site updated");
    message.retries = 2;
    queue.push(&message, When::Now).await.unwrap();

    let transport = Arc::new(FailingTransport { gone: false, calls: AtomicUsize::new(0) });
    let handler = WebPushTask::new(transport.clone()).with_retry_delay(Duration::ZERO);
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::WebPush, "* * * * *")).await;
    let ctx = context(persistence.clone());

    // retries=2 fails: back on the queue with retries=3.
    assert_eq!(handler.run(&ctx, &task, &mut Storage::new()).await.unwrap(), Status::Ok);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    let requeued = push_items(persistence.clone()).await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].retries, 3);
    assert!(persistence.get_push_subscription(subscription).await.unwrap().unwrap().enabled);

    // retries=3 fails: subscription off, nothing re-pushed.
    queue.push(&requeued[0], When::Now).await.unwrap();
    assert_eq!(handler.run(&ctx, &task, &mut Storage::new()).await.unwrap(), Status::Ok);
    assert!(push_items(persistence.clone()).await.is_empty());
    assert!(!persistence.get_push_subscription(subscription).await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_gone_endpoint_deactivates_without_retry() {
    let persistence = memory_persistence().await;
    let subscription = persistence.create_push_subscription(7, "https://push.test/ep").await.unwrap();
    Queue::new(persistence.clone(), QueueType::WebPush)
        .push(&PushMessage::new(subscription, "t", "b"), When::Now)
        .await
        .unwrap();

    let transport = Arc::new(FailingTransport { gone: true, calls: AtomicUsize::new(0) });
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::WebPush, "* * * * *")).await;
    WebPushTask::new(transport)
        .run(&context(persistence.clone()), &task, &mut Storage::new())
        .await
        .unwrap();

    assert!(push_items(persistence.clone()).await.is_empty());
    assert!(!persistence.get_push_subscription(subscription).await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_http_transport_maps_410_to_gone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let transport = HttpPushTransport::new(http());
    let message = PushMessage::new(1, "t", "b");
    let subscription = |endpoint: &str| PushSubscriptionRecord {
        id: 1,
        user_id: 1,
        endpoint: format!("{}{endpoint}", server.uri()),
        enabled: true,
    };

    assert!(transport.deliver(&subscription("/ok"), &message).await.is_ok());
    assert!(matches!(
        transport.deliver(&subscription("/gone"), &message).await,
        Err(DeliveryError::Gone(_))
    ));
}

/// Mailer that fails every message.
struct BrokenMailer;

#[async_trait]
impl Mailer for BrokenMailer {
    async fn send(&self, _message: &MailMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Failed("smtp down".into()))
    }
}

async fn mail_items(persistence: Arc<dyn Persistence>) -> Vec<MailMessage> {
    common::queued_mail(persistence).await
}

#[tokio::test]
async fn test_failed_mail_is_requeued_then_dropped() {
    let persistence = memory_persistence().await;
    let ctx = context(persistence.clone());
    ctx.notifier
        .enqueue_email(MailTemplate::BackupFailed, Some(1), Map::new(), RecipientRule::site_admins())
        .await
        .unwrap();
    ctx.notifier
        .enqueue_email(MailTemplate::ScanFinished, Some(2), Map::new(), RecipientRule::site_admins())
        .await
        .unwrap();

    let handler = SendMailTask::new(Arc::new(BrokenMailer)).with_retry_delay(Duration::ZERO);
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::SendMail, "* * * * *")).await;

    // Both messages are tried once per run, neither blocks the other.
    assert_eq!(handler.run(&ctx, &task, &mut Storage::new()).await.unwrap(), Status::Ok);
    let queue = Queue::new(persistence.clone(), QueueType::Mail);
    assert_eq!(queue.count().await.unwrap(), 2);

    for _ in 1..MAX_MAIL_RETRIES {
        handler.run(&ctx, &task, &mut Storage::new()).await.unwrap();
    }
    let pending = mail_items(persistence.clone()).await;
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|m| m.retries == MAX_MAIL_RETRIES));

    for message in &pending {
        queue.push(message, When::Now).await.unwrap();
    }
    handler.run(&ctx, &task, &mut Storage::new()).await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_log_mailer_empties_queue() {
    let persistence = memory_persistence().await;
    let ctx = context(persistence.clone());
    for site in 1..=3 {
        ctx.notifier
            .enqueue_email(MailTemplate::CoreUpdateFound, Some(site), Map::new(), RecipientRule::site_admins())
            .await
            .unwrap();
    }
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::SendMail, "* * * * *")).await;

    let status = SendMailTask::new(Arc::new(vigil_workflows::LogMailer))
        .run(&ctx, &task, &mut Storage::new())
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert!(mail_items(persistence).await.is_empty());
}
