// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for vigil-workflows integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use vigil_core::persistence::{NewSite, Persistence, SqlitePersistence, TaskRecord};
use vigil_core::{
    CmsType, Config, MailMessage, NewTask, Queue, QueueType, SiteConfig, TaskContext, Timer,
};

/// In-memory SQLite persistence with migrations applied.
pub async fn memory_persistence() -> Arc<dyn Persistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    vigil_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

pub fn test_config() -> Config {
    let mut config = Config::with_database_url("sqlite::memory:");
    config.resume_delay = Duration::ZERO;
    config.runner_id = "test-runner".to_string();
    config
}

/// Context whose timer never runs out.
pub fn context(persistence: Arc<dyn Persistence>) -> TaskContext {
    TaskContext::new(persistence, Timer::unbounded(), Arc::new(test_config()))
}

/// Context whose timer is already spent.
pub fn expired_context(persistence: Arc<dyn Persistence>) -> TaskContext {
    TaskContext::new(persistence, Timer::new(Duration::ZERO, 100), Arc::new(test_config()))
}

/// Context whose timer runs out after `budget`.
pub fn budget_context(persistence: Arc<dyn Persistence>, budget: Duration) -> TaskContext {
    TaskContext::new(persistence, Timer::new(budget, 100), Arc::new(test_config()))
}

pub fn http() -> Client {
    vigil_remote::http_client(Duration::from_secs(10)).expect("http client")
}

/// Create a site at `url` with an API key merged into `config`.
pub async fn create_site(persistence: &dyn Persistence, url: &str, cms: CmsType, mut config: Value) -> i64 {
    config["config"]["apiKey"] = json!("test-token");
    persistence
        .create_site(&NewSite::new("Test site", url, cms).with_config(SiteConfig::from_value(config)))
        .await
        .expect("create site")
}

/// Create a one-off site task and read it back.
pub async fn create_task(persistence: &dyn Persistence, task: NewTask) -> TaskRecord {
    let id = persistence.create_task(&task, Utc::now()).await.expect("create task");
    persistence.get_task(id).await.expect("get task").expect("task exists")
}

/// Drain the mail queue.
pub async fn queued_mail(persistence: Arc<dyn Persistence>) -> Vec<MailMessage> {
    let queue = Queue::new(persistence, QueueType::Mail);
    let mut messages = Vec::new();
    while let Some(message) = queue.pop::<MailMessage>().await.expect("pop mail") {
        messages.push(message);
    }
    messages
}

/// JSON:API success envelope around `attributes`.
pub fn envelope(attributes: Value) -> Value {
    json!({"data": {"type": "panopticon", "attributes": attributes}})
}

/// JSON:API list envelope.
pub fn list_envelope(items: Vec<Value>) -> Value {
    json!({"data": items.into_iter().map(|a| json!({"type": "item", "attributes": a})).collect::<Vec<_>>()})
}
