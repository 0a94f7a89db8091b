// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable work queue.
//!
//! Items live in the `queue` table, partitioned by queue name. A pop removes
//! the row in the same statement that selects it, so each item reaches at
//! most one consumer. There is no visibility timeout: a consumer that crashes
//! after popping loses the item, and retries are the consumer's job (re-push
//! a mutated copy).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::Result;
use crate::persistence::{Persistence, QueueItem};

/// Named queue partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// Extension updates pending for one site.
    Extensions(i64),
    /// Outbound email.
    Mail,
    /// Outbound web push notifications.
    WebPush,
}

impl QueueType {
    /// Persisted queue name.
    pub fn name(&self) -> String {
        match self {
            QueueType::Extensions(site_id) => format!("extensions.{site_id}"),
            QueueType::Mail => "mail".to_string(),
            QueueType::WebPush => "webpush".to_string(),
        }
    }

    /// Site the partition belongs to.
    pub fn site_id(&self) -> Option<i64> {
        match self {
            QueueType::Extensions(site_id) => Some(*site_id),
            _ => None,
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// When a pushed item becomes poppable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    /// Immediately.
    Now,
    /// At a fixed time.
    At(DateTime<Utc>),
    /// After a delay from now.
    After(Duration),
}

impl When {
    fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            When::Now => now,
            When::At(at) => at,
            When::After(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now),
        }
    }
}

/// Handle on one queue partition.
#[derive(Clone)]
pub struct Queue {
    persistence: Arc<dyn Persistence>,
    queue_type: QueueType,
    name: String,
}

impl Queue {
    /// Open a queue partition.
    pub fn new(persistence: Arc<dyn Persistence>, queue_type: QueueType) -> Self {
        Self {
            persistence,
            queue_type,
            name: queue_type.name(),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition.
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Push an item.
    pub async fn push<T: Serialize + ?Sized>(&self, item: &T, when: When) -> Result<i64> {
        let data = serde_json::to_string(item)?;
        let now = Utc::now();
        self.persistence
            .queue_push(
                &self.name,
                self.queue_type.site_id(),
                &data,
                now,
                when.resolve(now),
            )
            .await
    }

    /// Pop the oldest available item as a raw row.
    pub async fn pop_item(&self) -> Result<Option<QueueItem>> {
        self.persistence.queue_pop(&self.name, Utc::now()).await
    }

    /// Pop the oldest available item and decode it.
    ///
    /// Items that fail to decode are dropped with a warning and the next one
    /// is tried, so a single poisoned payload cannot wedge the queue.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        while let Some(item) = self.pop_item().await? {
            match serde_json::from_str(&item.data) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    warn!(
                        queue = %self.name,
                        item_id = item.id,
                        error = %e,
                        "Dropping undecodable queue item"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Number of items, available or not.
    pub async fn count(&self) -> Result<usize> {
        let count = self.persistence.queue_count(&self.name).await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Number of items whose decoded payload satisfies `predicate`. Items
    /// that do not decode as `T` never match.
    pub async fn count_matching<T, F>(&self, predicate: F) -> Result<usize>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let items = self.persistence.queue_items(&self.name).await?;
        Ok(items
            .iter()
            .filter_map(|item| serde_json::from_str::<T>(&item.data).ok())
            .filter(|value| predicate(value))
            .count())
    }

    /// Remove every item.
    pub async fn clear(&self) -> Result<u64> {
        self.persistence.queue_clear(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde::Deserialize;
    use sqlx::sqlite::SqlitePoolOptions;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ExtensionItem {
        extension_id: i64,
        version: String,
    }

    async fn test_queue(queue_type: QueueType) -> Queue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE.run(&pool).await.expect("migrations");
        Queue::new(Arc::new(SqlitePersistence::new(pool)), queue_type)
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(QueueType::Extensions(42).name(), "extensions.42");
        assert_eq!(QueueType::Extensions(42).site_id(), Some(42));
        assert_eq!(QueueType::Mail.to_string(), "mail");
        assert_eq!(QueueType::WebPush.name(), "webpush");
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let queue = test_queue(QueueType::Extensions(1)).await;
        for id in 1..=3 {
            queue
                .push(
                    &ExtensionItem {
                        extension_id: id,
                        version: "1.0".into(),
                    },
                    When::Now,
                )
                .await
                .unwrap();
        }

        assert_eq!(queue.count().await.unwrap(), 3);
        let first: ExtensionItem = queue.pop().await.unwrap().unwrap();
        assert_eq!(first.extension_id, 1);
        let second: ExtensionItem = queue.pop().await.unwrap().unwrap();
        assert_eq!(second.extension_id, 2);
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_items_are_not_popped() {
        let queue = test_queue(QueueType::Mail).await;
        queue
            .push(&serde_json::json!({"n": 1}), When::After(Duration::from_secs(3600)))
            .await
            .unwrap();

        let popped: Option<serde_json::Value> = queue.pop().await.unwrap();
        assert!(popped.is_none());
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_matching_and_clear() {
        let queue = test_queue(QueueType::Extensions(9)).await;
        queue
            .push(
                &ExtensionItem {
                    extension_id: 5,
                    version: "2.0".into(),
                },
                When::Now,
            )
            .await
            .unwrap();
        queue.push(&serde_json::json!({"unrelated": true}), When::Now).await.unwrap();

        let pending = queue
            .count_matching(|item: &ExtensionItem| item.extension_id == 5)
            .await
            .unwrap();
        assert_eq!(pending, 1);
        let none = queue
            .count_matching(|item: &ExtensionItem| item.extension_id == 6)
            .await
            .unwrap();
        assert_eq!(none, 0);

        assert_eq!(queue.clear().await.unwrap(), 2);
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_items_are_skipped() {
        let queue = test_queue(QueueType::Extensions(3)).await;
        queue.push(&serde_json::json!({"garbage": 1}), When::Now).await.unwrap();
        queue
            .push(
                &ExtensionItem {
                    extension_id: 8,
                    version: "3.1".into(),
                },
                When::Now,
            )
            .await
            .unwrap();

        let item: ExtensionItem = queue.pop().await.unwrap().unwrap();
        assert_eq!(item.extension_id, 8);
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
