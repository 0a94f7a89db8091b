// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification boundary.
//!
//! Workflows never send mail themselves. They describe the message (template
//! key, variables, who should get it) and push it onto the `mail` queue; the
//! mail consumer task renders and delivers it later.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Result;
use crate::persistence::Persistence;
use crate::queue::{Queue, QueueType, When};

/// Mail template keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailTemplate {
    /// A core update is available and the site asked to be told.
    CoreUpdateFound,
    /// A core update was installed.
    CoreUpdateInstalled,
    /// A core update failed.
    CoreUpdateFailed,
    /// Extension updates were installed.
    ExtensionUpdateInstalled,
    /// An extension update failed.
    ExtensionUpdateFailed,
    /// A backup failed.
    BackupFailed,
    /// A file integrity scan finished.
    ScanFinished,
}

impl MailTemplate {
    /// Template key.
    pub fn as_str(self) -> &'static str {
        match self {
            MailTemplate::CoreUpdateFound => "core_update_found",
            MailTemplate::CoreUpdateInstalled => "core_update_installed",
            MailTemplate::CoreUpdateFailed => "core_update_failed",
            MailTemplate::ExtensionUpdateInstalled => "extension_update_installed",
            MailTemplate::ExtensionUpdateFailed => "extension_update_failed",
            MailTemplate::BackupFailed => "backup_failed",
            MailTemplate::ScanFinished => "scan_finished",
        }
    }
}

/// Who receives a message: users holding any of `permissions` on the site,
/// plus explicit user ids and carbon copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRule {
    /// Site permissions that qualify a user.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Users added regardless of permissions.
    #[serde(default)]
    pub user_ids: Vec<i64>,
    /// Extra addresses.
    #[serde(default)]
    pub cc: Vec<String>,
}

impl RecipientRule {
    /// Users allowed to administer the site.
    pub fn site_admins() -> Self {
        Self {
            permissions: vec!["panopticon.super".into(), "panopticon.admin".into()],
            ..Self::default()
        }
    }

    /// Add the user who started the action, if known.
    pub fn with_user(mut self, user_id: Option<i64>) -> Self {
        if let Some(id) = user_id
            && !self.user_ids.contains(&id)
        {
            self.user_ids.push(id);
        }
        self
    }

    /// Add carbon copy addresses.
    pub fn with_cc(mut self, cc: impl IntoIterator<Item = String>) -> Self {
        self.cc.extend(cc);
        self
    }
}

/// Queued mail message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Template key.
    pub template: MailTemplate,
    /// Site the message is about.
    pub site_id: Option<i64>,
    /// Template variables.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Recipients.
    #[serde(default)]
    pub recipients: RecipientRule,
    /// Delivery attempts already failed.
    #[serde(default)]
    pub retries: u32,
}

/// Pushes mail onto the `mail` queue.
#[derive(Clone)]
pub struct Notifier {
    queue: Queue,
}

impl Notifier {
    /// Notifier backed by the given persistence.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            queue: Queue::new(persistence, QueueType::Mail),
        }
    }

    /// Queue an email for later rendering and delivery.
    pub async fn enqueue_email(
        &self,
        template: MailTemplate,
        site_id: Option<i64>,
        variables: Map<String, Value>,
        recipients: RecipientRule,
    ) -> Result<i64> {
        let message = MailMessage {
            template,
            site_id,
            variables,
            recipients,
            retries: 0,
        };
        let id = self.queue.push(&message, When::Now).await?;
        debug!(template = template.as_str(), site_id = ?site_id, queue_item = id, "Queued email");
        Ok(id)
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn test_message_defaults_on_decode() {
        let message: MailMessage =
            serde_json::from_value(json!({"template": "core_update_failed", "site_id": 3})).unwrap();
        assert_eq!(message.template, MailTemplate::CoreUpdateFailed);
        assert_eq!(message.retries, 0);
        assert!(message.variables.is_empty());
        assert_eq!(
            serde_json::to_value(MailTemplate::CoreUpdateFound).unwrap(),
            json!(MailTemplate::CoreUpdateFound.as_str())
        );
    }

    #[test]
    fn test_recipient_rule_builders() {
        let rule = RecipientRule::site_admins()
            .with_user(Some(4))
            .with_user(Some(4))
            .with_user(None)
            .with_cc(vec!["ops@example.com".to_string()]);
        assert_eq!(rule.user_ids, vec![4]);
        assert_eq!(rule.cc.len(), 1);
        assert_eq!(rule.permissions.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_email_lands_on_mail_queue() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::SQLITE.run(&pool).await.unwrap();
        let notifier = Notifier::new(Arc::new(SqlitePersistence::new(pool)));

        let mut vars = Map::new();
        vars.insert("NEW_VERSION".into(), json!("5.1.0"));
        notifier
            .enqueue_email(MailTemplate::CoreUpdateFound, Some(2), vars, RecipientRule::site_admins())
            .await
            .unwrap();

        assert_eq!(notifier.queue().count().await.unwrap(), 1);
        let message: MailMessage = notifier.queue().pop().await.unwrap().unwrap();
        assert_eq!(message.site_id, Some(2));
        assert_eq!(message.variables["NEW_VERSION"], json!("5.1.0"));
    }
}
