// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed sites and their configuration document.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;
use crate::retry::RetryConfig;

/// Supported content management systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmsType {
    /// Joomla!
    Joomla,
    /// WordPress
    WordPress,
}

impl CmsType {
    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            CmsType::Joomla => "joomla",
            CmsType::WordPress => "wordpress",
        }
    }
}

impl fmt::Display for CmsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CmsType {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "joomla" => Ok(CmsType::Joomla),
            "wordpress" => Ok(CmsType::WordPress),
            other => Err(CoreError::UnknownCmsType(other.to_string())),
        }
    }
}

/// Site preference for automatic core updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreUpdatePreference {
    /// Do nothing.
    None,
    /// Tell the site's admins an update is available.
    Email,
    /// Install patch releases automatically.
    Patch,
    /// Install minor and patch releases automatically.
    Minor,
    /// Install every release automatically.
    Major,
}

impl CoreUpdatePreference {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "email" => Some(Self::Email),
            "patch" => Some(Self::Patch),
            "minor" => Some(Self::Minor),
            "major" => Some(Self::Major),
            _ => None,
        }
    }
}

/// HTTP basic credentials stored for a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Nested JSON configuration of a site.
///
/// Paths are addressed by segment, e.g. `["core", "latest", "version"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteConfig(Value);

impl Default for SiteConfig {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl SiteConfig {
    /// Parse the persisted document. Empty text yields an empty object.
    pub fn from_json_str(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(trimmed)?;
        Ok(match value {
            Value::Object(_) => Self(value),
            _ => Self::default(),
        })
    }

    /// Wrap a JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => Self(value),
            _ => Self::default(),
        }
    }

    /// Serialize for persistence.
    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    /// Underlying document.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Value at a path.
    pub fn pointer(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.0, |node, segment| node.as_object()?.get(*segment))
    }

    /// String at a path. Numbers are rendered as text.
    pub fn get_str(&self, path: &[&str]) -> Option<String> {
        match self.pointer(path)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Boolean at a path, accepting `1`/`0`.
    pub fn get_bool(&self, path: &[&str]) -> bool {
        match self.pointer(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
            _ => false,
        }
    }

    /// Number at a path.
    pub fn get_f64(&self, path: &[&str]) -> Option<f64> {
        match self.pointer(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Set the value at a path, creating intermediate objects. Non-object
    /// intermediates are replaced.
    pub fn set(&mut self, path: &[&str], value: impl Into<Value>) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut node = &mut self.0;
        for segment in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let Value::Object(map) = node else {
                return;
            };
            node = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value.into());
        }
    }

    /// Remove the value at a path.
    pub fn remove(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut node = &mut self.0;
        for segment in parents {
            node = node.as_object_mut()?.get_mut(*segment)?;
        }
        node.as_object_mut()?.remove(*last)
    }

    /// Installed core version.
    pub fn current_version(&self) -> Option<String> {
        self.get_str(&["core", "current", "version"])
    }

    /// Latest available core version.
    pub fn latest_version(&self) -> Option<String> {
        self.get_str(&["core", "latest", "version"])
    }

    /// Whether the site reported a core update it can install.
    pub fn can_upgrade(&self) -> bool {
        self.get_bool(&["core", "canUpgrade"])
    }

    /// Version the automatic update logic last acted upon.
    pub fn last_auto_update_version(&self) -> Option<String> {
        self.get_str(&["core", "lastAutoUpdateVersion"])
    }

    /// Whether a backup must be taken before updating.
    pub fn backup_on_update(&self) -> bool {
        self.get_bool(&["config", "backupOnUpdate"])
    }

    /// Automatic core update preference, `email` when unset.
    pub fn core_update_install(&self) -> CoreUpdatePreference {
        self.get_str(&["config", "coreUpdate", "install"])
            .and_then(|s| CoreUpdatePreference::parse(&s))
            .unwrap_or(CoreUpdatePreference::Email)
    }

    /// How extension updates are handled (`config.extensionUpdates.install`).
    /// Off when unset.
    pub fn extension_update_install(&self) -> CoreUpdatePreference {
        self.get_str(&["config", "extensionUpdates", "install"])
            .and_then(|s| CoreUpdatePreference::parse(&s))
            .unwrap_or(CoreUpdatePreference::None)
    }

    /// Whether to email after a successful core update. On when unset.
    pub fn email_after_update(&self) -> bool {
        match self.pointer(&["config", "coreUpdate", "email_after"]) {
            None => true,
            Some(_) => self.get_bool(&["config", "coreUpdate", "email_after"]),
        }
    }

    /// Whether to email after a failed core update. On when unset.
    pub fn email_on_error(&self) -> bool {
        match self.pointer(&["config", "coreUpdate", "email_error"]) {
            None => true,
            Some(_) => self.get_bool(&["config", "coreUpdate", "email_error"]),
        }
    }

    /// HTTP basic credentials, if both parts are set.
    pub fn basic_auth(&self) -> Option<BasicAuth> {
        let username = self.get_str(&["config", "basicAuth", "username"])?;
        let password = self.get_str(&["config", "basicAuth", "password"])?;
        Some(BasicAuth { username, password })
    }

    /// Remote API token.
    pub fn api_key(&self) -> Option<String> {
        self.get_str(&["config", "apiKey"])
    }
}

/// Load a site's config, apply `mutate`, and write it back with
/// compare-and-swap, retrying with backoff when another writer got there
/// first.
///
/// Mutations must be re-appliable: on a lost race the closure runs again
/// against the freshly loaded document.
pub async fn update_site_config<F>(
    persistence: &dyn Persistence,
    site_id: i64,
    retry: &RetryConfig,
    mut mutate: F,
) -> Result<SiteConfig>
where
    F: FnMut(&mut SiteConfig) + Send,
{
    let mut attempt: u32 = 0;
    loop {
        let site = persistence
            .get_site(site_id)
            .await?
            .ok_or(CoreError::SiteNotFound(site_id))?;

        let mut config = SiteConfig::from_json_str(&site.config)?;
        mutate(&mut config);
        let updated = config.to_json_string();

        if persistence
            .compare_and_set_site_config(site_id, &site.config, &updated)
            .await?
        {
            return Ok(config);
        }

        if !retry.allows(attempt) {
            return Err(CoreError::ConfigContention {
                site_id,
                attempts: attempt + 1,
            });
        }
        attempt += 1;

        let delay = retry.delay_for_attempt(attempt);
        debug!(site_id, attempt, delay_ms = delay.as_millis() as u64, "Site config changed concurrently, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_creates_intermediates() {
        let mut config = SiteConfig::default();
        config.set(&["core", "latest", "version"], "5.1.2");
        config.set(&["core", "canUpgrade"], true);

        assert_eq!(config.latest_version().as_deref(), Some("5.1.2"));
        assert!(config.can_upgrade());
        assert_eq!(
            config.as_value(),
            &json!({"core": {"latest": {"version": "5.1.2"}, "canUpgrade": true}})
        );
    }

    #[test]
    fn test_set_replaces_scalar_intermediate() {
        let mut config = SiteConfig::from_value(json!({"core": "broken"}));
        config.set(&["core", "php"], "8.2");
        assert_eq!(config.get_str(&["core", "php"]).as_deref(), Some("8.2"));
    }

    #[test]
    fn test_preferences_and_defaults() {
        let config = SiteConfig::default();
        assert_eq!(config.core_update_install(), CoreUpdatePreference::Email);
        assert_eq!(config.extension_update_install(), CoreUpdatePreference::None);
        assert!(config.email_after_update());
        assert!(config.email_on_error());
        assert!(!config.backup_on_update());
        assert!(config.basic_auth().is_none());

        let config = SiteConfig::from_value(json!({
            "config": {
                "coreUpdate": {"install": "minor", "email_after": 0},
                "backupOnUpdate": 1,
                "basicAuth": {"username": "admin", "password": "secret"},
                "apiKey": "token"
            }
        }));
        assert_eq!(config.core_update_install(), CoreUpdatePreference::Minor);
        assert!(!config.email_after_update());
        assert!(config.backup_on_update());
        assert_eq!(config.basic_auth().unwrap().username, "admin");
        assert_eq!(config.api_key().as_deref(), Some("token"));
    }

    #[test]
    fn test_remove() {
        let mut config = SiteConfig::from_value(json!({"core": {"lastErrorMessage": "x"}}));
        assert_eq!(config.remove(&["core", "lastErrorMessage"]), Some(json!("x")));
        assert_eq!(config.remove(&["core", "missing", "deeper"]), None);
    }

    #[test]
    fn test_cms_type_parse() {
        assert_eq!("Joomla".parse::<CmsType>().unwrap(), CmsType::Joomla);
        assert_eq!("wordpress".parse::<CmsType>().unwrap(), CmsType::WordPress);
        assert!("drupal".parse::<CmsType>().is_err());
    }
}
