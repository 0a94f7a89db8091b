// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task types, parameters and scheduling helpers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Cron expression given to one-off tasks. They run at `next_execution` and
/// are disabled or deleted on completion, so the expression only matters if
/// an operator re-enables one without rescheduling it.
pub const ONE_OFF_CRON: &str = "0 0 1 1 *";

/// Closed set of task kinds. Each maps to exactly one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Refresh core version information for a batch of sites.
    RefreshSiteInfo,
    /// Decide which sites get an automatic core update.
    CoreUpdateDirector,
    /// Joomla core update workflow for one site.
    JoomlaUpdate,
    /// WordPress core update workflow for one site.
    WordPressUpdate,
    /// Resumable remote backup for one site.
    AkeebaBackup,
    /// Enqueue extension updates for a batch of sites.
    ExtensionUpdatesDirector,
    /// Install queued extension updates for one site.
    ExtensionsUpdate,
    /// Drain the outbound mail queue.
    SendMail,
    /// Drain the web push queue.
    WebPush,
    /// Resumable remote file integrity scan for one site.
    FileScanner,
}

impl TaskType {
    /// All task types.
    pub const ALL: [TaskType; 10] = [
        TaskType::RefreshSiteInfo,
        TaskType::CoreUpdateDirector,
        TaskType::JoomlaUpdate,
        TaskType::WordPressUpdate,
        TaskType::AkeebaBackup,
        TaskType::ExtensionUpdatesDirector,
        TaskType::ExtensionsUpdate,
        TaskType::SendMail,
        TaskType::WebPush,
        TaskType::FileScanner,
    ];

    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::RefreshSiteInfo => "refreshsiteinfo",
            TaskType::CoreUpdateDirector => "coreupdatedirector",
            TaskType::JoomlaUpdate => "joomlaupdate",
            TaskType::WordPressUpdate => "wordpressupdate",
            TaskType::AkeebaBackup => "akeebabackup",
            TaskType::ExtensionUpdatesDirector => "extensionupdatesdirector",
            TaskType::ExtensionsUpdate => "extensionsupdate",
            TaskType::SendMail => "sendmail",
            TaskType::WebPush => "webpush",
            TaskType::FileScanner => "filescanner",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTaskType(s.to_string()))
    }
}

/// What happens to a one-off task once it finishes with OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOnce {
    /// Keep the row, disabled.
    Disable,
    /// Delete the row.
    Delete,
}

impl RunOnce {
    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            RunOnce::Disable => "disable",
            RunOnce::Delete => "delete",
        }
    }
}

/// Immutable task parameters, fixed at scheduling time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskParams(Map<String, Value>);

impl TaskParams {
    /// Empty parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse persisted parameters. Empty text yields empty parameters.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed)
    }

    /// Serialize for persistence.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Set a parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw parameter.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String parameter. Numbers are rendered as text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Integer parameter, accepting numeric strings.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean parameter, accepting `1`/`0` and `"true"`/`"false"`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => false,
        }
    }

    /// Target version of an update task.
    pub fn to_version(&self) -> Option<String> {
        self.get_str("to_version")
    }

    /// User who scheduled the task, if any.
    pub fn initiating_user(&self) -> Option<i64> {
        self.get_i64("initiating_user")
    }

    /// Operator-forced run.
    pub fn force(&self) -> bool {
        self.get_bool("force")
    }

    /// One-off disposition.
    pub fn run_once(&self) -> Option<RunOnce> {
        match self.get_str("run_once")?.as_str() {
            "disable" => Some(RunOnce::Disable),
            "delete" => Some(RunOnce::Delete),
            _ => None,
        }
    }
}

/// Next occurrence of `expression` strictly after `after`.
pub fn next_cron_run(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CoreError> {
    let cron = Cron::new(expression)
        .parse()
        .map_err(|e| CoreError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

    cron.find_next_occurrence(&after, false)
        .map_err(|e| CoreError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

/// A task to be scheduled.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Handler selector.
    pub task_type: TaskType,
    /// Site the task works on, if site-scoped.
    pub site_id: Option<i64>,
    /// Recurrence.
    pub cron_expression: String,
    /// First due time. `None` means due immediately.
    pub next_execution: Option<DateTime<Utc>>,
    /// Parameters.
    pub params: TaskParams,
    /// Whether the task starts enabled.
    pub enabled: bool,
    /// Lower runs first.
    pub priority: i32,
}

impl NewTask {
    /// Recurring task with the given cron expression.
    pub fn recurring(task_type: TaskType, cron_expression: impl Into<String>) -> Self {
        Self {
            task_type,
            site_id: None,
            cron_expression: cron_expression.into(),
            next_execution: None,
            params: TaskParams::default(),
            enabled: true,
            priority: 0,
        }
    }

    /// One-off task, due immediately, disabled when it finishes.
    pub fn one_off(task_type: TaskType) -> Self {
        let mut task = Self::recurring(task_type, ONE_OFF_CRON);
        task.params.insert("run_once", RunOnce::Disable.as_str());
        task
    }

    /// Scope the task to a site.
    pub fn site(mut self, site_id: i64) -> Self {
        self.site_id = Some(site_id);
        self
    }

    /// Add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Change the one-off disposition.
    pub fn run_once(mut self, disposition: RunOnce) -> Self {
        self.params.insert("run_once", disposition.as_str());
        self
    }

    /// Set the first due time.
    pub fn due_at(mut self, when: DateTime<Utc>) -> Self {
        self.next_execution = Some(when);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Create the task disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_task_type_names_round_trip() {
        for task_type in TaskType::ALL {
            assert_eq!(task_type.as_str().parse::<TaskType>().unwrap(), task_type);
        }
        assert!(matches!(
            "nosuchtask".parse::<TaskType>(),
            Err(CoreError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_params_accessors() {
        let params = TaskParams::from_json_str(
            r#"{"to_version": "4.0.4", "initiating_user": "12", "force": 1, "run_once": "delete"}"#,
        )
        .unwrap();

        assert_eq!(params.to_version().as_deref(), Some("4.0.4"));
        assert_eq!(params.initiating_user(), Some(12));
        assert!(params.force());
        assert_eq!(params.run_once(), Some(RunOnce::Delete));
        assert!(TaskParams::from_json_str("").unwrap().run_once().is_none());
    }

    #[test]
    fn test_one_off_builder() {
        let task = NewTask::one_off(TaskType::JoomlaUpdate)
            .site(3)
            .param("to_version", "5.1.0");

        assert_eq!(task.site_id, Some(3));
        assert_eq!(task.params.run_once(), Some(RunOnce::Disable));
        assert_eq!(task.params.to_version().as_deref(), Some("5.1.0"));
        assert_eq!(task.cron_expression, ONE_OFF_CRON);
        assert!(task.enabled);
    }

    #[test]
    fn test_next_cron_run_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let next = next_cron_run("*/5 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap());

        let hourly = next_cron_run("0 * * * *", after).unwrap();
        assert_eq!(hourly.hour(), 11);
    }

    #[test]
    fn test_invalid_cron() {
        let err = next_cron_run("not a cron", Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidCron { .. }));
    }
}
