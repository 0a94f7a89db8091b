// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task handler seam.
//!
//! A handler is a function of `(task, storage)` returning a [`Status`]. It
//! may mutate storage freely; the runner persists whatever it leaves behind,
//! whether the handler returned normally or raised an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::CoreError;
use crate::notify::Notifier;
use crate::persistence::{Persistence, TaskRecord};
use crate::status::Status;
use crate::storage::Storage;
use crate::task::TaskType;
use crate::timer::Timer;

/// Classification of handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The work stopped for an expected reason; nobody needs to be told.
    ExpectedStop,
    /// Remote, network or malformed-response failure.
    Transient,
    /// Data failed an integrity check (decryption, checksum, changed ids).
    Integrity,
    /// Internal inconsistency such as missing state data.
    Logic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::ExpectedStop => "expected stop",
            ErrorKind::Transient => "transient",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Logic => "logic",
        })
    }
}

/// Error raised by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TaskError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl TaskError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Expected, non-notifying stop.
    pub fn expected_stop(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExpectedStop, message)
    }

    /// Remote or network failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Integrity check failure.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    /// Internal inconsistency.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Logic, message)
    }

    /// Whether the failure should reach a human.
    pub fn is_notifying(&self) -> bool {
        self.kind != ErrorKind::ExpectedStop
    }
}

impl From<CoreError> for TaskError {
    fn from(e: CoreError) -> Self {
        TaskError::transient(e.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::transient(format!("Malformed data: {e}"))
    }
}

/// Everything a handler may touch besides its own task and storage.
#[derive(Clone)]
pub struct TaskContext {
    /// Persistence layer.
    pub persistence: Arc<dyn Persistence>,
    /// Budget of the current invocation.
    pub timer: Timer,
    /// Mail queue producer.
    pub notifier: Notifier,
    /// Engine configuration.
    pub config: Arc<Config>,
}

impl TaskContext {
    /// Build a context.
    pub fn new(persistence: Arc<dyn Persistence>, timer: Timer, config: Arc<Config>) -> Self {
        Self {
            notifier: Notifier::new(persistence.clone()),
            persistence,
            timer,
            config,
        }
    }
}

/// A resumable unit of work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type served by this handler.
    fn task_type(&self) -> TaskType;

    /// Run one slice of the task. Returning [`Status::WillResume`] asks to be
    /// called again soon with the storage as left behind.
    async fn run(
        &self,
        ctx: &TaskContext,
        task: &TaskRecord,
        storage: &mut Storage,
    ) -> Result<Status, TaskError>;
}

/// Maps task types to handlers. Built once at process start.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own task type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(handler.task_type(), handler);
        self
    }

    /// Builder-style registration.
    pub fn with(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Handler for a task type.
    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    /// Registered task types.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(TaskType);

    #[async_trait]
    impl TaskHandler for Noop {
        fn task_type(&self) -> TaskType {
            self.0
        }

        async fn run(
            &self,
            _ctx: &TaskContext,
            _task: &TaskRecord,
            _storage: &mut Storage,
        ) -> Result<Status, TaskError> {
            Ok(Status::Ok)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Noop(TaskType::SendMail)))
            .with(Arc::new(Noop(TaskType::WebPush)));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(TaskType::SendMail).is_some());
        assert!(registry.get(TaskType::JoomlaUpdate).is_none());
        assert_eq!(registry.task_types(), vec![TaskType::SendMail, TaskType::WebPush]);
    }

    #[test]
    fn test_error_classification() {
        assert!(!TaskError::expected_stop("site disabled").is_notifying());
        assert!(TaskError::transient("timeout").is_notifying());
        assert!(TaskError::logic("missing factory").is_notifying());

        let from_core: TaskError = CoreError::SiteNotFound(3).into();
        assert_eq!(from_core.kind, ErrorKind::Transient);
        assert_eq!(TaskError::integrity("bad").to_string(), "integrity error: bad");
    }
}
