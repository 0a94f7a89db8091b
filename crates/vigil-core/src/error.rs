// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vigil-core.

use thiserror::Error;

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer and the engine plumbing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored JSON document could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Task was not found.
    #[error("Task {0} not found")]
    TaskNotFound(i64),

    /// Site was not found.
    #[error("Site {0} not found")]
    SiteNotFound(i64),

    /// A task row carries a type no handler knows about.
    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    /// A site row carries an unsupported CMS type.
    #[error("Unknown CMS type '{0}'")]
    UnknownCmsType(String),

    /// Cron expression could not be parsed or has no next occurrence.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// Optimistic site config update kept losing to concurrent writers.
    #[error("Config of site {site_id} changed concurrently on every one of {attempts} attempts")]
    ConfigContention {
        /// Site whose config could not be saved.
        site_id: i64,
        /// Attempts made.
        attempts: u32,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}
