// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Core - Resumable Task Engine
//!
//! This crate provides the engine behind vigil's site fleet maintenance. The
//! host process is started by an external cron trigger with a bounded
//! execution budget, so every unit of work must be able to stop after a time
//! slice and pick up later from state it persisted itself.
//!
//! # Architecture
//!
//! ```text
//!      cron trigger
//!           │
//!           ▼
//! ┌───────────────────┐   claim / release   ┌──────────────────────┐
//! │    TaskRunner     │◄───────────────────►│  Persistence         │
//! │  (failure bound.) │                     │  (SQLite/PostgreSQL) │
//! └───────────────────┘                     │  tasks  sites  queue │
//!           │ (task, storage)               │  reports  push_subs  │
//!           ▼                               └──────────────────────┘
//! ┌───────────────────┐   push / pop / claim_sites    ▲
//! │   TaskHandler     │───────────────────────────────┘
//! │ (registered per   │
//! │  TaskType)        │
//! └───────────────────┘
//! ```
//!
//! # Building blocks
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`timer`] | Biased execution budget for one invocation |
//! | [`status`] | Closed set of persisted outcome codes |
//! | [`storage`] | Per-task JSON continuation state |
//! | [`task`] | Task types, params, cron scheduling |
//! | [`site`] | Site config document and compare-and-swap updates |
//! | [`queue`] | Durable, partitioned work queue |
//! | [`claim`] | Disjoint batch selection of sites across overlapping runs |
//! | [`handler`] | Handler trait, registry and error classification |
//! | [`runner`] | Claims due tasks and maps handler results to statuses |
//! | [`notify`] | Mail queue producer |
//!
//! # Status contract
//!
//! A handler returns `OK` when finished, `WILL_RESUME` when it wants another
//! slice, or an error. The runner never retries an error on its own: the task
//! is knocked out until an operator or a director task re-arms it.

pub mod claim;
pub mod config;
pub mod error;
pub mod handler;
pub mod migrations;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod site;
pub mod status;
pub mod storage;
pub mod task;
pub mod timer;

pub use claim::{ClaimPurpose, ClaimRequest};
pub use config::{Config, ConfigError};
pub use error::{CoreError, Result};
pub use handler::{ErrorKind, HandlerRegistry, TaskContext, TaskError, TaskHandler};
pub use notify::{MailMessage, MailTemplate, Notifier, RecipientRule};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use queue::{Queue, QueueType, When};
pub use retry::{RetryConfig, RetryStrategy};
pub use runner::{RunSummary, TaskRunner};
pub use site::{CmsType, CoreUpdatePreference, SiteConfig};
pub use status::Status;
pub use storage::Storage;
pub use task::{NewTask, RunOnce, TaskParams, TaskType};
pub use timer::Timer;
