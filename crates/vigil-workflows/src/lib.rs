// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Workflows - task handlers for site fleet maintenance
//!
//! Every handler here is registered against one [`vigil_core::TaskType`] and
//! runs in slices bounded by the invocation timer:
//!
//! | Task | Handler | Kind |
//! |------|---------|------|
//! | `refreshsiteinfo` | [`site_info::RefreshSiteInfoTask`] | batched fan-out |
//! | `coreupdatedirector` | [`core_update_director::CoreUpdateDirectorTask`] | batched director |
//! | `joomlaupdate` | [`joomla_update::JoomlaUpdateTask`] | state machine |
//! | `wordpressupdate` | [`wordpress_update::WordPressUpdateTask`] | state machine |
//! | `akeebabackup` | [`backup::AkeebaBackupTask`] | start/step loop |
//! | `extensionupdatesdirector` | [`extensions::ExtensionUpdatesDirectorTask`] | batched director |
//! | `extensionsupdate` | [`extensions::ExtensionsUpdateTask`] | queue consumer |
//! | `sendmail` | [`mail::SendMailTask`] | queue consumer |
//! | `webpush` | [`webpush::WebPushTask`] | queue consumer |
//! | `filescanner` | [`file_scanner::FileScannerTask`] | start/step loop |
//!
//! The update state machines share their common states through [`fsm`].

pub mod backup;
pub mod core_update_director;
pub mod delivery;
pub mod extensions;
pub mod file_scanner;
pub mod fsm;
pub mod joomla_update;
pub mod mail;
pub mod registry;
pub mod report;
pub mod site_batch;
pub mod site_info;
pub mod version;
pub mod webpush;
pub mod wordpress_update;

pub use delivery::DeliveryError;
pub use fsm::{UpdateWorkflow, WorkflowHook};
pub use mail::{LogMailer, Mailer};
pub use registry::{build_registry, ensure_system_tasks};
pub use webpush::{HttpPushTransport, PushMessage, PushTransport};
