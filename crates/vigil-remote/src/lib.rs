// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vigil Remote - talking to managed sites
//!
//! Every managed site runs a small connector extension that exposes a JSON:API
//! style management API. This crate holds the client side of that API:
//!
//! - [`api`]: per-site client with CMS-specific endpoints and authentication,
//!   plus envelope parsing
//! - [`fanout`]: bounded-concurrency requests against many sites with per-site
//!   continuations and a single join point
//! - [`legacy_cipher`]: the encrypted envelope spoken by old `restore.php`
//!   extraction scripts
//!
//! Timeouts of every outbound call derive from the invocation budget, see
//! [`api::http_client`].

pub mod api;
pub mod error;
pub mod fanout;
pub mod legacy_cipher;

pub use api::{SiteClient, http_client, parse_envelope};
pub use error::RemoteError;
pub use fanout::{FanOut, SiteContinuation, SiteOutcome};
pub use legacy_cipher::LegacyCipher;
