// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for remote site calls.

use thiserror::Error;
use vigil_core::TaskError;

/// Errors talking to a managed site.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// Transport failure: DNS, TLS, connect or total timeout.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status without a usable error document.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The site answered with an `errors[]` document.
    #[error("Remote API error (HTTP {status}): {message}")]
    Api {
        /// Status code.
        status: u16,
        /// First error's title or detail.
        message: String,
    },

    /// The response is not what the API promises.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// An encrypted payload could not be decoded with the shared secret.
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The site record cannot be used for remote calls.
    #[error("Site misconfigured: {0}")]
    Site(String),

    /// Saving what the site answered failed locally.
    #[error("Persistence error: {0}")]
    Persistence(#[from] vigil_core::CoreError),
}

impl RemoteError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Http(e) => e.status().map(|s| s.as_u16()),
            RemoteError::Status { status, .. } | RemoteError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RemoteError> for TaskError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Decryption(_) => TaskError::integrity(e.to_string()),
            _ => TaskError::transient(e.to_string()),
        }
    }
}
