// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for vigil-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use vigil_core::persistence::{NewSite, Persistence, SqlitePersistence};
use vigil_core::{CmsType, Config, SiteConfig};

/// In-memory SQLite persistence with migrations applied.
pub async fn memory_persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    vigil_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

/// Configuration tuned for tests: immediate resumption, fixed runner id.
pub fn test_config() -> Config {
    let mut config = Config::with_database_url("sqlite::memory:");
    config.resume_delay = Duration::ZERO;
    config.runner_id = "test-runner".to_string();
    config
}

/// Create `count` enabled Joomla sites with empty configs.
pub async fn create_sites(persistence: &dyn Persistence, count: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let id = persistence
            .create_site(
                &NewSite::new(format!("site-{n}"), format!("https://site{n}.test"), CmsType::Joomla)
                    .with_config(SiteConfig::default()),
            )
            .await
            .expect("create site");
        ids.push(id);
    }
    ids
}
