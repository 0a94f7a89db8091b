// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Optimistic site config updates.

mod common;

use vigil_core::persistence::Persistence;
use vigil_core::site::update_site_config;
use vigil_core::{CoreError, RetryConfig};

use common::{create_sites, memory_persistence};

#[tokio::test]
async fn test_update_applies_mutation() {
    let persistence = memory_persistence().await;
    let site = create_sites(persistence.as_ref(), 1).await[0];

    let config = update_site_config(persistence.as_ref(), site, &RetryConfig::config_save(), |c| {
        c.set(&["core", "php"], "8.3");
    })
    .await
    .unwrap();
    assert_eq!(config.get_str(&["core", "php"]).as_deref(), Some("8.3"));

    let stored = persistence.get_site(site).await.unwrap().unwrap();
    assert_eq!(
        stored.site_config().unwrap().get_str(&["core", "php"]).as_deref(),
        Some("8.3")
    );
}

#[tokio::test]
async fn test_missing_site() {
    let persistence = memory_persistence().await;
    let err = update_site_config(persistence.as_ref(), 99, &RetryConfig::config_save(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SiteNotFound(99)));
}
