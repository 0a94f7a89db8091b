// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site claim protocol: batching, stamping and disjointness.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use vigil_core::persistence::{Persistence, SqlitePersistence};
use vigil_core::{ClaimPurpose, ClaimRequest};

use common::{create_sites, memory_persistence};

const STALENESS: Duration = Duration::from_secs(900);

#[tokio::test]
async fn test_claim_batches_of_fifty_then_remainder() {
    let persistence = memory_persistence().await;
    let sites = create_sites(persistence.as_ref(), 60).await;
    let now = Utc::now();

    let request = ClaimRequest::new(ClaimPurpose::SiteInfo, 50, STALENESS).at(now);

    let first = persistence.claim_sites(&request).await.unwrap();
    assert_eq!(first.len(), 50);
    assert_eq!(first, sites[..50].to_vec());

    // Exactly the claimed sites carry the stamp.
    for site in persistence.list_sites().await.unwrap() {
        let stamp = site
            .site_config()
            .unwrap()
            .get_f64(&["core", "lastAttempt"]);
        if first.contains(&site.id) {
            assert_eq!(stamp, Some(now.timestamp() as f64), "site {}", site.id);
        } else {
            assert_eq!(stamp, None, "site {}", site.id);
        }
    }

    let second = persistence.claim_sites(&request).await.unwrap();
    assert_eq!(second, sites[50..].to_vec());

    let third = persistence.claim_sites(&request).await.unwrap();
    assert!(third.is_empty());
}

#[tokio::test]
async fn test_claim_pagination_with_limit_start() {
    let persistence = memory_persistence().await;
    let sites = create_sites(persistence.as_ref(), 5).await;

    // Forced claims do not filter on staleness, so offsets walk the whole fleet.
    let page = |start| {
        ClaimRequest::new(ClaimPurpose::CoreUpdates, 2, STALENESS)
            .forced(true)
            .starting_at(start)
    };

    assert_eq!(persistence.claim_sites(&page(0)).await.unwrap(), sites[0..2].to_vec());
    assert_eq!(persistence.claim_sites(&page(2)).await.unwrap(), sites[2..4].to_vec());
    assert_eq!(persistence.claim_sites(&page(4)).await.unwrap(), sites[4..].to_vec());
    assert!(persistence.claim_sites(&page(6)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_stamps_become_eligible_again() {
    let persistence = memory_persistence().await;
    let sites = create_sites(persistence.as_ref(), 3).await;
    let earlier = Utc::now() - chrono::Duration::hours(1);

    let request = ClaimRequest::new(ClaimPurpose::SiteInfo, 10, STALENESS).at(earlier);
    assert_eq!(persistence.claim_sites(&request).await.unwrap(), sites);

    let now_request = ClaimRequest::new(ClaimPurpose::SiteInfo, 10, STALENESS);
    assert_eq!(persistence.claim_sites(&now_request).await.unwrap(), sites);
    assert!(persistence.claim_sites(&now_request).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_disjoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("claims.db");

    let a = Arc::new(SqlitePersistence::from_path(&path).await.unwrap());
    let b = Arc::new(SqlitePersistence::from_path(&path).await.unwrap());
    let sites = create_sites(a.as_ref(), 40).await;

    let mut handles = Vec::new();
    for persistence in [a.clone(), b.clone(), a.clone(), b.clone()] {
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let request = ClaimRequest::new(ClaimPurpose::SiteInfo, 3, STALENESS);
                let batch = persistence.claim_sites(&request).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "site {id} claimed twice");
        }
    }

    assert_eq!(total, sites.len());
    assert_eq!(seen, sites.into_iter().collect::<HashSet<_>>());
}
