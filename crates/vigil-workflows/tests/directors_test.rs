// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet-wide tasks: site info refresh, update directors, system bootstrap.

mod common;

use serde_json::json;
use vigil_core::persistence::Persistence;
use vigil_core::{
    CmsType, MailTemplate, NewTask, Queue, QueueType, Status, Storage, TaskHandler, TaskType,
};
use vigil_workflows::core_update_director::CoreUpdateDirectorTask;
use vigil_workflows::extensions::{
    ExtensionInfo, ExtensionUpdateItem, ExtensionUpdatesDirectorTask, ExtensionsUpdateTask,
};
use vigil_workflows::registry::{SYSTEM_TASKS, ensure_system_tasks};
use vigil_workflows::site_info::RefreshSiteInfoTask;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    context, create_site, create_task, envelope, http, list_envelope, memory_persistence, queued_mail,
};

const API: &str = "/api/index.php/v1/panopticon";

fn pending_update(current: &str, latest: &str, install: &str) -> serde_json::Value {
    json!({
        "core": {"current": {"version": current}, "latest": {"version": latest}, "canUpgrade": true},
        "config": {"coreUpdate": {"install": install}}
    })
}

#[tokio::test]
async fn test_refresh_site_info_saves_versions_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{API}/core/update")))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({
            "current": "5.0.1", "latest": "5.1.0", "phpVersion": "8.2.10"
        }))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API}/extensions")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_envelope(vec![
            json!({"id": 12, "name": "Akeeba Backup", "version": {"current": "9.8.0", "new": "9.8.1"}}),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/favicon.ico"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let persistence = memory_persistence().await;
    let healthy = create_site(persistence.as_ref(), &server.uri(), CmsType::Joomla, json!({})).await;
    let broken = create_site(persistence.as_ref(), "http://127.0.0.1:9", CmsType::Joomla, json!({})).await;
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::RefreshSiteInfo, "* * * * *")).await;

    let status = RefreshSiteInfoTask::new(http())
        .run(&context(persistence.clone()), &task, &mut Storage::new())
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);

    let config = persistence.get_site(healthy).await.unwrap().unwrap().site_config().unwrap();
    assert_eq!(config.current_version().as_deref(), Some("5.0.1"));
    assert_eq!(config.latest_version().as_deref(), Some("5.1.0"));
    assert!(config.can_upgrade());
    assert_eq!(config.get_str(&["core", "php"]).as_deref(), Some("8.2.10"));
    assert!(config.get_str(&["core", "favicon"]).is_some());
    let extensions = ExtensionInfo::from_config(&config);
    assert_eq!(extensions.len(), 1);
    assert!(extensions[0].has_update());

    let config = persistence.get_site(broken).await.unwrap().unwrap().site_config().unwrap();
    assert!(config.get_str(&["core", "lastErrorMessage"]).is_some());
    assert!(config.current_version().is_none());
}

#[tokio::test]
async fn test_core_director_schedules_patch_and_emails_otherwise() {
    let persistence = memory_persistence().await;
    let patch = create_site(persistence.as_ref(), "https://a.test", CmsType::Joomla, pending_update("4.2.0", "4.2.1", "patch")).await;
    let too_big = create_site(persistence.as_ref(), "https://b.test", CmsType::WordPress, pending_update("6.4.3", "6.5.0", "patch")).await;
    let opted_out = create_site(persistence.as_ref(), "https://c.test", CmsType::Joomla, pending_update("4.2.0", "4.2.1", "none")).await;
    let task = create_task(persistence.as_ref(), NewTask::recurring(TaskType::CoreUpdateDirector, "*/10 * * * *")).await;
    let ctx = context(persistence.clone());

    let status = CoreUpdateDirectorTask.run(&ctx, &task, &mut Storage::new()).await.unwrap();
    assert_eq!(status, Status::Ok);

    let scheduled = persistence.list_tasks(Some(TaskType::JoomlaUpdate), Some(patch)).await.unwrap();
    assert_eq!(scheduled.len(), 1);
    assert!(scheduled[0].enabled);
    assert_eq!(scheduled[0].params().unwrap().to_version().as_deref(), Some("4.2.1"));
    assert!(persistence.list_tasks(Some(TaskType::WordPressUpdate), Some(too_big)).await.unwrap().is_empty());
    assert!(persistence.list_tasks(Some(TaskType::JoomlaUpdate), Some(opted_out)).await.unwrap().is_empty());

    let mail = queued_mail(persistence.clone()).await;
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].template, MailTemplate::CoreUpdateFound);
    assert_eq!(mail[0].site_id, Some(too_big));

    for site_id in [patch, too_big, opted_out] {
        let config = persistence.get_site(site_id).await.unwrap().unwrap().site_config().unwrap();
        assert_eq!(config.last_auto_update_version(), config.latest_version());
    }

    // Stamped versions are not acted on twice.
    let again = create_task(persistence.as_ref(), NewTask::one_off(TaskType::CoreUpdateDirector).param("force", true)).await;
    CoreUpdateDirectorTask.run(&ctx, &again, &mut Storage::new()).await.unwrap();
    assert_eq!(persistence.list_tasks(Some(TaskType::JoomlaUpdate), Some(patch)).await.unwrap().len(), 1);
    assert!(queued_mail(persistence.clone()).await.is_empty());
}

#[tokio::test]
async fn test_extension_director_queues_once_and_consumer_installs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{API}/extensions/install")))
        .and(body_string_contains("id=12"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!({"status": true}))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API}/extensions")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_envelope(vec![
            json!({"id": 12, "name": "Akeeba Backup", "version": {"current": "9.8.1"}}),
        ])))
        .mount(&server)
        .await;

    let persistence = memory_persistence().await;
    let site_id = create_site(
        persistence.as_ref(),
        &server.uri(),
        CmsType::Joomla,
        json!({
            "config": {"extensionUpdates": {"install": "minor"}},
            "extensions": {"list": [
                {"id": 12, "name": "Akeeba Backup", "version": {"current": "9.8.0", "new": "9.8.1"}},
                {"id": 13, "name": "Major jump", "version": {"current": "1.4.0", "new": "2.0.0"}}
            ]}
        }),
    )
    .await;
    let ctx = context(persistence.clone());

    for _ in 0..2 {
        let director = create_task(
            persistence.as_ref(),
            NewTask::one_off(TaskType::ExtensionUpdatesDirector).param("force", true),
        )
        .await;
        ExtensionUpdatesDirectorTask.run(&ctx, &director, &mut Storage::new()).await.unwrap();
    }

    let queue = Queue::new(persistence.clone(), QueueType::Extensions(site_id));
    assert_eq!(queue.count().await.unwrap(), 1);
    assert_eq!(
        queue.count_matching(|item: &ExtensionUpdateItem| item.extension_id == 12).await.unwrap(),
        1
    );
    let consumers = persistence.list_tasks(Some(TaskType::ExtensionsUpdate), Some(site_id)).await.unwrap();
    assert_eq!(consumers.iter().filter(|t| t.enabled).count(), 1);

    let status = ExtensionsUpdateTask::new(http())
        .run(&ctx, &consumers[0], &mut Storage::new())
        .await
        .unwrap();
    assert_eq!(status, Status::Ok);
    assert_eq!(queue.count().await.unwrap(), 0);

    let config = persistence.get_site(site_id).await.unwrap().unwrap().site_config().unwrap();
    assert_eq!(ExtensionInfo::from_config(&config)[0].version.current.as_deref(), Some("9.8.1"));
    let mail = queued_mail(persistence.clone()).await;
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].template, MailTemplate::ExtensionUpdateInstalled);
}

#[tokio::test]
async fn test_ensure_system_tasks_is_idempotent() {
    let persistence = memory_persistence().await;

    assert_eq!(ensure_system_tasks(persistence.as_ref()).await.unwrap(), SYSTEM_TASKS.len());
    assert_eq!(ensure_system_tasks(persistence.as_ref()).await.unwrap(), 0);

    let all = persistence.list_tasks(None, None).await.unwrap();
    assert_eq!(all.len(), SYSTEM_TASKS.len());
    assert!(all.iter().all(|t| t.enabled && t.site_id.is_none()));
}
