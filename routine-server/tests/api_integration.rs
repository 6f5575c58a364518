//! End-to-end tests of the data API: offline mutations, reconnect sync,
//! change notifications and the sync event stream.

mod common;

use std::time::Duration;

use common::{eventually, TestServer};
use reqwest::StatusCode;
use routine_core::Record;
use serde_json::{json, Value};

/// Nothing listens here; the proxy is not exercised by these tests.
const NO_UPSTREAM: &str = "http://127.0.0.1:9";

#[tokio::test]
async fn test_offline_create_syncs_on_reconnect() {
    let server = TestServer::start(NO_UPSTREAM, false).await;

    let response = server
        .post_json("/api/collections/tasks", json!({"title": "Buy milk", "done": false}))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await.expect("json");
    assert!(created["id"].as_str().is_some_and(|id| id.starts_with("temp-")));
    assert_eq!(created["sync"]["state"], "pending_create");
    assert!(server.backend.calls().is_empty());

    let pending = server.get_json("/api/sync/pending").await;
    assert_eq!(pending["total"], 1);
    assert_eq!(pending["online"], false);

    let response = server.post_json("/api/connectivity", json!({"online": true})).await;
    assert_eq!(response.status(), StatusCode::OK);

    let srv = &server;
    assert!(
        eventually(move || async move { srv.get_json("/api/sync/pending").await["total"] == 0 }).await,
        "pending create was not reconciled"
    );

    let remote = server.backend.records("tasks");
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].str_field("title"), Some("Buy milk"));

    let local: Vec<Record> = server
        .client
        .get(server.url("/api/collections/tasks"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("records");
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, remote[0].id);
    assert!(!local[0].sync.is_pending());
}

#[tokio::test]
async fn test_online_activation_is_exclusive() {
    let server = TestServer::start(NO_UPSTREAM, true).await;

    let mut ids = Vec::new();
    for name in ["Morning", "Evening"] {
        let created: Value = server
            .post_json("/api/collections/routines", json!({"name": name}))
            .await
            .json()
            .await
            .expect("json");
        ids.push(created["id"].as_str().expect("id").to_string());
    }

    for id in &ids {
        let response = server
            .post_json(&format!("/api/collections/routines/{id}/activate"), json!({}))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let routines = server.get_json("/api/collections/routines").await;
    let active: Vec<&str> = routines
        .as_array()
        .expect("array")
        .iter()
        .filter(|r| r["fields"]["active"] == true)
        .filter_map(|r| r["id"].as_str())
        .collect();
    assert_eq!(active, vec![ids[1].as_str()]);
}

#[tokio::test]
async fn test_update_and_delete_round_trip() {
    let server = TestServer::start(NO_UPSTREAM, true).await;
    let created: Value = server
        .post_json("/api/collections/courses", json!({"title": "Algebra"}))
        .await
        .json()
        .await
        .expect("json");
    let id = created["id"].as_str().expect("id").to_string();

    let updated: Value = server
        .client
        .patch(server.url(&format!("/api/collections/courses/{id}")))
        .json(&json!({"title": "Linear Algebra"}))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(updated["fields"]["title"], "Linear Algebra");

    let response = server
        .client
        .delete(server.url(&format!("/api/collections/courses/{id}")))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(server.backend.records("courses").is_empty());

    let response = server
        .client
        .patch(server.url(&format!("/api/collections/courses/{id}")))
        .json(&json!({"title": "gone"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_collection_and_offline_errors() {
    let server = TestServer::start(NO_UPSTREAM, false).await;

    let response = server
        .client
        .get(server.url("/api/collections/spaceships"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], "unknown_collection");

    let response = server.post_json("/api/sync", json!({})).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = server
        .client
        .get(server.url("/api/collections/tasks/export"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_change_notification_refreshes_collection() {
    let server = TestServer::start(NO_UPSTREAM, true).await;
    let fields = json!({"title": "From another device"})
        .as_object()
        .cloned()
        .unwrap_or_default();
    server.backend.seed("tasks", Record::new("srv-100", fields));

    let response = server
        .post_json(
            "/api/changes",
            json!({"collection": "tasks", "kind": "added", "record_id": "srv-100"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let srv = &server;
    assert!(
        eventually(move || async move {
            srv.get_json("/api/collections/tasks")
                .await
                .as_array()
                .is_some_and(|records| records.iter().any(|r| r["id"] == "srv-100"))
        })
        .await,
        "remote change was not pulled in"
    );
}

#[tokio::test]
async fn test_import_then_export() {
    let server = TestServer::start(NO_UPSTREAM, true).await;
    let response = server
        .post_json(
            "/api/collections/teachers/import",
            json!([{"name": "Ada"}, {"name": "Grace"}]),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let exported = server.get_json("/api/collections/teachers/export").await;
    let names: Vec<&str> = exported
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|doc| doc["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Ada", "Grace"]);
}

#[tokio::test]
async fn test_sync_events_stream() {
    let server = TestServer::start(NO_UPSTREAM, true).await;

    let mut stream = server
        .client
        .get(server.url("/api/sync/events"))
        .send()
        .await
        .expect("sse request");
    assert_eq!(stream.status(), StatusCode::OK);

    let response = server.post_json("/api/sync", json!({})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary: Value = response.json().await.expect("summary");
    assert!(summary["reports"].as_array().is_some_and(|r| !r.is_empty()));

    let mut received = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), async {
        while !received.contains("event: completed") {
            match stream.chunk().await.expect("chunk") {
                Some(bytes) => received.push_str(&String::from_utf8_lossy(&bytes)),
                None => break,
            }
        }
    })
    .await;
    assert!(read.is_ok(), "no completed event, got: {received}");
    assert!(received.contains("event: started"));
}

#[tokio::test]
async fn test_storage_clear_keeps_critical_collections() {
    let server = TestServer::start(NO_UPSTREAM, false).await;
    server
        .post_json("/api/collections/tasks", json!({"title": "Keep me"}))
        .await;
    server
        .post_json("/api/collections/materials", json!({"title": "Drop me"}))
        .await;

    let response = server.post_json("/api/storage/clear", json!({})).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(server.state.repository.records("tasks").len(), 1);
    assert!(server.state.repository.records("materials").is_empty());
}
