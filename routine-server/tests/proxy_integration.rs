//! End-to-end tests of the caching proxy and the cache control channel.

mod common;

use common::TestServer;
use reqwest::StatusCode;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>shell</html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/assets/app.js"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/javascript")
                .set_body_string("console.log('app')"),
        )
        .mount(&server)
        .await;
    server
}

fn unreachable_upstream() -> String {
    let port = portpicker::pick_unused_port().expect("no available port");
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn test_navigation_is_network_first() {
    let origin = upstream().await;
    let server = TestServer::start(&origin.uri(), true).await;

    let response = server
        .client
        .get(server.url("/"))
        .header("accept", "text/html,application/xhtml+xml")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-routine-cache").and_then(|v| v.to_str().ok()),
        Some("network-first")
    );
    assert_eq!(response.text().await.expect("body"), "<html>shell</html>");
}

#[tokio::test]
async fn test_script_served_from_cache_on_second_request() {
    let origin = upstream().await;
    let server = TestServer::start(&origin.uri(), true).await;

    for _ in 0..2 {
        let response = server
            .client
            .get(server.url("/assets/app.js"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-routine-cache").and_then(|v| v.to_str().ok()),
            Some("cache-first")
        );
        assert_eq!(response.text().await.expect("body"), "console.log('app')");
    }

    let status = server.get_json("/sw/stats").await;
    assert_eq!(status["stats"]["hits"], 1);
    assert_eq!(status["stats"]["misses"], 1);
    assert_eq!(status["stats"]["background_refreshes"], 1);
}

#[tokio::test]
async fn test_unreachable_upstream_degrades() {
    let server = TestServer::start(&unreachable_upstream(), false).await;

    let response = server
        .client
        .get(server.url("/courses"))
        .header("sec-fetch-mode", "navigate")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-routine-offline"));

    let response = server
        .client
        .get(server.url("/data/x"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let response = server
        .client
        .get(server.url("/api/not-a-host-route"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_control_ping_reports_generation() {
    let server = TestServer::start(&unreachable_upstream(), true).await;

    let response = server.post_json("/sw/message", json!({"type": "PING"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: Value = response.json().await.expect("json");
    assert_eq!(reply["type"], "pong");
    assert_eq!(reply["generation"], "routine-app-v1");
    assert_eq!(reply["phase"], "idle");
}

#[tokio::test]
async fn test_health_reports_ready() {
    let server = TestServer::start(&unreachable_upstream(), true).await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["online"], true);

    let response = server
        .client
        .get(server.url("/health/live"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}
