//! Admin API tests driven through the router without a socket.

#[macro_use]
mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::RecordingBackend;
use mesh::server::build_router;
use mesh::Mesh;
use notify::Notifier;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn start(dir: &tempfile::TempDir) -> Arc<Mesh> {
    Mesh::start(
        common::config(dir.path()),
        common::rules(),
        Arc::new(RecordingBackend::default()),
        Arc::new(Notifier::disabled()),
    )
    .await
    .unwrap()
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_rules_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let (status, body) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["rules"]["version"], "it-1");
    assert_eq!(body["rules"]["rule_count"], 2);
    assert_eq!(body["metrics"]["events_dropped"], 0);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_event_batch_counts_bad_items() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let batch = json!([
        {"source": "log", "entity": "api", "line": "GET / 200"},
        {"source": "traffic", "direction": "inbound", "channel": "api", "metrics": {"latency_ms": 12.5}},
        {"source": "bogus"}
    ]);
    let (status, body) = send(&router, Method::POST, "/api/events", Some(batch)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["rejected"], 1);

    let single = json!({"source": "log", "entity": "api", "line": "ok"});
    let (status, body) = send(&router, Method::POST, "/api/events", Some(single)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], 1);

    assert_eq!(mesh.metrics().snapshot().malformed_records, 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_registers_entity() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/heartbeat",
        Some(json!({"entity": "worker-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["event_id"].is_string());

    eventually!(mesh.liveness().record("worker-1").is_some());
    let (status, body) = send(&router, Method::GET, "/api/entities", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["entity_name"], "worker-1");
    assert_eq!(body[0]["state"], "HEALTHY");

    let (status, _) = send(
        &router,
        Method::POST,
        "/api/heartbeat",
        Some(json!({"entity": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_unknown_alert_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let uri = format!("/api/alerts/{}", uuid::Uuid::new_v4());
    let (status, body) = send(&router, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("unknown alert"));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_manual_alert_is_published_and_listed() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let (status, body) = send(
        &router,
        Method::POST,
        "/api/alerts",
        Some(json!({"entity": "db", "category": "intrusion", "severity": "critical", "message": "seen"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "published");
    let id = body["alert_id"].as_str().unwrap().to_string();

    let (status, body) = send(&router, Method::GET, &format!("/api/alerts/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source_entity"], "db");
    assert_eq!(body["severity"], "critical");

    let (status, body) = send(&router, Method::GET, "/api/alerts?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    // Low severity findings wait out the correlation window.
    let (status, body) = send(
        &router,
        Method::POST,
        "/api/alerts",
        Some(json!({"entity": "db", "severity": "warn"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "correlating");
    assert!(body.get("alert_id").is_none());

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_audit_endpoint_filters_by_entity() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    for entity in ["alpha", "beta"] {
        let (status, _) = send(
            &router,
            Method::POST,
            "/api/alerts",
            Some(json!({"entity": entity, "category": "intrusion", "severity": "critical"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    mesh.bus().audit().flush().await.unwrap();

    let (status, body) = send(&router, Method::GET, "/api/audit?entity=beta", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r["entity"] == "beta"));

    let (status, body) = send(&router, Method::GET, "/api/audit?entity=beta&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_rules_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let (status, body) = send(&router, Method::GET, "/api/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["generation"], 1);
    assert_eq!(body["enabled_count"], 2);

    // No rule file is configured, so reload is refused and the rules stay.
    let (status, _) = send(&router, Method::POST, "/api/rules/reload", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(mesh.engine().snapshot().info().generation, 1);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_reset_unknown_entity_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = start(&dir).await;
    let router = build_router(Arc::clone(&mesh));

    let (status, _) = send(&router, Method::POST, "/api/entities/ghost/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    mesh.collector()
        .submit(mesh::RawRecord::Heartbeat {
            entity: "ghost".to_string(),
            timestamp: None,
        })
        .unwrap();
    eventually!(mesh.liveness().record("ghost").is_some());
    let (status, body) = send(&router, Method::POST, "/api/entities/ghost/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "reset");

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config(dir.path());
    config.server.max_body_bytes = 256;
    let mesh = Mesh::start(
        config,
        common::rules(),
        Arc::new(RecordingBackend::default()),
        Arc::new(Notifier::disabled()),
    )
    .await
    .unwrap();
    let router = build_router(Arc::clone(&mesh));

    let line = "x".repeat(1024);
    let (status, _) = send(
        &router,
        Method::POST,
        "/api/events",
        Some(json!({"source": "log", "entity": "api", "line": line})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, _) = send(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mesh.metrics().snapshot().malformed_records, 0);

    mesh.shutdown().await;
}
