//! Admin HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::AuditQuery;
use crate::error::MeshError;
use crate::event::RawRecord;
use crate::pipeline::{ManualAlert, Mesh};

const DEFAULT_ALERT_LIMIT: usize = 100;

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::UnknownAlert(_) => StatusCode::NOT_FOUND,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Closed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the admin router.
pub fn build_router(mesh: Arc<Mesh>) -> Router {
    let server = &mesh.config().server;
    let timeout = Duration::from_secs(server.request_timeout_secs);
    let max_body = server.max_body_bytes;

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", post(events_handler))
        .route("/api/heartbeat", post(heartbeat_handler))
        .route("/api/alerts", get(list_alerts_handler).post(inject_alert_handler))
        .route("/api/alerts/{id}", get(get_alert_handler))
        .route("/api/audit", get(audit_handler))
        .route("/api/rules", get(rules_handler))
        .route("/api/rules/reload", post(reload_rules_handler))
        .route("/api/entities", get(entities_handler))
        .route("/api/entities/{entity}/reset", post(reset_entity_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(max_body))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    timeout,
                )),
        )
        .with_state(mesh)
}

async fn health_handler(State(mesh): State<Arc<Mesh>>) -> impl IntoResponse {
    (StatusCode::OK, Json(mesh.health()))
}

/// Accepts one record or an array of records.
async fn events_handler(
    State(mesh): State<Arc<Mesh>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let records = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    let summary = mesh.collector().ingest_batch(records);
    (StatusCode::ACCEPTED, Json(summary))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    entity: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

async fn heartbeat_handler(
    State(mesh): State<Arc<Mesh>>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, MeshError> {
    let event_id = mesh.collector().submit(RawRecord::Heartbeat {
        entity: request.entity,
        timestamp: request.timestamp,
    })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))))
}

#[derive(Debug, Serialize)]
struct InjectResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert_id: Option<Uuid>,
}

async fn inject_alert_handler(
    State(mesh): State<Arc<Mesh>>,
    Json(manual): Json<ManualAlert>,
) -> Result<impl IntoResponse, MeshError> {
    let alert_id = mesh.inject_manual(manual).await?;
    let status = if alert_id.is_some() { "published" } else { "correlating" };
    Ok((StatusCode::ACCEPTED, Json(InjectResponse { status, alert_id })))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_alerts_handler(
    State(mesh): State<Arc<Mesh>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let alerts = mesh
        .bus()
        .recent(params.limit.unwrap_or(DEFAULT_ALERT_LIMIT))
        .await;
    Json(alerts)
}

async fn get_alert_handler(
    State(mesh): State<Arc<Mesh>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, MeshError> {
    mesh.bus()
        .get(id)
        .await
        .map(Json)
        .ok_or(MeshError::UnknownAlert(id))
}

async fn audit_handler(
    State(mesh): State<Arc<Mesh>>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, MeshError> {
    let records = mesh.bus().audit().query(&query).await?;
    Ok(Json(records))
}

async fn rules_handler(State(mesh): State<Arc<Mesh>>) -> impl IntoResponse {
    Json(mesh.engine().snapshot().info().clone())
}

async fn reload_rules_handler(
    State(mesh): State<Arc<Mesh>>,
) -> Result<impl IntoResponse, MeshError> {
    let info = mesh.reload_rules()?;
    info!(generation = info.generation, digest = %info.digest, "Rules reloaded via API");
    Ok(Json(info))
}

async fn entities_handler(State(mesh): State<Arc<Mesh>>) -> impl IntoResponse {
    Json(mesh.liveness().snapshot())
}

async fn reset_entity_handler(
    State(mesh): State<Arc<Mesh>>,
    Path(entity): Path<String>,
) -> impl IntoResponse {
    if mesh.liveness().reset(&entity) {
        (
            StatusCode::OK,
            Json(json!({ "entity": entity, "status": "reset" })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown entity {entity}") })),
        )
    }
}
