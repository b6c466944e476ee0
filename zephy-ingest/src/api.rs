// Zephy Ingest - HTTP operator surface
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP routes: probes, metrics, status, topic reload and direct
//! reading ingestion.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use zephy::{IngestError, IngestService, MetricValues, MetricsSnapshot, Reading};

use crate::metrics::{encode_metrics, update_from_snapshot, update_session};

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<IngestService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self {
            service,
            start_time: Instant::now(),
        }
    }
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/api/v1/mqtt/reload", post(reload_handler))
        .route("/api/v1/readings", post(readings_handler))
        .with_state(state)
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Zephy Ingest</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { margin: 10px 0; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Zephy Ingest</h1>
    <p>MQTT telemetry ingestion: topic routing and per-device reading coalescing.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div class="endpoint"><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div class="endpoint"><a href="/health">/health</a> - Health check</div>
        <div class="endpoint"><a href="/ready">/ready</a> - Readiness check (broker connected)</div>
        <div class="endpoint"><a href="/status">/status</a> - Status information (JSON)</div>
        <div class="endpoint"><code>POST /api/v1/mqtt/reload</code> - Rebuild topics from the registry</div>
        <div class="endpoint"><code>POST /api/v1/readings</code> - Submit a reading over HTTP</div>
    </div>
</body>
</html>"#,
    )
}

fn refresh_gauges(state: &AppState) -> MetricsSnapshot {
    let snapshot = state.service.metrics().snapshot();
    let subscriptions = state.service.subscriptions();
    update_from_snapshot(&snapshot);
    update_session(
        subscriptions.is_connected(),
        subscriptions.directory().device_count(),
    );
    snapshot
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    refresh_gauges(&state);
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once the broker session is up.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.service.subscriptions().is_connected() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Broker not connected")
    }
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    connected: bool,
    topics: usize,
    devices: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    collisions: Vec<String>,
    metrics: MetricsSnapshot,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let metrics = refresh_gauges(&state);
    let subscriptions = state.service.subscriptions();
    let directory = subscriptions.directory();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connected: subscriptions.is_connected(),
        topics: directory.len(),
        devices: directory.device_count(),
        collisions: directory
            .collisions()
            .iter()
            .map(|c| format!("{}: {} replaced by {}", c.slug, c.previous, c.winner))
            .collect(),
        metrics,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReloadResponse {
    message: &'static str,
    old_topics_count: usize,
    new_topics_count: usize,
    topics: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    details: String,
}

fn error_response(status: StatusCode, error: &'static str, err: &IngestError) -> Response {
    (
        status,
        Json(ErrorResponse {
            error,
            details: err.to_string(),
        }),
    )
        .into_response()
}

/// Rebuild the topic directory from the registry and resubscribe.
async fn reload_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.reload().await {
        Ok(summary) => {
            info!(
                old = summary.old_count,
                new = summary.new_count,
                "Topics reloaded via API"
            );
            Json(ReloadResponse {
                message: "MQTT topics reloaded successfully",
                old_topics_count: summary.old_count,
                new_topics_count: summary.new_count,
                topics: summary.topics,
            })
            .into_response()
        }
        Err(e @ IngestError::NotConnected) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "MQTT client not connected",
            &e,
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to reload MQTT topics",
            &e,
        ),
    }
}

/// Body of a direct reading submission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingRequest {
    device_id: Option<String>,
    #[serde(flatten)]
    values: MetricValues,
}

#[derive(Serialize)]
struct AcceptedResponse {
    message: &'static str,
    data: Reading,
}

/// Accept a pre-assembled reading over HTTP.
async fn readings_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReadingRequest>,
) -> Response {
    let device_id = match request.device_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "deviceId is required" })),
            )
                .into_response()
        }
    };

    let reading = Reading::now(device_id, request.values);
    match state.service.submit_reading(reading.clone()).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(AcceptedResponse {
                message: "Reading accepted",
                data: reading,
            }),
        )
            .into_response(),
        Err(e @ (IngestError::Rejected { .. } | IngestError::InvalidPayload { .. })) => {
            error_response(StatusCode::BAD_REQUEST, "Invalid reading", &e)
        }
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Reading not accepted",
            &e,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use zephy::memory::{MemoryStore, MemoryTransport};
    use zephy::IngestConfig;

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<MemoryTransport>,
        service: Arc<IngestService>,
        app: Router,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.add_location("l1", "Puerto Maldonado");
        store.add_device("D1", Some("l1"));

        let (transport, events) = MemoryTransport::with_events(16);
        let transport = Arc::new(transport);
        let service = Arc::new(IngestService::new(
            IngestConfig::default(),
            transport.clone(),
            store.clone(),
            store.clone(),
        ));
        service.start(events).await.unwrap();

        let app = router(Arc::new(AppState::new(service.clone())));
        Harness {
            store,
            transport,
            service,
            app,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("Content-Type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_probes() {
        let h = harness().await;

        let (status, _) = send(&h.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&h.app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        h.transport.set_connected(true);
        let (status, _) = send(&h.app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_reload_disconnected() {
        let h = harness().await;

        let (status, body) = send(&h.app, "POST", "/api/v1/mqtt/reload", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "MQTT client not connected");
        assert!(body["details"].as_str().unwrap().contains("not connected"));

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_reload_response_shape() {
        let h = harness().await;
        h.transport.set_connected(true);
        h.store.add_location("l2", "Cusco");
        h.store.add_device("D2", Some("l2"));

        let (status, body) = send(&h.app, "POST", "/api/v1/mqtt/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["oldTopicsCount"], 0);
        assert_eq!(body["newTopicsCount"], 6);
        assert_eq!(body["topics"].as_array().unwrap().len(), 6);
        assert_eq!(h.transport.subscribed().len(), 6);

        let (_, status_body) = send(&h.app, "GET", "/status", None).await;
        assert_eq!(status_body["topics"], 6);
        assert_eq!(status_body["devices"], 2);

        h.service.stop().await;
    }

    #[tokio::test]
    async fn test_readings_endpoint() {
        let h = harness().await;

        let (status, body) = send(
            &h.app,
            "POST",
            "/api/v1/readings",
            Some(json!({ "temperature": 20.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "deviceId is required");

        let (status, _) = send(
            &h.app,
            "POST",
            "/api/v1/readings",
            Some(json!({ "deviceId": "D1", "humidity": 140.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &h.app,
            "POST",
            "/api/v1/readings",
            Some(json!({ "deviceId": "D1", "temperature": 24.5, "airQuality": 42.0 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["device"], "D1");
        assert!(body["data"].get("humidity").is_none());

        h.service.stop().await;
        let stored = h.store.readings_for("D1");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].values.air_quality, Some(42.0));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let h = harness().await;
        let response = h
            .app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("zephy_subscribed_topics"));

        h.service.stop().await;
    }
}
