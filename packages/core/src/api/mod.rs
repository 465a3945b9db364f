//! Local HTTP ingress for capture devices and the presentation layer.
//!
//! Routes:
//! - `GET    /health`             liveness
//! - `GET    /metrics`            Prometheus text
//! - `POST   /records`            submit a domain record
//! - `GET    /tasks`              queue and lane snapshot
//! - `POST   /tasks`              submit a task
//! - `GET    /tasks/:id`          one task
//! - `DELETE /tasks/:id`          cancel a task
//! - `GET    /models`             model registry snapshot
//! - `POST   /metrics/readings`   ingest a metric reading
//! - `POST   /alerts/:id/ack`     acknowledge an alert
//! - `POST   /sync/flush`         run a sync pass now
//! - `GET    /sync/status`        counts by sync status and connectivity
//! - `PUT    /connectivity`       report connectivity changes

pub mod alerts;
pub mod health;
pub mod records;
pub mod sync;
pub mod tasks;

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::engine::EdgeEngine;
use crate::error::EngineError;

/// Error half of every handler's result: a status and `{"error": ...}`.
pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult<T> = Result<T, ApiError>;

/// Map an engine error to the status a producer should act on.
pub fn error_response(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::StorageUnavailable(_) | EngineError::Stopped { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::QueueSaturated { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::UnknownTaskType(_) | EngineError::InvalidInput { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::TaskNotFound(_) | EngineError::RecordNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::RemoteUnavailable(_) => StatusCode::BAD_GATEWAY,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::ModelLoad(_) | EngineError::TaskExecution(_) | EngineError::Config { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), "request failed: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}

/// Assemble the full ingress router over one engine. CORS is open: the
/// presentation layer runs in a local webview with its own origin.
pub fn router(engine: EdgeEngine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/records", post(records::submit_record))
        .route("/tasks", get(tasks::snapshot).post(tasks::submit_task))
        .route("/tasks/:id", get(tasks::get_task).delete(tasks::cancel_task))
        .route("/models", get(tasks::models))
        .route("/metrics/readings", post(alerts::submit_reading))
        .route("/alerts/:id/ack", post(alerts::acknowledge))
        .route("/sync/flush", post(sync::flush))
        .route("/sync/status", get(sync::status))
        .route("/connectivity", put(sync::set_connectivity))
        .route_layer(middleware::from_fn_with_state(engine.clone(), track_requests))
        .layer(cors)
        .with_state(engine)
}

/// Count every routed request by method, matched path and status.
async fn track_requests(State(engine): State<EdgeEngine>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    engine
        .metrics()
        .http_requests_total
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .inc();
    response
}
