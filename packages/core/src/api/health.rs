use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::engine::EdgeEngine;

use super::{error_response, ApiResult};

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, [(header::CACHE_CONTROL, "no-store")], "ok")
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics(State(engine): State<EdgeEngine>) -> ApiResult<impl IntoResponse> {
    let body = engine.render_metrics().await.map_err(error_response)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
