use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::alerts::{Alert, MetricReading};
use crate::engine::EdgeEngine;
use crate::records::RecordId;

use super::{error_response, ApiResult};

#[derive(Debug, Serialize)]
pub struct ReadingResponse {
    pub alert: Option<Alert>,
}

/// `POST /metrics/readings`: the reading is stored either way; `alert`
/// is set when it breached a threshold.
pub async fn submit_reading(
    State(engine): State<EdgeEngine>,
    Json(reading): Json<MetricReading>,
) -> ApiResult<Json<ReadingResponse>> {
    let alert = engine.submit_metric(reading).await.map_err(error_response)?;
    Ok(Json(ReadingResponse { alert }))
}

pub async fn acknowledge(
    State(engine): State<EdgeEngine>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    engine
        .acknowledge_alert(&RecordId::from(id.as_str()))
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}
