use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::EdgeEngine;
use crate::sync::SyncState;

use super::{error_response, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

/// `POST /sync/flush`: the pass report, or `{"coalesced": true}` when a
/// running pass absorbed the request.
pub async fn flush(State(engine): State<EdgeEngine>) -> ApiResult<Json<Value>> {
    let report = engine.flush_sync().await.map_err(error_response)?;
    let body = match report {
        Some(report) => json!(report),
        None => json!({ "coalesced": true }),
    };
    Ok(Json(body))
}

pub async fn status(State(engine): State<EdgeEngine>) -> ApiResult<Json<SyncState>> {
    let state = engine.sync_status().await.map_err(error_response)?;
    Ok(Json(state))
}

pub async fn set_connectivity(
    State(engine): State<EdgeEngine>,
    Json(body): Json<ConnectivityRequest>,
) -> StatusCode {
    engine.set_online(body.online);
    StatusCode::NO_CONTENT
}
