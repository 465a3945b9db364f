use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::EdgeEngine;
use crate::records::{DomainRecord, EntityType, RecordId};

use super::{error_response, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SubmitRecordRequest {
    /// Producer-assigned id; one is generated when absent.
    pub id: Option<String>,
    pub entity_type: EntityType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SubmitRecordResponse {
    pub id: RecordId,
}

/// `POST /records`: 201 once the record is durable.
pub async fn submit_record(
    State(engine): State<EdgeEngine>,
    Json(body): Json<SubmitRecordRequest>,
) -> ApiResult<(StatusCode, Json<SubmitRecordResponse>)> {
    let mut record = DomainRecord::new(body.entity_type, body.payload);
    if let Some(id) = body.id {
        record = record.with_id(id);
    }
    if let Some(created_at) = body.created_at {
        record = record.with_created_at(created_at);
    }

    let id = engine.submit_record(record).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(SubmitRecordResponse { id })))
}
