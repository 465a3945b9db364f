use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::engine::EdgeEngine;
use crate::registry::ModelHandle;
use crate::scheduler::{CancelOutcome, SchedulerSnapshot, Task, TaskId, TaskRequest};

use super::{error_response, ApiResult};

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

/// `POST /tasks`: 202 with the new task id; 429 when the queue is full.
pub async fn submit_task(
    State(engine): State<EdgeEngine>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let task_id = engine.submit_task(request).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitTaskResponse { task_id })))
}

pub async fn get_task(
    State(engine): State<EdgeEngine>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = engine
        .task(&TaskId::from(id.as_str()))
        .await
        .map_err(error_response)?;
    Ok(Json(task))
}

/// `DELETE /tasks/:id`: the final status arrives as an event when the
/// task was already running.
pub async fn cancel_task(
    State(engine): State<EdgeEngine>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelOutcome>)> {
    let outcome = engine
        .cancel_task(&TaskId::from(id.as_str()))
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

pub async fn snapshot(State(engine): State<EdgeEngine>) -> ApiResult<Json<SchedulerSnapshot>> {
    let snapshot = engine.scheduler_snapshot().await.map_err(error_response)?;
    Ok(Json(snapshot))
}

pub async fn models(State(engine): State<EdgeEngine>) -> Json<Vec<ModelHandle>> {
    Json(engine.models().await)
}
