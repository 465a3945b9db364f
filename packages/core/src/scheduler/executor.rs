//! The seam between the scheduler and whatever runs inference.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::registry::LoadedModel;
use crate::scheduler::lane::LaneReport;
use crate::scheduler::task::{TaskId, TaskInput};

/// Sends progress updates for one task back to the scheduler.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    lane: usize,
    task_id: TaskId,
    reports: mpsc::UnboundedSender<LaneReport>,
}

impl ProgressReporter {
    pub(crate) fn new(lane: usize, task_id: TaskId, reports: mpsc::UnboundedSender<LaneReport>) -> Self {
        Self { lane, task_id, reports }
    }

    /// Report percent complete. Values above 100 are clamped; values at or
    /// below the last accepted one are ignored by the scheduler.
    pub fn report(&self, progress: u8) {
        let _ = self.reports.send(LaneReport::Progress {
            lane: self.lane,
            task_id: self.task_id.clone(),
            progress: progress.min(100),
        });
    }
}

/// Everything an executor may use while running one task.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Check at yield points; return [`TaskError::Cancelled`] once it fires.
    pub cancel: CancellationToken,
    pub progress: ProgressReporter,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        input: TaskInput,
        model: Arc<LoadedModel>,
        ctx: ExecutionContext,
    ) -> Result<serde_json::Value, TaskError>;
}

/// Echoes the input back with the model that would have served it.
/// Used when no inference backend is linked into the binary.
#[derive(Debug, Clone, Default)]
pub struct PassthroughExecutor;

#[async_trait]
impl TaskExecutor for PassthroughExecutor {
    async fn execute(
        &self,
        input: TaskInput,
        model: Arc<LoadedModel>,
        ctx: ExecutionContext,
    ) -> Result<serde_json::Value, TaskError> {
        if ctx.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        ctx.progress.report(50);
        tokio::task::yield_now().await;
        if ctx.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        ctx.progress.report(100);

        Ok(json!({
            "task_type": input.task_type,
            "input_ref": input.input_ref,
            "params": input.params,
            "model": { "id": model.id, "version": model.version },
        }))
    }
}
