//! Worker lanes.
//!
//! A lane runs one task at a time. It owns nothing the scheduler owns;
//! it receives a [`LaneCommand`] and answers only with [`LaneReport`]
//! messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::registry::ModelRegistry;
use crate::scheduler::executor::{ExecutionContext, ProgressReporter, TaskExecutor};
use crate::scheduler::task::{TaskId, TaskInput};

#[derive(Debug)]
pub(crate) enum LaneCommand {
    /// Load `model_id` if needed, then execute the task.
    Run {
        input: TaskInput,
        model_id: String,
        cancel: CancellationToken,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Completed(serde_json::Value),
    Failed(TaskError),
    Cancelled,
}

#[derive(Debug)]
pub(crate) enum LaneReport {
    ModelReady {
        lane: usize,
        task_id: TaskId,
    },
    Progress {
        lane: usize,
        task_id: TaskId,
        progress: u8,
    },
    Finished {
        lane: usize,
        task_id: TaskId,
        outcome: TaskOutcome,
    },
}

pub(crate) struct Lane {
    pub(crate) commands: mpsc::Sender<LaneCommand>,
    pub(crate) handle: JoinHandle<()>,
}

#[derive(Clone)]
pub(crate) struct LaneDeps {
    pub(crate) registry: ModelRegistry,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) task_timeout: Duration,
    pub(crate) reports: mpsc::UnboundedSender<LaneReport>,
}

pub(crate) fn spawn_lane(lane: usize, deps: LaneDeps) -> Lane {
    // Capacity 1: the scheduler only sends to a lane whose slot is free.
    let (commands, mut rx) = mpsc::channel::<LaneCommand>(1);

    let handle = tokio::spawn(async move {
        tracing::debug!(lane, "worker lane started");
        while let Some(LaneCommand::Run { input, model_id, cancel }) = rx.recv().await {
            let task_id = input.id.clone();
            let outcome = run_task(lane, &deps, input, &model_id, cancel).await;
            let _ = deps.reports.send(LaneReport::Finished {
                lane,
                task_id,
                outcome,
            });
        }
        tracing::debug!(lane, "worker lane stopped");
    });

    Lane { commands, handle }
}

async fn run_task(
    lane: usize,
    deps: &LaneDeps,
    input: TaskInput,
    model_id: &str,
    cancel: CancellationToken,
) -> TaskOutcome {
    let model = tokio::select! {
        biased;
        _ = cancel.cancelled() => return TaskOutcome::Cancelled,
        loaded = deps.registry.ensure_loaded(model_id) => match loaded {
            Ok(model) => model,
            Err(err) => return TaskOutcome::Failed(TaskError::ModelLoad(err)),
        },
    };

    let task_id = input.id.clone();
    let _ = deps.reports.send(LaneReport::ModelReady {
        lane,
        task_id: task_id.clone(),
    });

    let ctx = ExecutionContext {
        cancel: cancel.clone(),
        progress: ProgressReporter::new(lane, task_id.clone(), deps.reports.clone()),
    };
    let executor = deps.executor.clone();
    let timeout = deps.task_timeout;

    // Run on its own task so a panicking executor fails one task instead
    // of killing the lane.
    let mut work = tokio::spawn(async move {
        time::timeout(timeout, executor.execute(input, model, ctx)).await
    });

    // Result first: an outcome that is already in wins over a late cancel.
    tokio::select! {
        biased;
        joined = &mut work => match joined {
            Ok(Ok(Ok(value))) => TaskOutcome::Completed(value),
            Ok(Ok(Err(TaskError::Cancelled))) => TaskOutcome::Cancelled,
            Ok(Ok(Err(err))) => TaskOutcome::Failed(err),
            Ok(Err(_elapsed)) => TaskOutcome::Failed(TaskError::Timeout(timeout)),
            Err(join_err) => {
                tracing::error!(lane, task_id = %task_id, "executor panicked: {}", join_err);
                TaskOutcome::Failed(TaskError::execution("executor panicked"))
            }
        },
        _ = cancel.cancelled() => {
            work.abort();
            TaskOutcome::Cancelled
        }
    }
}
