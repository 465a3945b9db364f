//! Task scheduler: FIFO queue, fixed pool of worker lanes, cancellation.
//!
//! The queue, the task table and the worker slots live inside one actor
//! task and nothing else touches them. [`Scheduler`] is a cheap handle
//! that talks to the actor over a channel; lanes talk back with
//! [`lane::LaneReport`] messages. Every terminal task is persisted as a
//! `TaskResult` record and every transition is audited.

pub mod executor;
pub(crate) mod lane;
pub mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditLog};
use crate::error::EngineError;
use crate::events::{EventBus, EventKind};
use crate::records::{DomainRecord, EntityType};
use crate::registry::ModelRegistry;
use crate::store::RecordStore;

use lane::{Lane, LaneCommand, LaneDeps, LaneReport, TaskOutcome};

pub use executor::{ExecutionContext, PassthroughExecutor, ProgressReporter, TaskExecutor};
pub use task::{Task, TaskId, TaskInput, TaskRequest, TaskRoutes, TaskStatus};

const COMMAND_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_limit: usize,
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_limit: 64,
            task_timeout: Duration::from_secs(120),
        }
    }
}

/// One lane per available core, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// One execution lane as the scheduler sees it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSlot {
    pub id: usize,
    pub busy: bool,
    pub current_task_id: Option<TaskId>,
    /// Set if the lane stopped accepting commands; never reused.
    pub retired: bool,
    #[serde(skip)]
    cancel: Option<CancellationToken>,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            busy: false,
            current_task_id: None,
            retired: false,
            cancel: None,
        }
    }

    fn release(&mut self) {
        self.busy = false;
        self.current_task_id = None;
        self.cancel = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    /// Queued task ids in dispatch order.
    pub queued: Vec<TaskId>,
    pub slots: Vec<WorkerSlot>,
    pub queue_limit: usize,
}

impl SchedulerSnapshot {
    pub fn busy_lanes(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }
}

/// What a cancel request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was still queued and is now Cancelled.
    Cancelled,
    /// The owning lane was signalled; the final status arrives as an event.
    Requested,
    /// Nothing to cancel; the task already ended with this status.
    AlreadyFinished(TaskStatus),
}

enum SchedulerCommand {
    Submit {
        request: TaskRequest,
        reply: oneshot::Sender<Result<TaskId, EngineError>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<CancelOutcome, EngineError>>,
    },
    Get {
        id: TaskId,
        reply: oneshot::Sender<Option<Task>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the scheduler actor. Clones share the same actor.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::Sender<SchedulerCommand>,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Spawn the actor and its lanes.
    pub fn start(
        config: SchedulerConfig,
        routes: TaskRoutes,
        registry: ModelRegistry,
        executor: Arc<dyn TaskExecutor>,
        store: Arc<dyn RecordStore>,
        events: EventBus,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let workers = config.workers.max(1);
        let deps = LaneDeps {
            registry,
            executor,
            task_timeout: config.task_timeout,
            reports: report_tx,
        };
        let lanes: Vec<Lane> = (0..workers).map(|id| lane::spawn_lane(id, deps.clone())).collect();

        tracing::info!(
            workers,
            queue_limit = config.queue_limit,
            "Task scheduler started"
        );

        let actor = SchedulerActor {
            config,
            routes,
            audit: AuditLog::new(store.clone()),
            store,
            events,
            tasks: HashMap::new(),
            queue: VecDeque::new(),
            slots: (0..workers).map(WorkerSlot::new).collect(),
            lanes,
            reports: report_rx,
        };
        let handle = tokio::spawn(actor.run(command_rx));

        Self {
            commands,
            actor: Arc::new(Mutex::new(Some(handle))),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::stopped("scheduler"))?;
        rx.await.map_err(|_| EngineError::stopped("scheduler"))
    }

    /// Queue a task. Fails fast with `QueueSaturated` or `UnknownTaskType`.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        self.request(|reply| SchedulerCommand::Submit { request, reply }).await?
    }

    pub async fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, EngineError> {
        let id = id.clone();
        self.request(|reply| SchedulerCommand::Cancel { id, reply }).await?
    }

    pub async fn task(&self, id: &TaskId) -> Result<Option<Task>, EngineError> {
        let id = id.clone();
        self.request(|reply| SchedulerCommand::Get { id, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, EngineError> {
        self.request(|reply| SchedulerCommand::Snapshot { reply }).await
    }

    /// Cancel everything queued or running, stop the lanes and wait for
    /// the actor to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SchedulerCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Some(handle) = self.actor.lock().await.take() {
            if let Err(err) = handle.await {
                tracing::error!("scheduler actor ended abnormally: {}", err);
            }
        }
    }
}

struct SchedulerActor {
    config: SchedulerConfig,
    routes: TaskRoutes,
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
    events: EventBus,
    tasks: HashMap<TaskId, Task>,
    queue: VecDeque<TaskId>,
    slots: Vec<WorkerSlot>,
    lanes: Vec<Lane>,
    reports: mpsc::UnboundedReceiver<LaneReport>,
}

impl SchedulerActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SchedulerCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(report) = self.reports.recv() => self.handle_report(report).await,
            }
            self.dispatch().await;
        }
        tracing::info!("Task scheduler stopped cleanly");
    }

    /// Returns false once the actor should stop.
    async fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Submit { request, reply } => {
                let result = self.enqueue(request).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::Cancel { id, reply } => {
                let result = self.cancel(&id).await;
                let _ = reply.send(result);
            }
            SchedulerCommand::Get { id, reply } => {
                let _ = reply.send(self.tasks.get(&id).cloned());
            }
            SchedulerCommand::Snapshot { reply } => {
                let _ = reply.send(SchedulerSnapshot {
                    queued: self.queue.iter().cloned().collect(),
                    slots: self.slots.clone(),
                    queue_limit: self.config.queue_limit,
                });
            }
            SchedulerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn enqueue(&mut self, request: TaskRequest) -> Result<TaskId, EngineError> {
        let model_id = self
            .routes
            .model_for(&request.task_type)
            .ok_or_else(|| EngineError::UnknownTaskType(request.task_type.clone()))?
            .to_string();

        if self.queue.len() >= self.config.queue_limit {
            tracing::warn!(limit = self.config.queue_limit, "task queue saturated, rejecting submission");
            return Err(EngineError::QueueSaturated {
                limit: self.config.queue_limit,
            });
        }

        let task = Task::new(request, model_id);
        let id = task.id.clone();
        tracing::info!(task_id = %id, task_type = %task.task_type, "task queued");

        self.events.emit(EventKind::TaskQueued {
            task_id: id.clone(),
            task_type: task.task_type.clone(),
            queue_position: self.queue.len(),
        });
        self.audit_transition(&task).await;

        self.queue.push_back(id.clone());
        self.tasks.insert(id.clone(), task);
        Ok(id)
    }

    async fn cancel(&mut self, id: &TaskId) -> Result<CancelOutcome, EngineError> {
        let status = self
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        match status {
            TaskStatus::Queued => {
                self.queue.retain(|queued| queued != id);
                self.finish(id, TaskOutcome::Cancelled).await;
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Dispatched | TaskStatus::Running => {
                if let Some(token) = self
                    .slots
                    .iter()
                    .find(|s| s.current_task_id.as_ref() == Some(id))
                    .and_then(|s| s.cancel.as_ref())
                {
                    token.cancel();
                }
                tracing::info!(task_id = %id, "cancellation requested");
                Ok(CancelOutcome::Requested)
            }
            terminal => Ok(CancelOutcome::AlreadyFinished(terminal)),
        }
    }

    /// Bind queued tasks to free lanes, oldest first.
    async fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(slot_idx) = self.slots.iter().position(|s| !s.busy && !s.retired) else {
                break;
            };
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if !task.transition(TaskStatus::Dispatched) {
                continue;
            }
            task.lane = Some(slot_idx);

            let cancel = CancellationToken::new();
            let command = LaneCommand::Run {
                input: task.input(),
                model_id: task.model_id.clone(),
                cancel: cancel.clone(),
            };
            let snapshot = task.clone();

            let slot = &mut self.slots[slot_idx];
            slot.busy = true;
            slot.current_task_id = Some(id.clone());
            slot.cancel = Some(cancel);

            tracing::debug!(task_id = %id, lane = slot_idx, "task dispatched");
            self.events.emit(EventKind::TaskDispatched {
                task_id: id.clone(),
                lane: slot_idx,
            });
            self.audit_transition(&snapshot).await;

            if self.lanes[slot_idx].commands.try_send(command).is_err() {
                tracing::error!(lane = slot_idx, "worker lane unavailable, retiring it");
                self.slots[slot_idx].retired = true;
                self.finish(
                    &id,
                    TaskOutcome::Failed(crate::error::TaskError::LaneUnavailable { lane: slot_idx }),
                )
                .await;
            }
        }
    }

    async fn handle_report(&mut self, report: LaneReport) {
        match report {
            LaneReport::ModelReady { task_id, lane } => {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    return;
                };
                if task.transition(TaskStatus::Running) {
                    let snapshot = task.clone();
                    tracing::debug!(task_id = %task_id, lane, "task running");
                    self.events.emit(EventKind::TaskStarted { task_id, lane });
                    self.audit_transition(&snapshot).await;
                }
            }
            LaneReport::Progress { task_id, progress, .. } => {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    return;
                };
                if let Some(progress) = task.advance_progress(progress) {
                    self.events.emit(EventKind::TaskProgress { task_id, progress });
                }
            }
            LaneReport::Finished { lane, task_id, outcome } => {
                if let Some(slot) = self.slots.get_mut(lane) {
                    if slot.current_task_id.as_ref() == Some(&task_id) {
                        slot.release();
                    }
                }
                self.finish(&task_id, outcome).await;
            }
        }
    }

    /// Apply a terminal outcome, emit it, audit it and persist the result.
    async fn finish(&mut self, id: &TaskId, outcome: TaskOutcome) {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        let to = match &outcome {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        };
        if !task.transition(to) {
            tracing::debug!(task_id = %id, from = %task.status, to = %to, "late outcome discarded");
            return;
        }

        let kind = match outcome {
            TaskOutcome::Completed(value) => {
                task.result = Some(value.clone());
                tracing::info!(task_id = %id, "task completed");
                EventKind::TaskCompleted {
                    task_id: id.clone(),
                    result: value,
                }
            }
            TaskOutcome::Failed(err) => {
                let message = err.to_string();
                task.error = Some(message.clone());
                tracing::warn!(task_id = %id, "task failed: {}", message);
                EventKind::TaskFailed {
                    task_id: id.clone(),
                    error: message,
                }
            }
            TaskOutcome::Cancelled => {
                tracing::info!(task_id = %id, "task cancelled");
                EventKind::TaskCancelled { task_id: id.clone() }
            }
        };
        let snapshot = task.clone();

        self.events.emit(kind);
        self.audit_transition(&snapshot).await;
        self.persist_result(&snapshot).await;
    }

    async fn audit_transition(&self, task: &Task) {
        self.audit
            .write_or_warn(
                AuditAction::TaskTransition,
                task.id.to_string(),
                json!({
                    "task_type": task.task_type,
                    "status": task.status,
                    "lane": task.lane,
                }),
            )
            .await;
    }

    async fn persist_result(&self, task: &Task) {
        let payload = match serde_json::to_value(task) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(task_id = %task.id, "task result not serializable: {}", err);
                return;
            }
        };
        let record = DomainRecord::new(EntityType::TaskResult, payload).with_id(task.id.to_string());
        if let Err(err) = self.store.put(&record).await {
            tracing::warn!(task_id = %task.id, "failed to persist task result: {}", err);
        }
    }

    async fn shutdown(&mut self) {
        let queued: Vec<TaskId> = self.queue.drain(..).collect();
        for id in &queued {
            self.finish(id, TaskOutcome::Cancelled).await;
        }
        for slot in &self.slots {
            if let Some(token) = &slot.cancel {
                token.cancel();
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.slots.iter().any(|s| s.busy) {
            match time::timeout_at(deadline, self.reports.recv()).await {
                Ok(Some(report)) => self.handle_report(report).await,
                _ => {
                    tracing::warn!("lanes did not drain before shutdown deadline");
                    break;
                }
            }
        }

        for lane in self.lanes.drain(..) {
            drop(lane.commands);
            let mut handle = lane.handle;
            if time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}
