use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// Queued -> Dispatched -> Running -> Completed | Failed | Cancelled
/// Queued -> Cancelled
/// Dispatched -> Failed | Cancelled     (model load failed / cancelled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Dispatched)
                | (Queued, Cancelled)
                | (Dispatched, Running)
                | (Dispatched, Failed)
                | (Dispatched, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a producer asks for. Built with [`TaskRequest::new`] and the
/// `with_*` setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,
    /// Reference to the input (scan id, image path, reading window...).
    pub input_ref: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, input_ref: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            input_ref: input_ref.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// The slice of a task an executor gets to see.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInput {
    pub id: TaskId,
    pub task_type: String,
    pub input_ref: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub model_id: String,
    pub input_ref: String,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub lane: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: TaskRequest, model_id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            task_type: request.task_type,
            model_id: model_id.into(),
            input_ref: request.input_ref,
            params: request.params,
            status: TaskStatus::Queued,
            progress: 0,
            result: None,
            error: None,
            lane: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Apply a status change if it is a legal forward step. Stamps
    /// `started_at` / `ended_at`. Returns false (and changes nothing) for an
    /// illegal step, including any step out of a terminal state.
    pub fn transition(&mut self, to: TaskStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        let now = Utc::now();
        if to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.ended_at = Some(now);
            if to == TaskStatus::Completed {
                self.progress = 100;
            }
        }
        true
    }

    /// Raise progress; lower or equal values are ignored. Returns the
    /// new value when it changed.
    pub fn advance_progress(&mut self, progress: u8) -> Option<u8> {
        let progress = progress.min(100);
        if self.status != TaskStatus::Running || progress <= self.progress {
            return None;
        }
        self.progress = progress;
        Some(progress)
    }

    pub fn input(&self) -> TaskInput {
        TaskInput {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            input_ref: self.input_ref.clone(),
            params: self.params.clone(),
        }
    }
}

/// Maps task types to the model each one needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRoutes(BTreeMap<String, String>);

impl TaskRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, task_type: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.0.insert(task_type.into(), model_id.into());
        self
    }

    /// Routes for the analytics, instrument tracking and monitoring modules.
    pub fn clinical_defaults() -> Self {
        Self::new()
            .with_route("outcome_prediction", "surgical-outcomes")
            .with_route("instrument_detection", "instrument-detector")
            .with_route("vitals_trend", "vitals-trend")
    }

    pub fn model_for(&self, task_type: &str) -> Option<&str> {
        self.0.get(task_type).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for TaskRoutes {
    type Err = String;

    /// Parses `type=model,type=model`. Blank entries are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut routes = TaskRoutes::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (task_type, model_id) = pair
                .split_once('=')
                .map(|(t, m)| (t.trim(), m.trim()))
                .filter(|(t, m)| !t.is_empty() && !m.is_empty())
                .ok_or_else(|| format!("invalid route {pair:?}, expected type=model"))?;
            routes = routes.with_route(task_type, model_id);
        }
        Ok(routes)
    }
}
