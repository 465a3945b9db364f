//! Status notifications emitted to the presentation layer.
//!
//! Every component publishes through one [`EventBus`]; UI collaborators
//! call [`EventBus::subscribe`] and render from the stream. Emitting never
//! blocks and never fails: with no subscribers the event is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::alerts::Alert;
use crate::records::{EntityType, RecordId, SyncStatus};
use crate::registry::ModelState;
use crate::scheduler::TaskId;
use crate::sync::SyncReport;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A single attributed notification.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    /// Monotonic per-bus sequence number. Subscribers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskQueued {
        task_id: TaskId,
        task_type: String,
        queue_position: usize,
    },
    TaskDispatched {
        task_id: TaskId,
        lane: usize,
    },
    TaskStarted {
        task_id: TaskId,
        lane: usize,
    },
    TaskProgress {
        task_id: TaskId,
        progress: u8,
    },
    TaskCompleted {
        task_id: TaskId,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    ModelStatusChanged {
        model_id: String,
        state: ModelState,
        error: Option<String>,
    },
    AlertRaised {
        alert: Alert,
    },
    AlertAcknowledged {
        alert_id: RecordId,
    },
    SyncStatusChanged {
        record_id: RecordId,
        entity_type: EntityType,
        status: SyncStatus,
    },
    SyncPassCompleted {
        report: SyncReport,
    },
    ConnectivityChanged {
        online: bool,
    },
}

impl EventKind {
    /// The task this event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventKind::TaskQueued { task_id, .. }
            | EventKind::TaskDispatched { task_id, .. }
            | EventKind::TaskStarted { task_id, .. }
            | EventKind::TaskProgress { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::TaskCancelled { task_id } => Some(task_id),
            _ => None,
        }
    }
}

/// In-process fan-out of [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Stamp and publish an event. Returns the assigned sequence number.
    pub fn emit(&self, kind: EventKind) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = EngineEvent {
            seq,
            timestamp: Utc::now(),
            kind,
        };
        // Err only means nobody is listening right now.
        let _ = self.sender.send(event);
        seq
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
