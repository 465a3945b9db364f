//! Error types for the edge engine.
//!
//! Component errors stay narrow (`StoreError`, `RemoteError`,
//! `ModelLoadError`, `TaskError`) and fold into [`EngineError`] at the
//! public surface. Only resource exhaustion (queue saturation, storage
//! outage) is surfaced synchronously to producers.

use std::time::Duration;

use thiserror::Error;

/// Top-level error returned by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("remote endpoint unavailable: {0}")]
    RemoteUnavailable(#[from] RemoteError),

    #[error("model load failed: {0}")]
    ModelLoad(#[from] ModelLoadError),

    #[error("task execution failed: {0}")]
    TaskExecution(#[from] TaskError),

    #[error("task queue saturated ({limit} tasks already queued)")]
    QueueSaturated { limit: usize },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    #[error("engine component stopped: {component}")]
    Stopped { component: &'static str },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl EngineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn stopped(component: &'static str) -> Self {
        Self::Stopped { component }
    }

    /// True for the conditions a caller is expected to back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_) | Self::RemoteUnavailable(_) | Self::QueueSaturated { .. }
        )
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::RecordNotFound(id),
            other => Self::StorageUnavailable(other),
        }
    }
}

/// Errors from the durable local store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("record not found: {id}")]
    NotFound { id: String },

    #[error("stored row is corrupt: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt { message: message.into() }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                Self::corrupt(err.to_string())
            }
            other => Self::unavailable(other.to_string()),
        }
    }
}

/// Errors from the remote sync endpoint.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("remote rejected submission with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("remote submission timed out after {0:?}")]
    Timeout(Duration),

    #[error("no remote endpoint configured")]
    NotConfigured,
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }
}

/// Errors from loading a computational model.
///
/// `Clone` because one in-flight load fans its outcome out to every
/// awaiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("model {model_id} not found in model source")]
    NotFound { model_id: String },

    #[error("model {model_id} failed to load: {message}")]
    Source { model_id: String, message: String },

    #[error("model {model_id} load timed out after {after:?}")]
    Timeout { model_id: String, after: Duration },

    #[error("model {model_id} load was aborted before completing")]
    Aborted { model_id: String },
}

impl ModelLoadError {
    pub fn source_error(model_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            model_id: model_id.into(),
            message: message.into(),
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::NotFound { model_id }
            | Self::Source { model_id, .. }
            | Self::Timeout { model_id, .. }
            | Self::Aborted { model_id } => model_id,
        }
    }
}

/// Terminal failure of a single task. Never affects sibling tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("execution error: {message}")]
    Execution { message: String },

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error("task exceeded its {0:?} timeout")]
    Timeout(Duration),

    #[error("worker lane {lane} is no longer accepting work")]
    LaneUnavailable { lane: usize },

    /// Returned by executors that observed their cancellation token.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution { message: message.into() }
    }
}
