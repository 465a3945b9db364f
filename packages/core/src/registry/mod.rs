//! Model registry: load state, metadata and last use of every model.
//!
//! The registry is the only owner of load state. Concurrent
//! [`ModelRegistry::ensure_loaded`] calls for one model id share a single
//! in-flight load; every caller receives the same outcome. The load itself
//! runs on its own task, so a caller that stops waiting (a cancelled
//! task, say) does not abort the load for the others.

pub mod source;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tokio::time;

use crate::error::ModelLoadError;
use crate::events::{EventBus, EventKind};

pub use source::{DirectoryModelSource, LoadedModel, ModelMetadata, ModelSource, SizeClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    LoadFailed,
}

/// Public view of one model's load state.
#[derive(Debug, Clone, Serialize)]
pub struct ModelHandle {
    pub id: String,
    pub version: Option<String>,
    pub state: ModelState,
    pub last_used_at: Option<DateTime<Utc>>,
    pub metadata: Option<ModelMetadata>,
    pub last_error: Option<String>,
    pub load_attempts: u64,
}

type LoadOutcome = Option<Result<Arc<LoadedModel>, ModelLoadError>>;

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Unloaded,
    Loading {
        outcome: watch::Receiver<LoadOutcome>,
        abort: AbortHandle,
    },
    Loaded(Arc<LoadedModel>),
    LoadFailed(ModelLoadError),
}

#[derive(Debug, Default)]
struct Entry {
    slot: Slot,
    /// Bumped by every new load and every eviction, so a load that
    /// finishes after an eviction does not resurrect the model.
    generation: u64,
    last_used_at: Option<DateTime<Utc>>,
    load_attempts: u64,
}

impl Entry {
    fn state(&self) -> ModelState {
        match self.slot {
            Slot::Unloaded => ModelState::Unloaded,
            Slot::Loading { .. } => ModelState::Loading,
            Slot::Loaded(_) => ModelState::Loaded,
            Slot::LoadFailed(_) => ModelState::LoadFailed,
        }
    }

    fn handle(&self, id: &str) -> ModelHandle {
        let (version, metadata, last_error) = match &self.slot {
            Slot::Loaded(model) => (Some(model.version.clone()), Some(model.metadata.clone()), None),
            Slot::LoadFailed(err) => (None, None, Some(err.to_string())),
            _ => (None, None, None),
        };
        ModelHandle {
            id: id.to_string(),
            version,
            state: self.state(),
            last_used_at: self.last_used_at,
            metadata,
            last_error,
            load_attempts: self.load_attempts,
        }
    }
}

struct RegistryInner {
    source: Arc<dyn ModelSource>,
    entries: Mutex<HashMap<String, Entry>>,
    load_timeout: Duration,
    events: EventBus,
}

#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn ModelSource>, load_timeout: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                source,
                entries: Mutex::new(HashMap::new()),
                load_timeout,
                events,
            }),
        }
    }

    /// Resolve once `model_id` is Loaded, loading it if necessary.
    ///
    /// A LoadFailed model is retried from scratch. A caller whose load was
    /// superseded by an eviction waits on the current generation instead,
    /// so `Ok` is only ever returned for a model that is Loaded.
    pub async fn ensure_loaded(&self, model_id: &str) -> Result<Arc<LoadedModel>, ModelLoadError> {
        loop {
            let (mut rx, generation) = {
                let mut entries = self.inner.entries.lock().await;
                let entry = entries.entry(model_id.to_string()).or_default();
                match &entry.slot {
                    Slot::Loaded(model) => {
                        entry.last_used_at = Some(Utc::now());
                        return Ok(model.clone());
                    }
                    Slot::Loading { outcome, .. } => (outcome.clone(), entry.generation),
                    Slot::Unloaded | Slot::LoadFailed(_) => {
                        entry.generation += 1;
                        entry.load_attempts += 1;
                        let (outcome, abort) = self.spawn_load(model_id.to_string(), entry.generation);
                        entry.slot = Slot::Loading {
                            outcome: outcome.clone(),
                            abort,
                        };
                        self.emit(model_id, ModelState::Loading, None);
                        (outcome, entry.generation)
                    }
                }
            };

            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone());

            let mut entries = self.inner.entries.lock().await;
            let entry = entries.entry(model_id.to_string()).or_default();
            if entry.generation != generation {
                tracing::debug!(model_id, "load superseded, waiting on the current one");
                continue;
            }
            match outcome {
                Some(result) => return result,
                None => {
                    // The loader task went away without reporting.
                    let err = ModelLoadError::Aborted {
                        model_id: model_id.to_string(),
                    };
                    entry.slot = Slot::LoadFailed(err.clone());
                    drop(entries);
                    tracing::warn!(model_id, "model load aborted");
                    self.emit(model_id, ModelState::LoadFailed, Some(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    /// Start the source load on its own task and a supervisor that applies
    /// the timeout and publishes the outcome. Returns the outcome channel
    /// and a handle that aborts the source load.
    fn spawn_load(&self, model_id: String, generation: u64) -> (watch::Receiver<LoadOutcome>, AbortHandle) {
        let (tx, rx) = watch::channel(None);

        let source = self.inner.source.clone();
        let load_id = model_id.clone();
        let mut load = tokio::spawn(async move { source.load(&load_id).await });
        let abort = load.abort_handle();

        let registry = self.clone();
        tokio::spawn(async move {
            let inner = &registry.inner;
            tracing::info!(model_id = %model_id, "loading model");

            let result = match time::timeout(inner.load_timeout, &mut load).await {
                Ok(Ok(Ok(model))) => Ok(Arc::new(model)),
                Ok(Ok(Err(err))) => Err(err),
                Ok(Err(join_err)) if join_err.is_cancelled() => Err(ModelLoadError::Aborted {
                    model_id: model_id.clone(),
                }),
                Ok(Err(join_err)) => Err(ModelLoadError::source_error(
                    model_id.clone(),
                    format!("model source panicked: {join_err}"),
                )),
                Err(_) => {
                    load.abort();
                    Err(ModelLoadError::Timeout {
                        model_id: model_id.clone(),
                        after: inner.load_timeout,
                    })
                }
            };

            let current = {
                let mut entries = inner.entries.lock().await;
                match entries.get_mut(&model_id) {
                    Some(entry) if entry.generation == generation => {
                        entry.slot = match &result {
                            Ok(model) => {
                                entry.last_used_at = Some(Utc::now());
                                Slot::Loaded(model.clone())
                            }
                            Err(err) => Slot::LoadFailed(err.clone()),
                        };
                        true
                    }
                    _ => false,
                }
            };

            if current {
                match &result {
                    Ok(model) => {
                        tracing::info!(model_id = %model_id, version = %model.version, "model loaded");
                        registry.emit(&model_id, ModelState::Loaded, None);
                    }
                    Err(err) => {
                        tracing::warn!(model_id = %model_id, "model load failed: {}", err);
                        registry.emit(&model_id, ModelState::LoadFailed, Some(err.to_string()));
                    }
                }
            } else {
                tracing::debug!(model_id = %model_id, "model evicted while loading, result discarded");
            }

            let _ = tx.send(Some(result));
        });

        (rx, abort)
    }

    pub async fn is_loaded(&self, model_id: &str) -> bool {
        let entries = self.inner.entries.lock().await;
        entries
            .get(model_id)
            .is_some_and(|entry| matches!(entry.slot, Slot::Loaded(_)))
    }

    /// Drop a model back to Unloaded, aborting an in-flight load. Returns
    /// false if it was already Unloaded or unknown.
    pub async fn evict(&self, model_id: &str) -> bool {
        let evicted = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get_mut(model_id) {
                Some(entry) if !matches!(entry.slot, Slot::Unloaded) => {
                    if let Slot::Loading { abort, .. } = &entry.slot {
                        abort.abort();
                    }
                    entry.slot = Slot::Unloaded;
                    entry.generation += 1;
                    true
                }
                _ => false,
            }
        };
        if evicted {
            tracing::info!(model_id, "model evicted");
            self.emit(model_id, ModelState::Unloaded, None);
        }
        evicted
    }

    pub async fn handle(&self, model_id: &str) -> Option<ModelHandle> {
        let entries = self.inner.entries.lock().await;
        entries.get(model_id).map(|entry| entry.handle(model_id))
    }

    /// Every known model, sorted by id.
    pub async fn snapshot(&self) -> Vec<ModelHandle> {
        let entries = self.inner.entries.lock().await;
        let mut handles: Vec<ModelHandle> =
            entries.iter().map(|(id, entry)| entry.handle(id)).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub async fn loaded_count(&self) -> usize {
        let entries = self.inner.entries.lock().await;
        entries
            .values()
            .filter(|entry| matches!(entry.slot, Slot::Loaded(_)))
            .count()
    }

    fn emit(&self, model_id: &str, state: ModelState, error: Option<String>) {
        self.inner.events.emit(EventKind::ModelStatusChanged {
            model_id: model_id.to_string(),
            state,
            error,
        });
    }
}
