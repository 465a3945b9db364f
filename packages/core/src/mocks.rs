//! Scriptable collaborators for tests and local demos.
//!
//! - [`MockRemoteEndpoint`]: idempotent remote that counts calls and can
//!   go offline or fail on demand.
//! - [`MockModelSource`]: counts loads, can be slowed down or broken.
//! - [`ScriptedExecutor`]: tasks can be held at a gate or made to fail.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use crate::error::{ModelLoadError, RemoteError, TaskError};
use crate::records::{DomainRecord, RecordId};
use crate::registry::{LoadedModel, ModelMetadata, ModelSource, SizeClass};
use crate::scheduler::{ExecutionContext, TaskExecutor, TaskInput};
use crate::sync::RemoteEndpoint;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---- Remote endpoint ----

#[derive(Debug, Default)]
struct RemoteLedger {
    accepted: Vec<RecordId>,
    seen: HashSet<RecordId>,
    calls: HashMap<RecordId, usize>,
}

/// Remote endpoint that deduplicates by record id, like the real one must.
#[derive(Debug)]
pub struct MockRemoteEndpoint {
    ledger: Mutex<RemoteLedger>,
    online: AtomicBool,
    fail_next: AtomicUsize,
    total_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl Default for MockRemoteEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteEndpoint {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(RemoteLedger::default()),
            online: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            total_calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// While offline every submission fails with a network error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `n` submissions with HTTP 503.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every submission attempt, successful or not.
    pub fn call_count(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, id: &RecordId) -> usize {
        lock(&self.ledger).calls.get(id).copied().unwrap_or(0)
    }

    /// Distinct records the remote holds.
    pub fn unique_count(&self) -> usize {
        lock(&self.ledger).seen.len()
    }

    /// Distinct record ids in the order they were first accepted.
    pub fn received_ids(&self) -> Vec<RecordId> {
        lock(&self.ledger).accepted.clone()
    }
}

#[async_trait]
impl RemoteEndpoint for MockRemoteEndpoint {
    async fn submit(&self, record: &DomainRecord) -> Result<(), RemoteError> {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.ledger).calls.entry(record.id.clone()).or_default() += 1;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::network("remote unreachable"));
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RemoteError::Rejected {
                status: 503,
                message: "injected failure".into(),
            });
        }

        let mut ledger = lock(&self.ledger);
        if ledger.seen.insert(record.id.clone()) {
            ledger.accepted.push(record.id.clone());
        }
        Ok(())
    }
}

// ---- Model source ----

#[derive(Debug, Default)]
pub struct MockModelSource {
    loads: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl MockModelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(self, model_id: &str) -> Self {
        self.fail(model_id);
        self
    }

    pub fn fail(&self, model_id: &str) {
        lock(&self.failing).insert(model_id.to_string());
    }

    pub fn heal(&self, model_id: &str) {
        lock(&self.failing).remove(model_id);
    }

    /// Panic inside the next load of `model_id`, then behave normally.
    pub fn panic_once(&self, model_id: &str) {
        lock(&self.panicking).insert(model_id.to_string());
    }

    pub fn load_count(&self, model_id: &str) -> usize {
        lock(&self.loads).get(model_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ModelSource for MockModelSource {
    async fn load(&self, model_id: &str) -> Result<LoadedModel, ModelLoadError> {
        *lock(&self.loads).entry(model_id.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.panicking).remove(model_id) {
            panic!("injected panic loading {model_id}");
        }
        if lock(&self.failing).contains(model_id) {
            return Err(ModelLoadError::source_error(model_id, "injected failure"));
        }
        Ok(LoadedModel {
            id: model_id.to_string(),
            version: "1.0.0".into(),
            metadata: ModelMetadata {
                size_class: SizeClass::Small,
                accuracy: Some(0.9),
            },
            artifact: Vec::new(),
        })
    }
}

// ---- Executor ----

/// Executor whose behaviour is keyed by a task's `input_ref`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    gates: Mutex<HashMap<String, watch::Sender<bool>>>,
    failures: Mutex<HashSet<String>>,
    executions: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold tasks with this input ref until [`ScriptedExecutor::release`].
    pub fn gate(&self, input_ref: &str) {
        let (tx, _) = watch::channel(false);
        lock(&self.gates).insert(input_ref.to_string(), tx);
    }

    pub fn release(&self, input_ref: &str) {
        if let Some(tx) = lock(&self.gates).get(input_ref) {
            tx.send_replace(true);
        }
    }

    pub fn fail_on(&self, input_ref: &str) {
        lock(&self.failures).insert(input_ref.to_string());
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        input: TaskInput,
        model: Arc<LoadedModel>,
        ctx: ExecutionContext,
    ) -> Result<serde_json::Value, TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        ctx.progress.report(10);

        let gate = lock(&self.gates).get(&input.input_ref).map(watch::Sender::subscribe);
        if let Some(mut gate) = gate {
            let opened = async move { gate.wait_for(|open| *open).await.is_ok() };
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(TaskError::Cancelled),
                ok = opened => {
                    if !ok {
                        return Err(TaskError::execution("gate dropped"));
                    }
                }
            }
        }

        ctx.progress.report(60);
        if lock(&self.failures).contains(&input.input_ref) {
            return Err(TaskError::execution(format!("scripted failure for {}", input.input_ref)));
        }
        ctx.progress.report(100);

        Ok(json!({
            "input_ref": input.input_ref,
            "model_id": model.id,
        }))
    }
}
