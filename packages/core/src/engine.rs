//! The engine facade: wires the store, registry, scheduler, sync loop and
//! alert engine together and exposes the narrow ingress API producers use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerts::{Alert, AlertEngine, MetricReading, ThresholdTable};
use crate::audit::{AuditAction, AuditLog};
use crate::error::{EngineError, StoreError};
use crate::events::{EngineEvent, EventBus, EventKind, DEFAULT_EVENT_CAPACITY};
use crate::metrics::{spawn_event_observer, EngineMetrics};
use crate::records::{DomainRecord, EntityType, RecordId, SyncStatus};
use crate::registry::{ModelHandle, ModelRegistry, ModelSource};
use crate::scheduler::{
    CancelOutcome, Scheduler, SchedulerConfig, SchedulerSnapshot, Task, TaskExecutor, TaskId,
    TaskRequest, TaskRoutes,
};
use crate::store::RecordStore;
use crate::sync::{RemoteEndpoint, SyncEngine, SyncReport, SyncSettings, SyncState};

/// Library-level configuration. The binary fills it from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub model_load_timeout: Duration,
    pub sync: SyncSettings,
    pub routes: TaskRoutes,
    pub thresholds: ThresholdTable,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            model_load_timeout: Duration::from_secs(30),
            sync: SyncSettings::default(),
            routes: TaskRoutes::clinical_defaults(),
            thresholds: ThresholdTable::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

struct EngineInner {
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
    events: EventBus,
    registry: ModelRegistry,
    scheduler: Scheduler,
    sync: SyncEngine,
    alerts: AlertEngine,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running engine. Clones share the same components.
#[derive(Clone)]
pub struct EdgeEngine {
    inner: Arc<EngineInner>,
}

impl EdgeEngine {
    /// Build every component and start the background loops. Records a
    /// previous process left mid-sync are returned to `Pending` first.
    pub async fn init(
        store: Arc<dyn RecordStore>,
        remote: Option<Arc<dyn RemoteEndpoint>>,
        models: Arc<dyn ModelSource>,
        executor: Arc<dyn TaskExecutor>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let recovered = store.reset_in_flight().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "records left in flight by a previous run reset to pending");
        }

        let metrics = Arc::new(
            EngineMetrics::new()
                .map_err(|err| EngineError::config(format!("metrics registry: {err}")))?,
        );
        let events = EventBus::new(config.event_capacity);
        let shutdown = CancellationToken::new();

        let metrics_handle =
            spawn_event_observer(metrics.clone(), events.subscribe(), shutdown.child_token());

        let registry = ModelRegistry::new(models, config.model_load_timeout, events.clone());
        let scheduler = Scheduler::start(
            config.scheduler,
            config.routes,
            registry.clone(),
            executor,
            store.clone(),
            events.clone(),
        );
        let sync = SyncEngine::new(store.clone(), remote, events.clone(), config.sync);
        let sync_handle = sync.spawn(shutdown.child_token());
        let alerts = AlertEngine::new(store.clone(), events.clone(), config.thresholds);

        tracing::info!(online = sync.is_online(), "Clinical edge engine started");

        Ok(Self {
            inner: Arc::new(EngineInner {
                audit: AuditLog::new(store.clone()),
                store,
                events,
                registry,
                scheduler,
                sync,
                alerts,
                metrics,
                shutdown,
                background: Mutex::new(vec![sync_handle, metrics_handle]),
            }),
        })
    }

    /// Durably store a producer's record and schedule it for sync. The
    /// record is on disk before this returns.
    ///
    /// Alerts, audit entries and task results are engine-produced and are
    /// rejected here, as is an id that is already taken.
    pub async fn submit_record(&self, mut record: DomainRecord) -> Result<RecordId, EngineError> {
        if matches!(
            record.entity_type,
            EntityType::Alert | EntityType::AuditEntry | EntityType::TaskResult
        ) {
            return Err(EngineError::invalid_input(format!(
                "{} records are produced by the engine",
                record.entity_type.as_str()
            )));
        }
        if record.id.as_str().trim().is_empty() {
            return Err(EngineError::invalid_input("record id must not be empty"));
        }
        match self.inner.store.get(&record.id).await {
            Ok(_) => {
                return Err(EngineError::invalid_input(format!(
                    "record id {} is already in use",
                    record.id
                )))
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        record.sync_status = SyncStatus::Pending;
        record.retry_count = 0;
        record.last_error = None;
        record.next_attempt_at = None;

        self.inner.store.put(&record).await?;
        tracing::debug!(
            record_id = %record.id,
            entity_type = record.entity_type.as_str(),
            "record stored"
        );

        self.inner
            .audit
            .write_or_warn(
                AuditAction::RecordSubmitted,
                record.id.to_string(),
                json!({ "entity_type": record.entity_type }),
            )
            .await;
        self.inner.events.emit(EventKind::SyncStatusChanged {
            record_id: record.id.clone(),
            entity_type: record.entity_type,
            status: SyncStatus::Pending,
        });
        if self.inner.sync.is_online() {
            self.inner.sync.request_flush();
        }
        Ok(record.id)
    }

    pub async fn submit_task(&self, request: TaskRequest) -> Result<TaskId, EngineError> {
        self.inner.scheduler.submit(request).await
    }

    /// Store and evaluate a reading; returns the alert it raised, if any.
    pub async fn submit_metric(&self, reading: MetricReading) -> Result<Option<Alert>, EngineError> {
        let alert = self.inner.alerts.ingest(reading).await?;
        if self.inner.sync.is_online() {
            self.inner.sync.request_flush();
        }
        Ok(alert)
    }

    pub async fn cancel_task(&self, id: &TaskId) -> Result<CancelOutcome, EngineError> {
        self.inner.scheduler.cancel(id).await
    }

    pub async fn task(&self, id: &TaskId) -> Result<Task, EngineError> {
        self.inner
            .scheduler
            .task(id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub async fn scheduler_snapshot(&self) -> Result<SchedulerSnapshot, EngineError> {
        self.inner.scheduler.snapshot().await
    }

    pub async fn acknowledge_alert(&self, alert_id: &RecordId) -> Result<Alert, EngineError> {
        let alert = self.inner.alerts.acknowledge(alert_id).await?;
        if self.inner.sync.is_online() {
            self.inner.sync.request_flush();
        }
        Ok(alert)
    }

    /// Run a sync pass now. `None` means a pass was already running and
    /// will pick this request up.
    pub async fn flush_sync(&self) -> Result<Option<SyncReport>, EngineError> {
        self.inner.sync.trigger().await
    }

    pub fn set_online(&self, online: bool) {
        self.inner.sync.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.inner.sync.is_online()
    }

    pub async fn sync_status(&self) -> Result<SyncState, EngineError> {
        self.inner.sync.state().await
    }

    pub async fn models(&self) -> Vec<ModelHandle> {
        self.inner.registry.snapshot().await
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    /// Refresh the point-in-time gauges and render the registry.
    pub async fn render_metrics(&self) -> Result<String, EngineError> {
        let metrics = &self.inner.metrics;
        if let Ok(snapshot) = self.inner.scheduler.snapshot().await {
            metrics.queue_depth.set(snapshot.queued.len() as f64);
            metrics.busy_lanes.set(snapshot.busy_lanes() as f64);
        }
        metrics
            .models_loaded
            .set(self.inner.registry.loaded_count().await as f64);
        metrics
            .render()
            .map_err(|err| EngineError::config(format!("metrics encoding: {err}")))
    }

    /// Stop the background loops and the scheduler. Queued and running
    /// tasks end `Cancelled`. Safe to call more than once.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down clinical edge engine");
        self.inner.shutdown.cancel();
        self.inner.scheduler.shutdown().await;

        let handles: Vec<_> = self.inner.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("background task ended abnormally: {}", err);
            }
        }
        tracing::info!("Clinical edge engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::alerts::AlertPriority;
    use crate::mocks::{MockModelSource, MockRemoteEndpoint, ScriptedExecutor};
    use crate::scheduler::TaskStatus;
    use crate::store::MemoryRecordStore;

    struct Harness {
        store: Arc<MemoryRecordStore>,
        remote: Arc<MockRemoteEndpoint>,
        executor: Arc<ScriptedExecutor>,
        engine: EdgeEngine,
    }

    fn config(workers: usize, queue_limit: usize) -> EngineConfig {
        EngineConfig {
            scheduler: SchedulerConfig {
                workers,
                queue_limit,
                task_timeout: Duration::from_secs(10),
            },
            sync: SyncSettings {
                interval: Duration::from_secs(3600),
                retention: None,
                ..SyncSettings::default()
            },
            ..EngineConfig::default()
        }
    }

    async fn harness(config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = Arc::new(MockRemoteEndpoint::new());
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = EdgeEngine::init(
            store.clone(),
            Some(remote.clone() as Arc<dyn RemoteEndpoint>),
            Arc::new(MockModelSource::new()),
            executor.clone(),
            config,
        )
        .await
        .unwrap();
        Harness {
            store,
            remote,
            executor,
            engine,
        }
    }

    async fn wait_for_status(engine: &EdgeEngine, id: &TaskId, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = engine.task(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {status}");
    }

    /// Run a pass of our own, waiting out any pass the background loop
    /// already started.
    async fn flush(engine: &EdgeEngine) -> SyncReport {
        loop {
            if let Some(report) = engine.flush_sync().await.unwrap() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn submitted_record_is_durable_and_audited() {
        let h = harness(config(1, 8)).await;
        h.engine.set_online(false);
        flush(&h.engine).await;

        let mut record = DomainRecord::new(EntityType::Scan, json!({ "barcode": "0123" }));
        record.sync_status = SyncStatus::Synced;
        let id = h.engine.submit_record(record).await.unwrap();

        let stored = h.store.get(&id).await.unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        let audits = h.store.all_of(EntityType::AuditEntry).await;
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].payload["action"], "record_submitted");

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn engine_owned_types_and_reused_ids_are_rejected() {
        let h = harness(config(1, 8)).await;

        let err = h
            .engine
            .submit_record(DomainRecord::new(EntityType::AuditEntry, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));

        let record = DomainRecord::new(EntityType::Scan, json!({})).with_id("scan-1");
        h.engine.submit_record(record.clone()).await.unwrap();
        let err = h.engine.submit_record(record).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));

        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn storage_outage_fails_submission() {
        let h = harness(config(1, 8)).await;
        h.store.set_available(false);

        let err = h
            .engine
            .submit_record(DomainRecord::new(EntityType::CaseEvent, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));

        h.store.set_available(true);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn offline_records_sync_once_after_reconnect() {
        let h = harness(config(1, 8)).await;
        h.engine.set_online(false);
        flush(&h.engine).await;

        let mut ids = Vec::new();
        for n in 0..5 {
            let record = DomainRecord::new(EntityType::CaseEvent, json!({ "n": n }));
            ids.push(h.engine.submit_record(record).await.unwrap());
        }
        let report = flush(&h.engine).await;
        assert!(report.skipped_offline);
        assert_eq!(h.remote.call_count(), 0);

        h.engine.set_online(true);
        flush(&h.engine).await;

        for id in &ids {
            assert_eq!(h.remote.calls_for(id), 1);
            assert_eq!(h.store.get(id).await.unwrap().sync_status, SyncStatus::Synced);
        }
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn metric_submission_raises_alert() {
        let h = harness(config(1, 8)).await;

        let alert = h
            .engine
            .submit_metric(MetricReading::new("bed-3", "oxygenSaturation", 88.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.priority, AlertPriority::High);

        let none = h
            .engine
            .submit_metric(MetricReading::new("bed-3", "oxygenSaturation", 96.0))
            .await
            .unwrap();
        assert!(none.is_none());

        let acked = h.engine.acknowledge_alert(&alert.id).await.unwrap();
        assert_eq!(acked.status, crate::alerts::AlertStatus::Acknowledged);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_running_and_queued_tasks() {
        let h = harness(config(1, 8)).await;
        h.executor.gate("held");

        let running = h
            .engine
            .submit_task(TaskRequest::new("vitals_trend", "held"))
            .await
            .unwrap();
        wait_for_status(&h.engine, &running, TaskStatus::Running).await;
        let queued = h
            .engine
            .submit_task(TaskRequest::new("vitals_trend", "later"))
            .await
            .unwrap();

        h.engine.shutdown().await;

        let results = h.store.all_of(EntityType::TaskResult).await;
        for id in [&running, &queued] {
            let record = results
                .iter()
                .find(|r| r.id.as_str() == id.as_str())
                .unwrap_or_else(|| panic!("no result record for {id}"));
            assert_eq!(record.payload["status"], "cancelled");
        }
        // A stopped engine rejects new work instead of hanging.
        let err = h
            .engine
            .submit_task(TaskRequest::new("vitals_trend", "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Stopped { .. }));
    }

    #[tokio::test]
    async fn unknown_task_lookup_is_not_found() {
        let h = harness(config(1, 8)).await;
        let err = h.engine.task(&TaskId::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn metrics_render_reflects_activity() {
        let h = harness(config(2, 8)).await;
        let id = h
            .engine
            .submit_task(TaskRequest::new("vitals_trend", "bed-1"))
            .await
            .unwrap();
        wait_for_status(&h.engine, &id, TaskStatus::Completed).await;

        let mut text = String::new();
        for _ in 0..100 {
            text = h.engine.render_metrics().await.unwrap();
            if text.contains("clinical_edge_task_outcomes_total{status=\"completed\"} 1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(text.contains("clinical_edge_tasks_submitted_total 1"));
        assert!(text.contains("clinical_edge_task_outcomes_total{status=\"completed\"} 1"));
        assert!(text.contains("clinical_edge_models_loaded 1"));
        h.engine.shutdown().await;
    }
}
