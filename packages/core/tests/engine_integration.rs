//! End-to-end scenarios against the engine facade with scripted
//! collaborators: offline buffering and exactly-once delivery, lane
//! contention, cancellation, single-flight model loads and task status
//! paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use clinical_edge::{
    alerts::{AlertPriority, MetricReading},
    events::{EngineEvent, EventKind},
    mocks::{MockModelSource, MockRemoteEndpoint, ScriptedExecutor},
    records::{DomainRecord, EntityType, RecordId, SyncStatus},
    registry::ModelState,
    scheduler::{SchedulerConfig, TaskId, TaskRequest, TaskStatus},
    store::{MemoryRecordStore, RecordStore},
    sync::{BackoffPolicy, RemoteEndpoint, SyncReport, SyncSettings},
    EdgeEngine, EngineConfig, EngineError,
};

// ---- Helpers ----------------------------------------------------------------

struct Harness {
    store: Arc<MemoryRecordStore>,
    remote: Arc<MockRemoteEndpoint>,
    models: Arc<MockModelSource>,
    executor: Arc<ScriptedExecutor>,
    engine: EdgeEngine,
}

fn config(workers: usize, queue_limit: usize, task_timeout: Duration) -> EngineConfig {
    EngineConfig {
        scheduler: SchedulerConfig {
            workers,
            queue_limit,
            task_timeout,
        },
        model_load_timeout: Duration::from_secs(5),
        sync: SyncSettings {
            interval: Duration::from_secs(3600),
            batch_size: 500,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            retention: None,
        },
        ..EngineConfig::default()
    }
}

async fn harness_with(models: MockModelSource, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryRecordStore::new());
    let remote = Arc::new(MockRemoteEndpoint::new());
    let models = Arc::new(models);
    let executor = Arc::new(ScriptedExecutor::new());
    let engine = EdgeEngine::init(
        store.clone(),
        Some(remote.clone() as Arc<dyn RemoteEndpoint>),
        models.clone(),
        executor.clone(),
        config,
    )
    .await
    .unwrap();
    Harness {
        store,
        remote,
        models,
        executor,
        engine,
    }
}

async fn harness(workers: usize) -> Harness {
    harness_with(
        MockModelSource::new(),
        config(workers, 16, Duration::from_secs(10)),
    )
    .await
}

/// Run a pass of our own, waiting out any pass already in progress.
async fn flush(engine: &EdgeEngine) -> SyncReport {
    loop {
        if let Some(report) = engine.flush_sync().await.unwrap() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_status(engine: &EdgeEngine, id: &TaskId, status: TaskStatus) {
    for _ in 0..400 {
        if engine.task(id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} never reached {status}");
}

/// Collect task status transitions from the event stream until every
/// task in `ids` has reached a terminal state.
async fn collect_paths(
    rx: &mut broadcast::Receiver<EngineEvent>,
    ids: &[TaskId],
) -> HashMap<TaskId, Vec<TaskStatus>> {
    let mut paths: HashMap<TaskId, Vec<TaskStatus>> = HashMap::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while ids
        .iter()
        .any(|id| !paths.get(id).and_then(|p| p.last()).is_some_and(|s| s.is_terminal()))
    {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for task events")
            .unwrap();
        let (id, status) = match event.kind {
            EventKind::TaskQueued { task_id, .. } => (task_id, TaskStatus::Queued),
            EventKind::TaskDispatched { task_id, .. } => (task_id, TaskStatus::Dispatched),
            EventKind::TaskStarted { task_id, .. } => (task_id, TaskStatus::Running),
            EventKind::TaskCompleted { task_id, .. } => (task_id, TaskStatus::Completed),
            EventKind::TaskFailed { task_id, .. } => (task_id, TaskStatus::Failed),
            EventKind::TaskCancelled { task_id } => (task_id, TaskStatus::Cancelled),
            _ => continue,
        };
        paths.entry(id).or_default().push(status);
    }
    paths
}

fn assert_valid_path(path: &[TaskStatus]) {
    assert_eq!(path.first(), Some(&TaskStatus::Queued), "path {path:?}");
    for pair in path.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "illegal transition {} -> {} in {path:?}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(path.iter().filter(|s| s.is_terminal()).count(), 1, "path {path:?}");
    assert!(path.last().is_some_and(|s| s.is_terminal()), "path {path:?}");
}

// ---- Offline buffering ------------------------------------------------------

#[tokio::test]
async fn records_buffered_offline_reach_the_remote_exactly_once() {
    let h = harness(1).await;
    h.engine.set_online(false);
    // Let the startup pass finish before buffering anything.
    flush(&h.engine).await;

    let mut ids: Vec<(EntityType, RecordId)> = Vec::new();
    for n in 0..12 {
        let entity_type = if n % 3 == 0 { EntityType::Scan } else { EntityType::CaseEvent };
        let record = DomainRecord::new(entity_type, json!({ "n": n }));
        ids.push((entity_type, h.engine.submit_record(record).await.unwrap()));
    }
    h.engine
        .submit_metric(MetricReading::new("bed-2", "heartRate", 150.0))
        .await
        .unwrap();

    let report = flush(&h.engine).await;
    assert!(report.skipped_offline);
    assert_eq!(h.remote.call_count(), 0);

    // Flaky link after reconnect: the first few submissions fail.
    h.remote.fail_next(3);
    h.engine.set_online(true);

    for _ in 0..200 {
        flush(&h.engine).await;
        let unsynced = h
            .store
            .query_unsynced(1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| ids.iter().any(|(_, id)| *id == r.id))
            .count();
        if unsynced == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (_, id) in &ids {
        assert_eq!(h.store.get(id).await.unwrap().sync_status, SyncStatus::Synced);
    }

    // The remote holds each record once, and per-type creation order held.
    let received = h.remote.received_ids();
    for (_, id) in &ids {
        assert_eq!(received.iter().filter(|r| *r == id).count(), 1);
    }
    for entity_type in [EntityType::Scan, EntityType::CaseEvent] {
        let created: Vec<&RecordId> = ids
            .iter()
            .filter(|(t, _)| *t == entity_type)
            .map(|(_, id)| id)
            .collect();
        let delivered: Vec<&RecordId> = received
            .iter()
            .filter(|r| created.contains(r))
            .collect();
        assert_eq!(delivered, created, "{entity_type:?} delivered out of order");
    }

    h.engine.shutdown().await;
}

#[tokio::test]
async fn failed_submissions_are_retried_not_lost() {
    let h = harness(1).await;
    // The engine believes it is online; the link itself is down.
    h.remote.set_online(false);
    let id = h
        .engine
        .submit_record(DomainRecord::new(EntityType::Scan, json!({ "barcode": "SP-1" })))
        .await
        .unwrap();

    flush(&h.engine).await;
    let stored = h.store.get(&id).await.unwrap();
    assert_ne!(stored.sync_status, SyncStatus::Synced);
    assert!(stored.retry_count >= 1);
    assert!(stored.last_error.is_some());

    h.remote.set_online(true);
    for _ in 0..200 {
        flush(&h.engine).await;
        if h.store.get(&id).await.unwrap().sync_status == SyncStatus::Synced {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.store.get(&id).await.unwrap().sync_status, SyncStatus::Synced);
    assert_eq!(h.remote.received_ids().iter().filter(|r| **r == id).count(), 1);
    h.engine.shutdown().await;
}

// ---- Alerts -----------------------------------------------------------------

#[tokio::test]
async fn oxygen_thresholds_drive_alerts() {
    let h = harness(1).await;

    let alert = h
        .engine
        .submit_metric(MetricReading::new("bed-1", "oxygenSaturation", 88.0))
        .await
        .unwrap()
        .expect("SpO2 88 should alert");
    assert_eq!(alert.priority, AlertPriority::High);

    let none = h
        .engine
        .submit_metric(MetricReading::new("bed-1", "oxygenSaturation", 96.0))
        .await
        .unwrap();
    assert!(none.is_none());

    assert_eq!(h.store.all_of(EntityType::MetricReading).await.len(), 2);
    assert_eq!(h.store.all_of(EntityType::Alert).await.len(), 1);
    h.engine.shutdown().await;
}

// ---- Scheduling -------------------------------------------------------------

#[tokio::test]
async fn third_task_waits_for_a_free_lane() {
    let h = harness(2).await;
    for input in ["a", "b", "c"] {
        h.executor.gate(input);
    }

    let a = h.engine.submit_task(TaskRequest::new("vitals_trend", "a")).await.unwrap();
    let b = h.engine.submit_task(TaskRequest::new("vitals_trend", "b")).await.unwrap();
    let c = h.engine.submit_task(TaskRequest::new("vitals_trend", "c")).await.unwrap();

    wait_for_status(&h.engine, &a, TaskStatus::Running).await;
    wait_for_status(&h.engine, &b, TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.task(&c).await.unwrap().status, TaskStatus::Queued);
    assert_eq!(h.engine.scheduler_snapshot().await.unwrap().busy_lanes(), 2);

    h.executor.release("a");
    wait_for_status(&h.engine, &a, TaskStatus::Completed).await;
    wait_for_status(&h.engine, &c, TaskStatus::Running).await;
    assert_eq!(h.engine.task(&b).await.unwrap().status, TaskStatus::Running);

    h.executor.release("b");
    h.executor.release("c");
    wait_for_status(&h.engine, &c, TaskStatus::Completed).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn cancellation_is_its_own_terminal_state() {
    let h = harness(1).await;
    h.executor.gate("running");

    let running = h
        .engine
        .submit_task(TaskRequest::new("outcome_prediction", "running"))
        .await
        .unwrap();
    let queued = h
        .engine
        .submit_task(TaskRequest::new("outcome_prediction", "queued"))
        .await
        .unwrap();
    wait_for_status(&h.engine, &running, TaskStatus::Running).await;

    h.engine.cancel_task(&queued).await.unwrap();
    h.engine.cancel_task(&running).await.unwrap();

    wait_for_status(&h.engine, &running, TaskStatus::Cancelled).await;
    let queued_task = h.engine.task(&queued).await.unwrap();
    assert_eq!(queued_task.status, TaskStatus::Cancelled);
    assert!(queued_task.error.is_none());
    assert!(queued_task.result.is_none());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_rejects_synchronously() {
    let h = harness_with(MockModelSource::new(), config(1, 2, Duration::from_secs(10))).await;
    h.executor.gate("held");

    for _ in 0..3 {
        h.engine.submit_task(TaskRequest::new("vitals_trend", "held")).await.unwrap();
    }
    let err = h
        .engine
        .submit_task(TaskRequest::new("vitals_trend", "held"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::QueueSaturated { limit: 2 }));
    assert!(err.is_retryable());

    h.executor.release("held");
    h.engine.shutdown().await;
}

#[tokio::test]
async fn every_task_follows_a_valid_status_path() {
    let h = harness(3).await;
    let mut rx = h.engine.subscribe();
    h.executor.fail_on("bad-1");
    h.executor.fail_on("bad-2");
    h.executor.gate("slow");

    let mut ids = Vec::new();
    for input in ["ok-1", "bad-1", "slow", "ok-2", "bad-2", "ok-3", "ok-4"] {
        ids.push(
            h.engine
                .submit_task(TaskRequest::new("instrument_detection", input))
                .await
                .unwrap(),
        );
    }
    h.engine.cancel_task(&ids[2]).await.unwrap();

    let paths = collect_paths(&mut rx, &ids).await;
    for id in &ids {
        assert_valid_path(&paths[id]);
    }
    assert_eq!(paths[&ids[1]].last(), Some(&TaskStatus::Failed));
    assert_eq!(paths[&ids[2]].last(), Some(&TaskStatus::Cancelled));
    assert_eq!(paths[&ids[0]].last(), Some(&TaskStatus::Completed));

    // Failures stayed local: the healthy tasks all completed.
    for idx in [0, 3, 5, 6] {
        assert_eq!(h.engine.task(&ids[idx]).await.unwrap().status, TaskStatus::Completed);
    }
    h.engine.shutdown().await;
}

#[tokio::test]
async fn stuck_task_times_out_and_frees_its_lane() {
    let h = harness_with(MockModelSource::new(), config(1, 8, Duration::from_millis(50))).await;
    h.executor.gate("stuck");

    let stuck = h.engine.submit_task(TaskRequest::new("vitals_trend", "stuck")).await.unwrap();
    let next = h.engine.submit_task(TaskRequest::new("vitals_trend", "next")).await.unwrap();

    wait_for_status(&h.engine, &stuck, TaskStatus::Failed).await;
    let error = h.engine.task(&stuck).await.unwrap().error.unwrap_or_default();
    assert!(error.contains("timeout"), "unexpected error {error}");
    wait_for_status(&h.engine, &next, TaskStatus::Completed).await;
    h.engine.shutdown().await;
}

// ---- Model registry ---------------------------------------------------------

#[tokio::test]
async fn concurrent_loads_of_one_model_run_once() {
    let h = harness_with(
        MockModelSource::new().with_delay(Duration::from_millis(50)),
        config(1, 8, Duration::from_secs(10)),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = h.engine.registry().clone();
        handles.push(tokio::spawn(async move {
            registry.ensure_loaded("surgical-outcomes").await
        }));
    }
    for handle in handles {
        let model = handle.await.unwrap().unwrap();
        assert_eq!(model.id, "surgical-outcomes");
    }
    assert_eq!(h.models.load_count("surgical-outcomes"), 1);

    let models = h.engine.models().await;
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].state, ModelState::Loaded);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn model_load_failure_fails_the_task_and_is_retryable() {
    let h = harness_with(
        MockModelSource::new().failing("vitals-trend"),
        config(1, 8, Duration::from_secs(10)),
    )
    .await;

    let first = h.engine.submit_task(TaskRequest::new("vitals_trend", "w1")).await.unwrap();
    wait_for_status(&h.engine, &first, TaskStatus::Failed).await;
    assert_eq!(h.executor.executions(), 0);

    h.models.heal("vitals-trend");
    let second = h.engine.submit_task(TaskRequest::new("vitals_trend", "w2")).await.unwrap();
    wait_for_status(&h.engine, &second, TaskStatus::Completed).await;
    assert_eq!(h.models.load_count("vitals-trend"), 2);
    h.engine.shutdown().await;
}
