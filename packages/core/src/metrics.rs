//! Prometheus metrics registry for the clinical edge engine.
//!
//! [`EngineMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Counters are driven from the event stream by
//! [`spawn_event_observer`]; gauges are refreshed by the engine right
//! before a scrape.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use std::sync::Arc;

use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, EventKind};
use crate::registry::ModelState;

pub struct EngineMetrics {
    /// Tasks accepted into the queue.
    pub tasks_submitted_total: Counter,
    /// Terminal task outcomes, labelled by status.
    pub task_outcomes_total: CounterVec,
    pub queue_depth: Gauge,
    pub busy_lanes: Gauge,
    pub models_loaded: Gauge,
    pub model_load_failures_total: Counter,
    pub sync_passes_total: Counter,
    pub sync_records_synced_total: Counter,
    pub sync_failures_total: Counter,
    /// Alerts raised, labelled by priority.
    pub alerts_raised_total: CounterVec,
    /// HTTP ingress requests by method, route and status code.
    pub http_requests_total: CounterVec,
    pub registry: Registry,
}

impl EngineMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_submitted_total = Counter::with_opts(Opts::new(
            "clinical_edge_tasks_submitted_total",
            "Tasks accepted into the scheduler queue",
        ))?;
        let task_outcomes_total = CounterVec::new(
            Opts::new(
                "clinical_edge_task_outcomes_total",
                "Terminal task outcomes by status",
            ),
            &["status"],
        )?;
        let queue_depth = Gauge::with_opts(Opts::new(
            "clinical_edge_queue_depth",
            "Tasks waiting for a free lane",
        ))?;
        let busy_lanes = Gauge::with_opts(Opts::new(
            "clinical_edge_busy_lanes",
            "Worker lanes currently running a task",
        ))?;
        let models_loaded = Gauge::with_opts(Opts::new(
            "clinical_edge_models_loaded",
            "Models resident in the registry",
        ))?;
        let model_load_failures_total = Counter::with_opts(Opts::new(
            "clinical_edge_model_load_failures_total",
            "Model loads that failed or timed out",
        ))?;
        let sync_passes_total = Counter::with_opts(Opts::new(
            "clinical_edge_sync_passes_total",
            "Completed sync passes",
        ))?;
        let sync_records_synced_total = Counter::with_opts(Opts::new(
            "clinical_edge_sync_records_synced_total",
            "Records accepted by the remote endpoint",
        ))?;
        let sync_failures_total = Counter::with_opts(Opts::new(
            "clinical_edge_sync_failures_total",
            "Record submissions that failed",
        ))?;
        let alerts_raised_total = CounterVec::new(
            Opts::new(
                "clinical_edge_alerts_raised_total",
                "Alerts raised by priority",
            ),
            &["priority"],
        )?;
        let http_requests_total = CounterVec::new(
            Opts::new(
                "clinical_edge_http_requests_total",
                "HTTP requests by method, path, and status",
            ),
            &["method", "path", "status"],
        )?;

        registry.register(Box::new(tasks_submitted_total.clone()))?;
        registry.register(Box::new(task_outcomes_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(busy_lanes.clone()))?;
        registry.register(Box::new(models_loaded.clone()))?;
        registry.register(Box::new(model_load_failures_total.clone()))?;
        registry.register(Box::new(sync_passes_total.clone()))?;
        registry.register(Box::new(sync_records_synced_total.clone()))?;
        registry.register(Box::new(sync_failures_total.clone()))?;
        registry.register(Box::new(alerts_raised_total.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            tasks_submitted_total,
            task_outcomes_total,
            queue_depth,
            busy_lanes,
            models_loaded,
            model_load_failures_total,
            sync_passes_total,
            sync_records_synced_total,
            sync_failures_total,
            alerts_raised_total,
            http_requests_total,
            registry,
        })
    }

    /// Fold one engine event into the counters.
    pub fn observe(&self, event: &EngineEvent) {
        match &event.kind {
            EventKind::TaskQueued { .. } => self.tasks_submitted_total.inc(),
            EventKind::TaskCompleted { .. } => {
                self.task_outcomes_total.with_label_values(&["completed"]).inc()
            }
            EventKind::TaskFailed { .. } => {
                self.task_outcomes_total.with_label_values(&["failed"]).inc()
            }
            EventKind::TaskCancelled { .. } => {
                self.task_outcomes_total.with_label_values(&["cancelled"]).inc()
            }
            EventKind::ModelStatusChanged {
                state: ModelState::LoadFailed,
                ..
            } => self.model_load_failures_total.inc(),
            EventKind::AlertRaised { alert } => {
                let priority = alert.priority.to_string();
                self.alerts_raised_total
                    .with_label_values(&[priority.as_str()])
                    .inc();
            }
            EventKind::SyncPassCompleted { report } => {
                if !report.skipped_offline {
                    self.sync_passes_total.inc();
                }
                self.sync_records_synced_total.inc_by(report.synced as f64);
                self.sync_failures_total.inc_by(report.failed as f64);
            }
            _ => {}
        }
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}

/// Feed every event from `events` into `metrics` until `shutdown` fires
/// or the bus closes. A lagging observer skips ahead rather than stalling.
pub fn spawn_event_observer(
    metrics: Arc<EngineMetrics>,
    mut events: broadcast::Receiver<EngineEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => metrics.observe(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "metrics observer lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
