//! Reconciliation of buffered records with the remote endpoint.
//!
//! A pass walks ready records oldest first. Each record goes
//! `Syncing -> Synced` on success or `Syncing -> Failed` (with a backoff
//! deadline) on failure. An entity type whose oldest unsynced record is
//! still waiting out its backoff is skipped entirely, and once a record
//! fails mid-pass the rest of its type is held back, so per-type creation
//! order is never overtaken while other types keep flowing.
//!
//! Passes never overlap. A trigger that arrives mid-pass is folded into
//! a single follow-up pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditLog};
use crate::error::{EngineError, RemoteError};
use crate::events::{EventBus, EventKind};
use crate::records::{DomainRecord, EntityType, RecordId, SyncStatus};
use crate::store::{RecordStore, StatusCounts};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::remote::RemoteEndpoint;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub backoff: BackoffPolicy,
    /// Synced records older than this are pruned after each pass.
    pub retention: Option<chrono::Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
            backoff: BackoffPolicy::default().with_jitter(0.2),
            retention: Some(chrono::Duration::days(30)),
        }
    }
}

/// Outcome of one or more coalesced passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Ready records held back behind an earlier record of their type.
    pub deferred: usize,
    pub skipped_offline: bool,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.attempted += other.attempted;
        self.synced += other.synced;
        self.failed += other.failed;
        self.deferred = other.deferred;
        self.skipped_offline = other.skipped_offline;
    }
}

/// Snapshot for the offline/degraded indicator.
#[derive(Debug, Clone, Serialize)]
pub struct SyncState {
    pub online: bool,
    pub remote_configured: bool,
    pub pass_running: bool,
    pub counts: StatusCounts,
}

enum Settled {
    Synced,
    Failed,
    /// Rewritten by a producer during submission.
    Superseded,
}

#[derive(Debug, Default)]
struct PassState {
    running: bool,
    follow_up: bool,
}

struct SyncInner {
    store: Arc<dyn RecordStore>,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    audit: AuditLog,
    events: EventBus,
    settings: SyncSettings,
    online: watch::Sender<bool>,
    pass: Mutex<PassState>,
    flush: Notify,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

impl SyncEngine {
    /// Without a remote every pass is skipped as offline.
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Option<Arc<dyn RemoteEndpoint>>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        let (online, _) = watch::channel(remote.is_some());
        Self {
            inner: Arc::new(SyncInner {
                audit: AuditLog::new(store.clone()),
                store,
                remote,
                events,
                settings,
                online,
                pass: Mutex::new(PassState::default()),
                flush: Notify::new(),
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Update connectivity. Going online wakes the background loop.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(online, "connectivity changed");
            self.inner.events.emit(EventKind::ConnectivityChanged { online });
        }
    }

    /// Ask the background loop for a pass without waiting for it.
    pub fn request_flush(&self) {
        self.inner.flush.notify_one();
    }

    pub async fn state(&self) -> Result<SyncState, EngineError> {
        let counts = self.inner.store.count_by_status().await?;
        Ok(SyncState {
            online: self.is_online(),
            remote_configured: self.inner.remote.is_some(),
            pass_running: self.inner.pass.lock().await.running,
            counts,
        })
    }

    /// Run a pass now. Returns `Ok(None)` when a pass was already running;
    /// that pass will run one follow-up that covers this request.
    pub async fn trigger(&self) -> Result<Option<SyncReport>, EngineError> {
        {
            let mut pass = self.inner.pass.lock().await;
            if pass.running {
                pass.follow_up = true;
                tracing::debug!("sync pass already running, follow-up scheduled");
                return Ok(None);
            }
            pass.running = true;
        }

        // Spawned so that a caller dropping this future cannot strand the
        // running flag.
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_passes().await });
        match handle.await {
            Ok(result) => result.map(Some),
            Err(err) => {
                tracing::error!("sync pass task aborted: {}", err);
                let mut pass = self.inner.pass.lock().await;
                pass.running = false;
                pass.follow_up = false;
                Err(EngineError::stopped("sync pass"))
            }
        }
    }

    async fn run_passes(&self) -> Result<SyncReport, EngineError> {
        let mut total = SyncReport::default();
        loop {
            let outcome = self.run_pass().await;
            let mut pass = self.inner.pass.lock().await;
            let (report, batch_full) = match outcome {
                Ok(v) => v,
                Err(err) => {
                    pass.running = false;
                    pass.follow_up = false;
                    return Err(err);
                }
            };
            total.absorb(report);

            // A full batch with progress means more records are waiting.
            let more = batch_full && report.synced > 0;
            if pass.follow_up || more {
                pass.follow_up = false;
                continue;
            }
            pass.running = false;
            return Ok(total);
        }
    }

    async fn run_pass(&self) -> Result<(SyncReport, bool), EngineError> {
        let inner = &self.inner;
        let mut report = SyncReport::default();

        let remote = match (&inner.remote, self.is_online()) {
            (Some(remote), true) => remote.clone(),
            _ => {
                report.skipped_offline = true;
                tracing::debug!("offline, sync pass skipped");
                inner.events.emit(EventKind::SyncPassCompleted { report });
                return Ok((report, false));
            }
        };

        // Passes never overlap, so anything still Syncing was stranded by
        // a pass that lost the store mid-submission.
        let stranded = inner.store.reset_in_flight().await?;
        if stranded > 0 {
            tracing::warn!(stranded, "returned stranded in-flight records to pending");
        }

        let now = Utc::now();
        let batch = inner.store.query_ready(now, inner.settings.batch_size).await?;
        let batch_full = batch.len() >= inner.settings.batch_size;
        let mut held_back: HashSet<EntityType> = HashSet::new();
        let mut submitted_non_audit = false;

        for record in batch {
            if held_back.contains(&record.entity_type) || record.is_deferred(now) || !self.is_online() {
                held_back.insert(record.entity_type);
                report.deferred += 1;
                continue;
            }
            if !inner.store.update_sync_status(&record.id, SyncStatus::Syncing).await? {
                held_back.insert(record.entity_type);
                report.deferred += 1;
                continue;
            }
            self.emit_status(&record.id, record.entity_type, SyncStatus::Syncing);
            report.attempted += 1;
            if record.entity_type != EntityType::AuditEntry {
                submitted_non_audit = true;
            }

            let outcome = remote.submit(&record).await;
            match self.settle(&record, outcome).await {
                Ok(Settled::Synced) => report.synced += 1,
                Ok(Settled::Failed) => {
                    held_back.insert(record.entity_type);
                    report.failed += 1;
                }
                Ok(Settled::Superseded) => {
                    held_back.insert(record.entity_type);
                    report.deferred += 1;
                }
                Err(err) => {
                    self.release(&record).await;
                    return Err(err);
                }
            }
        }

        // Audit-only passes write no summary, so audit traffic converges.
        if submitted_non_audit {
            inner
                .audit
                .write_or_warn(
                    AuditAction::SyncPass,
                    now.to_rfc3339(),
                    json!({
                        "attempted": report.attempted,
                        "synced": report.synced,
                        "failed": report.failed,
                        "deferred": report.deferred,
                    }),
                )
                .await;
        }

        if let Some(retention) = inner.settings.retention {
            match inner.store.prune_synced_before(now - retention).await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned, "pruned synced records past retention"),
                Err(err) => tracing::warn!("retention prune failed: {}", err),
            }
        }

        tracing::info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            deferred = report.deferred,
            "sync pass complete"
        );
        inner.events.emit(EventKind::SyncPassCompleted { report });
        Ok((report, batch_full))
    }

    /// Record the outcome of one submission. A record rewritten by a
    /// producer while it was on the wire is left Pending for the next pass.
    async fn settle(
        &self,
        record: &DomainRecord,
        outcome: Result<(), RemoteError>,
    ) -> Result<Settled, EngineError> {
        let inner = &self.inner;
        match outcome {
            Ok(()) => {
                if !inner.store.update_sync_status(&record.id, SyncStatus::Synced).await? {
                    tracing::debug!(record_id = %record.id, "record rewritten during submission, resending");
                    return Ok(Settled::Superseded);
                }
                self.emit_status(&record.id, record.entity_type, SyncStatus::Synced);
                Ok(Settled::Synced)
            }
            Err(err) => {
                let next = inner.settings.backoff.next_attempt_at(record.retry_count, Utc::now());
                let Some(retries) = inner.store.mark_failed(&record.id, &err.to_string(), next).await? else {
                    tracing::debug!(record_id = %record.id, "record rewritten during submission, resending");
                    return Ok(Settled::Superseded);
                };
                tracing::warn!(
                    record_id = %record.id,
                    entity_type = %record.entity_type,
                    retries,
                    "sync submission failed: {}",
                    err
                );
                self.emit_status(&record.id, record.entity_type, SyncStatus::Failed);
                Ok(Settled::Failed)
            }
        }
    }

    /// Best effort: put a record back to Pending after the store failed
    /// mid-submission. If the store is still down the next pass recovers it.
    async fn release(&self, record: &DomainRecord) {
        if let Err(err) = self.inner.store.update_sync_status(&record.id, SyncStatus::Pending).await {
            tracing::warn!(record_id = %record.id, "record left in flight until the next pass: {}", err);
        }
    }

    fn emit_status(&self, id: &RecordId, entity_type: EntityType, status: SyncStatus) {
        self.inner.events.emit(EventKind::SyncStatusChanged {
            record_id: id.clone(),
            entity_type,
            status,
        });
    }

    /// Start the background loop: periodic timer, connectivity restored,
    /// or an explicit [`SyncEngine::request_flush`]. Stops on `shutdown`.
    pub fn spawn(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut interval = time::interval(self.inner.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut online_rx = self.inner.online.subscribe();

        tracing::info!(
            "Sync loop started (interval: {}s)",
            self.inner.settings.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.inner.flush.notified() => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online_rx.borrow_and_update() {
                        continue;
                    }
                    tracing::info!("connectivity restored, starting sync pass");
                }
            }

            if let Err(err) = self.trigger().await {
                tracing::error!("sync pass failed: {}", err);
            }
        }

        tracing::info!("Sync loop stopped cleanly");
    }
}
