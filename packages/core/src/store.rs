//! Durable local store contract and an in-memory implementation.
//!
//! [`RecordStore`] is the seam every producer and the sync engine write
//! through. A successful `put` means the record is stored; callers never
//! get an acknowledgement for data that was not written. The SQLite
//! implementation lives in [`crate::repository`]; [`MemoryRecordStore`]
//! backs tests and ephemeral sessions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::records::{DomainRecord, EntityType, RecordId, SyncStatus};

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-status record counts, used for the offline/degraded indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn unsynced(&self) -> u64 {
        self.pending + self.syncing + self.failed
    }

    fn bump(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Syncing => self.syncing += 1,
            SyncStatus::Synced => self.synced += 1,
            SyncStatus::Failed => self.failed += 1,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Append-or-update by primary key. Returns only once the write is durable.
    async fn put(&self, record: &DomainRecord) -> StoreResult<()>;

    async fn get(&self, id: &RecordId) -> StoreResult<DomainRecord>;

    /// Pending and Failed records of one entity type, oldest first.
    async fn query_pending(&self, entity_type: EntityType) -> StoreResult<Vec<DomainRecord>>;

    /// Pending and Failed records of every entity type, oldest first.
    async fn query_unsynced(&self, limit: usize) -> StoreResult<Vec<DomainRecord>>;

    /// Records that may be submitted at `now`, oldest first. Each entity
    /// type stops at its first Failed record still waiting out its
    /// backoff, so a stalled type never crowds the others out of a batch.
    async fn query_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DomainRecord>>;

    /// Move a record to `status` if [`SyncStatus::can_transition_to`]
    /// allows it from the stored status. Returns `false`, leaving the
    /// record untouched, when it has moved on in the meantime.
    async fn update_sync_status(&self, id: &RecordId, status: SyncStatus) -> StoreResult<bool>;

    /// Record a failed delivery of a Syncing record: bump `retry_count`,
    /// set Failed and the next eligible attempt time. Returns the new
    /// retry count, or `None` when the record is no longer Syncing.
    async fn mark_failed(
        &self,
        id: &RecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>>;

    /// Return records stranded in Syncing (e.g. by a crash) to Pending.
    async fn reset_in_flight(&self) -> StoreResult<u64>;

    /// Retention policy: delete Synced records created before `cutoff`.
    async fn prune_synced_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn count_by_status(&self) -> StoreResult<StatusCounts>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: HashMap<RecordId, (u64, DomainRecord)>,
    next_seq: u64,
}

impl MemoryInner {
    fn sorted_unsynced(&self, entity_type: Option<EntityType>) -> Vec<DomainRecord> {
        let mut rows: Vec<&(u64, DomainRecord)> = self
            .records
            .values()
            .filter(|(_, r)| r.sync_status.is_unsynced())
            .filter(|(_, r)| entity_type.map_or(true, |t| r.entity_type == t))
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        rows.into_iter().map(|(_, r)| r.clone()).collect()
    }

    fn record_mut(&mut self, id: &RecordId) -> StoreResult<&mut DomainRecord> {
        self.records
            .get_mut(id)
            .map(|(_, r)| r)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

/// In-memory [`RecordStore`]. Availability can be toggled to exercise the
/// `StorageUnavailable` path.
#[derive(Debug)]
pub struct MemoryRecordStore {
    inner: RwLock<MemoryInner>,
    available: AtomicBool,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing storage going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every record of one type regardless of status, oldest first.
    pub async fn all_of(&self, entity_type: EntityType) -> Vec<DomainRecord> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&(u64, DomainRecord)> = inner
            .records
            .values()
            .filter(|(_, r)| r.entity_type == entity_type)
            .collect();
        rows.sort_by_key(|(seq, r)| (r.created_at, *seq));
        rows.into_iter().map(|(_, r)| r.clone()).collect()
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory store marked unavailable"))
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: &DomainRecord) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let seq = match inner.records.get(&record.id) {
            Some((seq, _)) => *seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.records.insert(record.id.clone(), (seq, record.clone()));
        Ok(())
    }

    async fn get(&self, id: &RecordId) -> StoreResult<DomainRecord> {
        self.check_available()?;
        let inner = self.inner.read().await;
        inner
            .records
            .get(id)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn query_pending(&self, entity_type: EntityType) -> StoreResult<Vec<DomainRecord>> {
        self.check_available()?;
        Ok(self.inner.read().await.sorted_unsynced(Some(entity_type)))
    }

    async fn query_unsynced(&self, limit: usize) -> StoreResult<Vec<DomainRecord>> {
        self.check_available()?;
        let mut rows = self.inner.read().await.sorted_unsynced(None);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn query_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DomainRecord>> {
        self.check_available()?;
        let mut stalled = HashSet::new();
        let rows = self
            .inner
            .read()
            .await
            .sorted_unsynced(None)
            .into_iter()
            .filter(|r| {
                if stalled.contains(&r.entity_type) {
                    return false;
                }
                if r.is_deferred(now) {
                    stalled.insert(r.entity_type);
                    return false;
                }
                true
            })
            .take(limit)
            .collect();
        Ok(rows)
    }

    async fn update_sync_status(&self, id: &RecordId, status: SyncStatus) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(id)?;
        if !record.sync_status.can_transition_to(status) {
            return Ok(false);
        }
        record.sync_status = status;
        if status == SyncStatus::Synced {
            record.next_attempt_at = None;
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: &RecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(id)?;
        if !record.sync_status.can_transition_to(SyncStatus::Failed) {
            return Ok(None);
        }
        record.retry_count += 1;
        record.sync_status = SyncStatus::Failed;
        record.last_error = Some(error.to_string());
        record.next_attempt_at = Some(next_attempt_at);
        Ok(Some(record.retry_count))
    }

    async fn reset_in_flight(&self) -> StoreResult<u64> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let mut reset = 0;
        for (_, record) in inner.records.values_mut() {
            if record.sync_status == SyncStatus::Syncing {
                record.sync_status = SyncStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn prune_synced_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner
            .records
            .retain(|_, (_, r)| !(r.sync_status == SyncStatus::Synced && r.created_at < cutoff));
        Ok((before - inner.records.len()) as u64)
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut counts = StatusCounts::default();
        for (_, record) in inner.records.values() {
            counts.bump(record.sync_status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn make_record(entity_type: EntityType, minutes_ago: i64) -> DomainRecord {
        DomainRecord::new(entity_type, json!({ "minutes_ago": minutes_ago }))
            .with_created_at(Utc::now() - Duration::minutes(minutes_ago))
    }

    async fn mark_synced(store: &MemoryRecordStore, id: &RecordId) {
        assert!(store.update_sync_status(id, SyncStatus::Syncing).await.unwrap());
        assert!(store.update_sync_status(id, SyncStatus::Synced).await.unwrap());
    }

    // ---- put / get ----

    #[tokio::test]
    async fn put_then_get_returns_the_record() {
        let store = MemoryRecordStore::new();
        let record = make_record(EntityType::Scan, 1);
        store.put(&record).await.unwrap();

        let fetched = store.get(&record.id).await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn put_same_id_updates_in_place() {
        let store = MemoryRecordStore::new();
        let mut record = make_record(EntityType::Alert, 1);
        store.put(&record).await.unwrap();

        record.payload = json!({ "status": "acknowledged" });
        store.put(&record).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&record.id).await.unwrap().payload["status"], "acknowledged");
    }

    #[tokio::test]
    async fn get_missing_record_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store.get(&RecordId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes_without_keeping_data() {
        let store = MemoryRecordStore::new();
        store.set_available(false);

        let err = store.put(&make_record(EntityType::Scan, 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));

        store.set_available(true);
        assert!(store.is_empty().await);
    }

    // ---- query ordering ----

    #[tokio::test]
    async fn query_pending_is_oldest_first_and_filtered_by_type() {
        let store = MemoryRecordStore::new();
        let newest = make_record(EntityType::Scan, 1);
        let oldest = make_record(EntityType::Scan, 30);
        let other = make_record(EntityType::Alert, 10);
        for r in [&newest, &oldest, &other] {
            store.put(r).await.unwrap();
        }

        let scans = store.query_pending(EntityType::Scan).await.unwrap();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].id, oldest.id);
        assert_eq!(scans[1].id, newest.id);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let store = MemoryRecordStore::new();
        let at = Utc::now();
        let first = DomainRecord::new(EntityType::CaseEvent, json!({"n": 1})).with_created_at(at);
        let second = DomainRecord::new(EntityType::CaseEvent, json!({"n": 2})).with_created_at(at);
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        let rows = store.query_unsynced(10).await.unwrap();
        assert_eq!(rows[0].id, first.id);
        assert_eq!(rows[1].id, second.id);
    }

    #[tokio::test]
    async fn query_unsynced_skips_synced_and_syncing() {
        let store = MemoryRecordStore::new();
        let a = make_record(EntityType::Scan, 3);
        let b = make_record(EntityType::Scan, 2);
        let c = make_record(EntityType::Scan, 1);
        for r in [&a, &b, &c] {
            store.put(r).await.unwrap();
        }
        mark_synced(&store, &a.id).await;
        store.update_sync_status(&b.id, SyncStatus::Syncing).await.unwrap();

        let rows = store.query_unsynced(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, c.id);
    }

    #[tokio::test]
    async fn query_unsynced_respects_limit() {
        let store = MemoryRecordStore::new();
        for i in 0..5 {
            store.put(&make_record(EntityType::MetricReading, i)).await.unwrap();
        }
        assert_eq!(store.query_unsynced(2).await.unwrap().len(), 2);
    }

    // ---- status transitions ----

    #[tokio::test]
    async fn mark_failed_increments_retry_count() {
        let store = MemoryRecordStore::new();
        let record = make_record(EntityType::Scan, 0);
        store.put(&record).await.unwrap();

        let next = Utc::now() + Duration::seconds(2);
        store.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap();
        assert_eq!(store.mark_failed(&record.id, "offline", next).await.unwrap(), Some(1));
        store.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap();
        assert_eq!(store.mark_failed(&record.id, "offline", next).await.unwrap(), Some(2));

        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("offline"));
        assert_eq!(stored.next_attempt_at, Some(next));
    }

    #[tokio::test]
    async fn reset_in_flight_returns_syncing_to_pending() {
        let store = MemoryRecordStore::new();
        let record = make_record(EntityType::Scan, 0);
        store.put(&record).await.unwrap();
        store.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap();

        assert_eq!(store.reset_in_flight().await.unwrap(), 1);
        assert_eq!(store.get(&record.id).await.unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn settling_a_record_requeued_mid_submission_is_refused() {
        let store = MemoryRecordStore::new();
        let mut record = make_record(EntityType::Alert, 0);
        store.put(&record).await.unwrap();
        assert!(store.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap());

        // A producer rewrites the record while it is on the wire.
        record.payload = json!({ "status": "acknowledged" });
        store.put(&record).await.unwrap();

        assert!(!store.update_sync_status(&record.id, SyncStatus::Synced).await.unwrap());
        let next = Utc::now() + Duration::seconds(2);
        assert_eq!(store.mark_failed(&record.id, "503", next).await.unwrap(), None);
        let stored = store.get(&record.id).await.unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn pending_record_cannot_jump_to_synced() {
        let store = MemoryRecordStore::new();
        let record = make_record(EntityType::Scan, 0);
        store.put(&record).await.unwrap();

        assert!(!store.update_sync_status(&record.id, SyncStatus::Synced).await.unwrap());
        assert_eq!(store.get(&record.id).await.unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn query_ready_stops_a_type_at_its_backoff_but_not_other_types() {
        let store = MemoryRecordStore::new();
        let stalled = make_record(EntityType::CaseEvent, 30);
        let behind = make_record(EntityType::CaseEvent, 20);
        let scan = make_record(EntityType::Scan, 10);
        for r in [&stalled, &behind, &scan] {
            store.put(r).await.unwrap();
        }
        store.update_sync_status(&stalled.id, SyncStatus::Syncing).await.unwrap();
        store
            .mark_failed(&stalled.id, "503", Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let ready = store.query_ready(Utc::now(), 1).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, scan.id);

        let later = store.query_ready(Utc::now() + Duration::minutes(10), 10).await.unwrap();
        let ids: Vec<_> = later.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![stalled.id, behind.id, scan.id]);
    }

    // ---- retention ----

    #[tokio::test]
    async fn prune_only_removes_old_synced_records() {
        let store = MemoryRecordStore::new();
        let old_synced = make_record(EntityType::Scan, 120);
        let old_pending = make_record(EntityType::Scan, 120);
        let new_synced = make_record(EntityType::Scan, 5);
        for r in [&old_synced, &old_pending, &new_synced] {
            store.put(r).await.unwrap();
        }
        mark_synced(&store, &old_synced.id).await;
        mark_synced(&store, &new_synced.id).await;

        let pruned = store.prune_synced_before(Utc::now() - Duration::hours(1)).await.unwrap();

        assert_eq!(pruned, 1);
        assert!(store.get(&old_pending.id).await.is_ok());
        assert!(store.get(&new_synced.id).await.is_ok());
    }

    #[tokio::test]
    async fn count_by_status_tallies_every_record() {
        let store = MemoryRecordStore::new();
        let a = make_record(EntityType::Scan, 2);
        let b = make_record(EntityType::Scan, 1);
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();
        mark_synced(&store, &a.id).await;

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.synced, 1);
        assert_eq!(counts.unsynced(), 1);
    }
}
