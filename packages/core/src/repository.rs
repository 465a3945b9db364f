//! SQLite-backed [`RecordStore`].
//!
//! All SQLite read/write logic for domain records lives here. Producers
//! call [`RecordStore::put`] through the engine; the sync engine reads
//! unsynced rows oldest-first and moves their status. On startup,
//! [`RecordStore::reset_in_flight`] recovers rows a crash left in
//! `syncing`.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that lexical order equals time order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::records::{DomainRecord, EntityType, RecordId, SyncStatus};
use crate::store::{RecordStore, StatusCounts, StoreResult};

const RECORD_COLUMNS: &str = "id, entity_type, payload, created_at, sync_status, retry_count, last_error, next_attempt_at";

/// Repository for reading and writing domain records to SQLite.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_exists(&self, id: &RecordId) -> StoreResult<()> {
        sqlx::query("SELECT 1 FROM domain_records WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::corrupt(format!("bad timestamp {raw:?}: {err}")))
}

fn row_to_record(row: &SqliteRow) -> StoreResult<DomainRecord> {
    let id: String = row.try_get("id")?;
    let entity_type: String = row.try_get("entity_type")?;
    let payload: String = row.try_get("payload")?;
    let created_at: String = row.try_get("created_at")?;
    let sync_status: String = row.try_get("sync_status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let next_attempt_at: Option<String> = row.try_get("next_attempt_at")?;

    Ok(DomainRecord {
        id: RecordId(id),
        entity_type: entity_type.parse().map_err(StoreError::corrupt)?,
        payload: serde_json::from_str(&payload)
            .map_err(|err| StoreError::corrupt(format!("bad payload json: {err}")))?,
        created_at: from_db_time(&created_at)?,
        sync_status: sync_status.parse().map_err(StoreError::corrupt)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StoreError::corrupt(format!("negative retry_count {retry_count}")))?,
        last_error,
        next_attempt_at: next_attempt_at.as_deref().map(from_db_time).transpose()?,
    })
}

#[async_trait]
impl RecordStore for RecordRepository {
    async fn put(&self, record: &DomainRecord) -> StoreResult<()> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|err| StoreError::corrupt(format!("payload not serializable: {err}")))?;

        sqlx::query(
            "INSERT INTO domain_records
             (id, entity_type, payload, created_at, sync_status, retry_count, last_error, next_attempt_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 sync_status = excluded.sync_status,
                 retry_count = excluded.retry_count,
                 last_error = excluded.last_error,
                 next_attempt_at = excluded.next_attempt_at,
                 updated_at = excluded.updated_at",
        )
        .bind(record.id.as_str())
        .bind(record.entity_type.as_str())
        .bind(&payload)
        .bind(to_db_time(record.created_at))
        .bind(record.sync_status.as_str())
        .bind(i64::from(record.retry_count))
        .bind(record.last_error.as_deref())
        .bind(record.next_attempt_at.map(to_db_time))
        .bind(to_db_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &RecordId) -> StoreResult<DomainRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM domain_records WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        row_to_record(&row)
    }

    async fn query_pending(&self, entity_type: EntityType) -> StoreResult<Vec<DomainRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM domain_records
             WHERE entity_type = ? AND sync_status IN ('pending', 'failed')
             ORDER BY created_at ASC, seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(entity_type.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn query_unsynced(&self, limit: usize) -> StoreResult<Vec<DomainRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM domain_records
             WHERE sync_status IN ('pending', 'failed')
             ORDER BY created_at ASC, seq ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn query_ready(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<DomainRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let now = to_db_time(now);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM domain_records r
             WHERE r.sync_status IN ('pending', 'failed')
               AND NOT (r.sync_status = 'failed' AND COALESCE(r.next_attempt_at, '') > ?)
               AND NOT EXISTS (
                   SELECT 1 FROM domain_records d
                   WHERE d.entity_type = r.entity_type
                     AND d.sync_status = 'failed'
                     AND COALESCE(d.next_attempt_at, '') > ?
                     AND (d.created_at < r.created_at
                          OR (d.created_at = r.created_at AND d.seq < r.seq))
               )
             ORDER BY r.created_at ASC, r.seq ASC
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(now.as_str())
            .bind(now.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn update_sync_status(&self, id: &RecordId, status: SyncStatus) -> StoreResult<bool> {
        let allowed = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE domain_records
             SET sync_status = ?,
                 next_attempt_at = CASE WHEN ? = 'synced' THEN NULL ELSE next_attempt_at END,
                 updated_at = ?
             WHERE id = ? AND sync_status IN ({allowed})"
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(status.as_str())
            .bind(to_db_time(Utc::now()))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            self.ensure_exists(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: &RecordId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<Option<u32>> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE domain_records
             SET sync_status = 'failed',
                 retry_count = retry_count + 1,
                 last_error = ?,
                 next_attempt_at = ?,
                 updated_at = ?
             WHERE id = ? AND sync_status = 'syncing'",
        )
        .bind(error)
        .bind(to_db_time(next_attempt_at))
        .bind(to_db_time(Utc::now()))
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query("SELECT retry_count FROM domain_records WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let retry_count: i64 = row.try_get("retry_count")?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        u32::try_from(retry_count)
            .map(Some)
            .map_err(|_| StoreError::corrupt(format!("negative retry_count {retry_count}")))
    }

    async fn reset_in_flight(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE domain_records SET sync_status = 'pending', updated_at = ? WHERE sync_status = 'syncing'",
        )
        .bind(to_db_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn prune_synced_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM domain_records WHERE sync_status = 'synced' AND created_at < ?",
        )
        .bind(to_db_time(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        let rows = sqlx::query(
            "SELECT sync_status, COUNT(*) AS cnt FROM domain_records GROUP BY sync_status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.try_get("sync_status")?;
            let count: i64 = row.try_get("cnt")?;
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse().map_err(StoreError::corrupt)? {
                SyncStatus::Pending => counts.pending = count,
                SyncStatus::Syncing => counts.syncing = count,
                SyncStatus::Synced => counts.synced = count,
                SyncStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    use crate::db::create_pool;

    async fn make_repo() -> RecordRepository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        RecordRepository::new(pool)
    }

    fn make_record(entity_type: EntityType, seconds_ago: i64) -> DomainRecord {
        DomainRecord::new(entity_type, json!({ "seconds_ago": seconds_ago }))
            .with_created_at(Utc::now() - Duration::seconds(seconds_ago))
    }

    async fn fail_once(repo: &RecordRepository, id: &RecordId, next: DateTime<Utc>) -> Option<u32> {
        repo.update_sync_status(id, SyncStatus::Syncing).await.unwrap();
        repo.mark_failed(id, "503", next).await.unwrap()
    }

    async fn mark_synced(repo: &RecordRepository, id: &RecordId) {
        assert!(repo.update_sync_status(id, SyncStatus::Syncing).await.unwrap());
        assert!(repo.update_sync_status(id, SyncStatus::Synced).await.unwrap());
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let repo = make_repo().await;
        let record = make_record(EntityType::Scan, 10);

        repo.put(&record).await.unwrap();
        let fetched = repo.get(&record.id).await.unwrap();

        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.entity_type, EntityType::Scan);
        assert_eq!(fetched.payload, record.payload);
        assert_eq!(fetched.sync_status, SyncStatus::Pending);
        assert_eq!(
            fetched.created_at.timestamp_micros(),
            record.created_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn put_existing_id_updates_row_without_duplicating() {
        let repo = make_repo().await;
        let mut record = make_record(EntityType::Alert, 5);
        repo.put(&record).await.unwrap();

        record.payload = json!({ "status": "acknowledged" });
        repo.put(&record).await.unwrap();

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(repo.get(&record.id).await.unwrap().payload["status"], "acknowledged");
    }

    #[tokio::test]
    async fn get_missing_id_is_not_found() {
        let repo = make_repo().await;
        let err = repo.get(&RecordId::from("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_pending_orders_oldest_first() {
        let repo = make_repo().await;
        let records = vec![
            make_record(EntityType::CaseEvent, 100),
            make_record(EntityType::CaseEvent, 300),
            make_record(EntityType::CaseEvent, 200),
        ];
        for r in &records {
            repo.put(r).await.unwrap();
        }

        let pending = repo.query_pending(EntityType::CaseEvent).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].payload["seconds_ago"], 300);
        assert_eq!(pending[1].payload["seconds_ago"], 200);
        assert_eq!(pending[2].payload["seconds_ago"], 100);
    }

    #[tokio::test]
    async fn query_pending_includes_failed_and_excludes_other_types() {
        let repo = make_repo().await;
        let scan = make_record(EntityType::Scan, 20);
        let alert = make_record(EntityType::Alert, 10);
        repo.put(&scan).await.unwrap();
        repo.put(&alert).await.unwrap();
        fail_once(&repo, &scan.id, Utc::now()).await;

        let pending = repo.query_pending(EntityType::Scan).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn query_unsynced_spans_types_and_honours_limit() {
        let repo = make_repo().await;
        repo.put(&make_record(EntityType::Scan, 30)).await.unwrap();
        repo.put(&make_record(EntityType::Alert, 20)).await.unwrap();
        repo.put(&make_record(EntityType::AuditEntry, 10)).await.unwrap();

        let rows = repo.query_unsynced(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_type, EntityType::Scan);
        assert_eq!(rows[1].entity_type, EntityType::Alert);
    }

    #[tokio::test]
    async fn synced_records_leave_the_unsynced_query() {
        let repo = make_repo().await;
        let record = make_record(EntityType::Scan, 1);
        repo.put(&record).await.unwrap();
        mark_synced(&repo, &record.id).await;

        assert!(repo.query_unsynced(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_sync_status_on_missing_id_is_not_found() {
        let repo = make_repo().await;
        let err = repo
            .update_sync_status(&RecordId::from("ghost"), SyncStatus::Synced)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn mark_failed_increments_and_schedules_retry() {
        let repo = make_repo().await;
        let record = make_record(EntityType::MetricReading, 1);
        repo.put(&record).await.unwrap();

        let next = Utc::now() + Duration::seconds(4);
        assert_eq!(fail_once(&repo, &record.id, next).await, Some(1));
        assert_eq!(fail_once(&repo, &record.id, next).await, Some(2));

        let stored = repo.get(&record.id).await.unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.last_error.as_deref(), Some("503"));
        assert_eq!(
            stored.next_attempt_at.map(|t| t.timestamp_micros()),
            Some(next.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn settle_is_refused_once_a_producer_requeues_the_row() {
        let repo = make_repo().await;
        let mut record = make_record(EntityType::Alert, 1);
        repo.put(&record).await.unwrap();
        assert!(repo.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap());

        record.payload = json!({ "status": "acknowledged" });
        repo.put(&record).await.unwrap();

        assert!(!repo.update_sync_status(&record.id, SyncStatus::Synced).await.unwrap());
        assert_eq!(
            repo.mark_failed(&record.id, "503", Utc::now()).await.unwrap(),
            None
        );
        let stored = repo.get(&record.id).await.unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.payload["status"], "acknowledged");
    }

    #[tokio::test]
    async fn mark_failed_on_missing_id_is_not_found() {
        let repo = make_repo().await;
        let err = repo
            .mark_failed(&RecordId::from("ghost"), "503", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_ready_skips_a_stalled_type_and_keeps_the_rest() {
        let repo = make_repo().await;
        let stalled = make_record(EntityType::CaseEvent, 40);
        let behind = make_record(EntityType::CaseEvent, 30);
        let due = make_record(EntityType::Scan, 20);
        let fresh = make_record(EntityType::Scan, 10);
        for r in [&stalled, &behind, &due, &fresh] {
            repo.put(r).await.unwrap();
        }
        fail_once(&repo, &stalled.id, Utc::now() + Duration::minutes(5)).await;
        fail_once(&repo, &due.id, Utc::now() - Duration::seconds(1)).await;

        let ready = repo.query_ready(Utc::now(), 10).await.unwrap();
        let ids: Vec<_> = ready.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![due.id.clone(), fresh.id.clone()]);

        let later = repo.query_ready(Utc::now() + Duration::minutes(10), 1).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, stalled.id);
    }

    #[tokio::test]
    async fn reset_in_flight_recovers_syncing_rows() {
        let repo = make_repo().await;
        let record = make_record(EntityType::Scan, 1);
        repo.put(&record).await.unwrap();
        repo.update_sync_status(&record.id, SyncStatus::Syncing).await.unwrap();

        assert_eq!(repo.reset_in_flight().await.unwrap(), 1);
        assert_eq!(repo.get(&record.id).await.unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn prune_removes_only_old_synced_rows() {
        let repo = make_repo().await;
        let old_synced = make_record(EntityType::Scan, 7200);
        let old_pending = make_record(EntityType::Scan, 7200);
        let fresh_synced = make_record(EntityType::Scan, 60);
        for r in [&old_synced, &old_pending, &fresh_synced] {
            repo.put(r).await.unwrap();
        }
        mark_synced(&repo, &old_synced.id).await;
        mark_synced(&repo, &fresh_synced.id).await;

        let deleted = repo.prune_synced_before(Utc::now() - Duration::hours(1)).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(repo.get(&old_pending.id).await.is_ok());
        assert!(repo.get(&fresh_synced.id).await.is_ok());
    }

    #[tokio::test]
    async fn records_survive_a_pool_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("edge.db").display());
        let record = make_record(EntityType::CaseEvent, 1);

        {
            let repo = RecordRepository::new(create_pool(&url).await.unwrap());
            repo.put(&record).await.unwrap();
            repo.pool().close().await;
        }

        let reopened = RecordRepository::new(create_pool(&url).await.unwrap());
        let fetched = reopened.get(&record.id).await.unwrap();
        assert_eq!(fetched.payload, record.payload);
    }
}
