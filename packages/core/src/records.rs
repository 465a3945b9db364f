//! Domain records: the envelope for every locally durable fact.
//!
//! Producers create records with [`DomainRecord::new`]; afterwards only
//! the sync engine moves `sync_status`, and only the retention policy
//! deletes them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally generated, stable record identifier. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of fact carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Scan,
    CaseEvent,
    MetricReading,
    Alert,
    AuditEntry,
    TaskResult,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Scan,
        EntityType::CaseEvent,
        EntityType::MetricReading,
        EntityType::Alert,
        EntityType::AuditEntry,
        EntityType::TaskResult,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Scan => "scan",
            EntityType::CaseEvent => "case_event",
            EntityType::MetricReading => "metric_reading",
            EntityType::Alert => "alert",
            EntityType::AuditEntry => "audit_entry",
            EntityType::TaskResult => "task_result",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown entity type: {s}"))
    }
}

/// Synchronization state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    /// Whether the sync engine should still try to deliver this record.
    pub fn is_unsynced(self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }

    /// States a record may move to `self` from. Only a record being
    /// submitted can settle, so a producer re-queue during submission is
    /// never overwritten.
    pub fn predecessors(self) -> &'static [SyncStatus] {
        match self {
            SyncStatus::Syncing => &[SyncStatus::Pending, SyncStatus::Failed],
            SyncStatus::Synced | SyncStatus::Failed | SyncStatus::Pending => &[SyncStatus::Syncing],
        }
    }

    pub fn can_transition_to(self, next: SyncStatus) -> bool {
        next.predecessors().contains(&self)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// A persisted fact awaiting or having completed remote synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: RecordId,
    pub entity_type: EntityType,
    /// Opaque structured data. The engine never interprets it.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time a Failed record may be retried.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl DomainRecord {
    /// New Pending record with a fresh id.
    pub fn new(entity_type: EntityType, payload: serde_json::Value) -> Self {
        Self {
            id: RecordId::new(),
            entity_type,
            payload,
            created_at: Utc::now(),
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = RecordId(id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// A Failed record whose backoff window has not yet elapsed.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.sync_status == SyncStatus::Failed
            && self.next_attempt_at.is_some_and(|at| at > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn sync_status_transitions_follow_the_delivery_cycle() {
        use SyncStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Failed.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Failed));
        assert!(Syncing.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Synced));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Synced.can_transition_to(Syncing));
        assert!(!Synced.can_transition_to(Pending));
    }

    #[test]
    fn new_record_is_pending_with_zero_retries() {
        let record = DomainRecord::new(EntityType::Scan, json!({"barcode": "INS-0042"}));
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert!(record.next_attempt_at.is_none());
    }

    #[test]
    fn fresh_ids_are_distinct() {
        let a = DomainRecord::new(EntityType::Scan, json!({}));
        let b = DomainRecord::new(EntityType::Scan, json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn entity_type_parses_its_own_labels() {
        for entity in EntityType::ALL {
            assert_eq!(entity.as_str().parse::<EntityType>().unwrap(), entity);
        }
        assert!("vitals".parse::<EntityType>().is_err());
    }

    #[test]
    fn failed_record_is_deferred_until_next_attempt() {
        let now = Utc::now();
        let mut record = DomainRecord::new(EntityType::CaseEvent, json!({}));
        record.sync_status = SyncStatus::Failed;
        record.next_attempt_at = Some(now + Duration::seconds(30));

        assert!(record.is_deferred(now));
        assert!(!record.is_deferred(now + Duration::seconds(31)));
    }

    #[test]
    fn pending_record_is_never_deferred() {
        let mut record = DomainRecord::new(EntityType::Alert, json!({}));
        record.next_attempt_at = Some(Utc::now() + Duration::hours(1));
        assert!(!record.is_deferred(Utc::now()));
    }
}
