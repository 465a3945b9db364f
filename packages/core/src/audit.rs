//! Audit sink.
//!
//! Audit entries are ordinary `AuditEntry` domain records, so they share
//! the store's durability and reach the remote through the same sync
//! path as every other record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::{DomainRecord, EntityType, RecordId};
use crate::store::{RecordStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RecordSubmitted,
    TaskTransition,
    AlertRaised,
    AlertAcknowledged,
    SyncPass,
}

/// Payload of an `AuditEntry` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    /// Id of the task, alert, record or pass the entry describes.
    pub subject: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn RecordStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Persist one entry and return its record id.
    pub async fn write(
        &self,
        action: AuditAction,
        subject: impl Into<String>,
        detail: serde_json::Value,
    ) -> StoreResult<RecordId> {
        let entry = AuditEntry {
            action,
            subject: subject.into(),
            detail,
            at: Utc::now(),
        };
        let payload = serde_json::to_value(&entry)
            .map_err(|err| crate::error::StoreError::corrupt(err.to_string()))?;
        let record = DomainRecord::new(EntityType::AuditEntry, payload);
        self.store.put(&record).await?;
        Ok(record.id)
    }

    /// Like [`AuditLog::write`], but a storage failure is logged instead of
    /// failing the operation being audited.
    pub async fn write_or_warn(
        &self,
        action: AuditAction,
        subject: impl Into<String>,
        detail: serde_json::Value,
    ) -> Option<RecordId> {
        let subject = subject.into();
        match self.write(action, subject.clone(), detail).await {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(?action, subject = %subject, "audit write failed: {}", err);
                None
            }
        }
    }
}
