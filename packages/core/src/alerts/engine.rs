use std::sync::Arc;

use serde_json::json;

use crate::alerts::thresholds::{evaluate_reading, ThresholdTable};
use crate::alerts::types::{Alert, AlertStatus, MetricReading, MetricValue};
use crate::audit::{AuditAction, AuditLog};
use crate::error::{EngineError, StoreError};
use crate::events::{EventBus, EventKind};
use crate::records::{DomainRecord, EntityType, RecordId, SyncStatus};
use crate::store::RecordStore;

/// Turns metric readings into persisted, audited, announced alerts.
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
    events: EventBus,
    thresholds: Arc<ThresholdTable>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn RecordStore>, events: EventBus, thresholds: ThresholdTable) -> Self {
        Self {
            audit: AuditLog::new(store.clone()),
            store,
            events,
            thresholds: Arc::new(thresholds),
        }
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    /// Store the reading, evaluate it and, on a breach, store and announce
    /// the alert. The reading is durable before any alert is raised. The
    /// reading's id comes from [`MetricReading::record_id`], so retrying
    /// after a failed alert write does not store the reading twice.
    pub async fn ingest(&self, reading: MetricReading) -> Result<Option<Alert>, EngineError> {
        if reading.metric_type.trim().is_empty() {
            return Err(EngineError::invalid_input("metric_type must not be empty"));
        }
        if let MetricValue::Numeric(v) = reading.value {
            if !v.is_finite() {
                return Err(EngineError::invalid_input("metric value must be finite"));
            }
        }

        let payload = serde_json::to_value(&reading)
            .map_err(|err| EngineError::invalid_input(err.to_string()))?;
        self.store
            .put(
                &DomainRecord::new(EntityType::MetricReading, payload)
                    .with_id(reading.record_id().0)
                    .with_created_at(reading.timestamp),
            )
            .await?;

        let Some(alert) = evaluate_reading(&reading, &self.thresholds) else {
            return Ok(None);
        };

        let payload = serde_json::to_value(&alert)
            .map_err(|err| EngineError::invalid_input(err.to_string()))?;
        self.store
            .put(&DomainRecord::new(EntityType::Alert, payload).with_id(alert.id.to_string()))
            .await?;

        tracing::warn!(
            alert_id = %alert.id,
            subject_id = %alert.subject_id,
            priority = %alert.priority,
            "{}",
            alert.message
        );
        self.audit
            .write_or_warn(
                AuditAction::AlertRaised,
                alert.id.to_string(),
                json!({
                    "metric_type": alert.metric_type,
                    "priority": alert.priority,
                    "subject_id": alert.subject_id,
                }),
            )
            .await;
        self.events.emit(EventKind::AlertRaised { alert: alert.clone() });

        Ok(Some(alert))
    }

    /// Mark an alert Acknowledged and queue the change for sync.
    /// Acknowledging twice is a no-op.
    pub async fn acknowledge(&self, alert_id: &RecordId) -> Result<Alert, EngineError> {
        let mut record = self.store.get(alert_id).await?;
        if record.entity_type != EntityType::Alert {
            return Err(EngineError::RecordNotFound(alert_id.to_string()));
        }
        let mut alert: Alert = serde_json::from_value(record.payload.clone())
            .map_err(|err| EngineError::from(StoreError::corrupt(format!("alert payload: {err}"))))?;

        if alert.status == AlertStatus::Acknowledged {
            return Ok(alert);
        }
        alert.status = AlertStatus::Acknowledged;

        record.payload = serde_json::to_value(&alert)
            .map_err(|err| EngineError::invalid_input(err.to_string()))?;
        record.sync_status = SyncStatus::Pending;
        record.next_attempt_at = None;
        self.store.put(&record).await?;

        tracing::info!(alert_id = %alert_id, "alert acknowledged");
        self.audit
            .write_or_warn(AuditAction::AlertAcknowledged, alert_id.to_string(), json!({}))
            .await;
        self.events.emit(EventKind::AlertAcknowledged {
            alert_id: alert_id.clone(),
        });

        Ok(alert)
    }
}
