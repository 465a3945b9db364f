use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::records::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertPriority::Low => "low",
            AlertPriority::Medium => "medium",
            AlertPriority::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Unacknowledged,
    Acknowledged,
}

/// A reading's value: a number (SpO2 88) or a category ("afib").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Numeric(f64),
    Categorical(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Numeric(v) => Some(*v),
            MetricValue::Categorical(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            MetricValue::Numeric(_) => None,
            MetricValue::Categorical(c) => Some(c),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Numeric(v) => write!(f, "{v}"),
            MetricValue::Categorical(c) => f.write_str(c),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Numeric(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Categorical(value.to_string())
    }
}

/// One captured measurement. Accepts the capture devices' camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    #[serde(default, alias = "subjectId")]
    pub subject_id: String,
    #[serde(alias = "metricType")]
    pub metric_type: String,
    pub value: MetricValue,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MetricReading {
    pub fn new(
        subject_id: impl Into<String>,
        metric_type: impl Into<String>,
        value: impl Into<MetricValue>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            metric_type: metric_type.into(),
            value: value.into(),
            timestamp: Utc::now(),
        }
    }

    /// Record id derived from subject, metric and timestamp, so a producer
    /// retrying the same reading overwrites it instead of adding another.
    pub fn record_id(&self) -> RecordId {
        RecordId(format!(
            "reading:{}:{}:{}",
            self.subject_id,
            self.metric_type,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: RecordId,
    pub subject_id: String,
    pub metric_type: String,
    pub value: MetricValue,
    pub message: String,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub timestamp: DateTime<Utc>,
}
