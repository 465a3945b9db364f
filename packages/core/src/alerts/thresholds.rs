//! Threshold tables and the pure evaluation function.
//!
//! Evaluation is stateless: every reading is judged on its own and a
//! breaching reading always yields an alert. Suppressing repeats is left
//! to whoever presents the alerts.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::alerts::types::{Alert, AlertPriority, AlertStatus, MetricReading, MetricValue};
use crate::error::EngineError;
use crate::records::RecordId;

/// A single breach predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Breach {
    Below { bound: f64 },
    AtOrBelow { bound: f64 },
    Above { bound: f64 },
    AtOrAbove { bound: f64 },
    /// Categorical value outside the expected-normal set.
    NotIn { normal: Vec<String> },
}

impl Breach {
    pub fn matches(&self, value: &MetricValue) -> bool {
        match (self, value) {
            (Breach::Below { bound }, MetricValue::Numeric(v)) => v < bound,
            (Breach::AtOrBelow { bound }, MetricValue::Numeric(v)) => v <= bound,
            (Breach::Above { bound }, MetricValue::Numeric(v)) => v > bound,
            (Breach::AtOrAbove { bound }, MetricValue::Numeric(v)) => v >= bound,
            (Breach::NotIn { normal }, MetricValue::Categorical(c)) => {
                !normal.iter().any(|n| n.eq_ignore_ascii_case(c))
            }
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Breach::Below { bound } => format!("below {bound}"),
            Breach::AtOrBelow { bound } => format!("at or below {bound}"),
            Breach::Above { bound } => format!("above {bound}"),
            Breach::AtOrAbove { bound } => format!("at or above {bound}"),
            Breach::NotIn { normal } => format!("outside expected {}", normal.join("/")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub priority: AlertPriority,
    #[serde(flatten)]
    pub breach: Breach,
}

impl ThresholdRule {
    pub fn new(priority: AlertPriority, breach: Breach) -> Self {
        Self { priority, breach }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    /// Human-readable name used in alert messages.
    pub label: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub rules: Vec<ThresholdRule>,
}

/// Per-metric severity tables keyed by metric type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdTable(BTreeMap<String, MetricThresholds>);

fn metric(label: &str, unit: Option<&str>, rules: Vec<ThresholdRule>) -> MetricThresholds {
    MetricThresholds {
        label: label.to_string(),
        unit: unit.map(str::to_string),
        rules,
    }
}

impl Default for ThresholdTable {
    /// Bedside monitoring defaults. Temperature is in °F.
    fn default() -> Self {
        use AlertPriority::{High, Medium};
        use Breach::*;
        let rule = ThresholdRule::new;

        Self::empty()
            .with_metric(
                "oxygenSaturation",
                metric(
                    "Oxygen saturation",
                    Some("%"),
                    vec![rule(High, Below { bound: 90.0 }), rule(Medium, Below { bound: 94.0 })],
                ),
            )
            .with_metric(
                "heartRate",
                metric(
                    "Heart rate",
                    Some("bpm"),
                    vec![
                        rule(High, Below { bound: 40.0 }),
                        rule(High, Above { bound: 140.0 }),
                        rule(Medium, Below { bound: 50.0 }),
                        rule(Medium, Above { bound: 120.0 }),
                    ],
                ),
            )
            .with_metric(
                "systolicBloodPressure",
                metric(
                    "Systolic blood pressure",
                    Some("mmHg"),
                    vec![
                        rule(High, Above { bound: 180.0 }),
                        rule(High, Below { bound: 90.0 }),
                        rule(Medium, Above { bound: 160.0 }),
                    ],
                ),
            )
            .with_metric(
                "diastolicBloodPressure",
                metric(
                    "Diastolic blood pressure",
                    Some("mmHg"),
                    vec![rule(High, Above { bound: 110.0 }), rule(Medium, Above { bound: 100.0 })],
                ),
            )
            .with_metric(
                "temperature",
                metric(
                    "Temperature",
                    Some("°F"),
                    vec![
                        rule(High, Above { bound: 103.0 }),
                        rule(Medium, Above { bound: 101.5 }),
                        rule(Medium, Below { bound: 96.0 }),
                    ],
                ),
            )
            .with_metric(
                "respiratoryRate",
                metric(
                    "Respiratory rate",
                    Some("/min"),
                    vec![
                        rule(High, Above { bound: 30.0 }),
                        rule(High, Below { bound: 8.0 }),
                        rule(Medium, Above { bound: 24.0 }),
                    ],
                ),
            )
            .with_metric(
                "cardiacRhythm",
                metric(
                    "Cardiac rhythm",
                    None,
                    vec![rule(
                        High,
                        NotIn {
                            normal: vec!["normal_sinus".to_string()],
                        },
                    )],
                ),
            )
    }
}

impl ThresholdTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_metric(mut self, metric_type: impl Into<String>, thresholds: MetricThresholds) -> Self {
        self.0.insert(metric_type.into(), thresholds);
        self
    }

    pub fn get(&self, metric_type: &str) -> Option<&MetricThresholds> {
        self.0.get(metric_type)
    }

    pub fn metric_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw)
            .map_err(|err| EngineError::config(format!("invalid threshold table: {err}")))
    }

    /// Load a table from disk. Metrics it does not mention keep the
    /// defaults.
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            EngineError::config(format!("cannot read thresholds {}: {err}", path.display()))
        })?;
        let overrides = Self::from_json(&raw)?;
        Ok(overrides
            .0
            .into_iter()
            .fold(Self::default(), |table, (metric_type, thresholds)| {
                table.with_metric(metric_type, thresholds)
            }))
    }
}

/// Classify one value. Returns the highest-priority breach as an alert,
/// or `None` when the value is within limits or the metric is unknown.
///
/// The returned alert has no subject; [`evaluate_reading`] fills it in.
pub fn evaluate(metric_type: &str, value: &MetricValue, thresholds: &ThresholdTable) -> Option<Alert> {
    let table = thresholds.get(metric_type)?;

    // Highest priority wins; ties go to the rule listed first.
    let hit = table
        .rules
        .iter()
        .filter(|rule| rule.breach.matches(value))
        .fold(None::<&ThresholdRule>, |best, rule| match best {
            Some(b) if b.priority >= rule.priority => Some(b),
            _ => Some(rule),
        })?;

    let unit = table.unit.as_deref().unwrap_or("");
    let message = format!("{} {}{} {}", table.label, value, unit, hit.breach.describe());

    Some(Alert {
        id: RecordId::new(),
        subject_id: String::new(),
        metric_type: metric_type.to_string(),
        value: value.clone(),
        message,
        priority: hit.priority,
        status: AlertStatus::Unacknowledged,
        timestamp: Utc::now(),
    })
}

pub fn evaluate_reading(reading: &MetricReading, thresholds: &ThresholdTable) -> Option<Alert> {
    evaluate(&reading.metric_type, &reading.value, thresholds).map(|alert| Alert {
        subject_id: reading.subject_id.clone(),
        timestamp: reading.timestamp,
        ..alert
    })
}
