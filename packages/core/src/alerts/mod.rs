//! Threshold-based alerting for metric readings.

pub mod engine;
pub mod thresholds;
pub mod types;

pub use engine::AlertEngine;
pub use thresholds::{evaluate, evaluate_reading, Breach, MetricThresholds, ThresholdRule, ThresholdTable};
pub use types::{Alert, AlertPriority, AlertStatus, MetricReading, MetricValue};
