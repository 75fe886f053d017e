//! Progress event types
//!
//! The envelope (type, run, timestamp, stage, percent) is fixed; strategy
//! specific numbers ride along in the open `metrics` map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Metrics;

/// Non-terminal events never report more than this, so exactly 100 is
/// only ever seen on `Completed`.
pub const PROCESSING_CEILING: f64 = 99.0;

/// Kind of progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressEventType {
    Started,
    ItemProgress,
    OverallProgress,
    Completed,
    Error,
    Cancelled,
    /// Keep-alive; carries no status change
    Heartbeat,
}

impl ProgressEventType {
    /// Completed, Error and Cancelled end a run's stream
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "Started",
            Self::ItemProgress => "ItemProgress",
            Self::OverallProgress => "OverallProgress",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
            Self::Heartbeat => "Heartbeat",
        };
        write!(f, "{}", name)
    }
}

/// Stage names carried in events
pub mod stage {
    pub const STARTING: &str = "starting";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const CANCELLED: &str = "cancelled";
    pub const FAILED: &str = "failed";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// One progress record as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: ProgressEventType,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    /// 0-100, non-decreasing within a run
    pub progress_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_items: Option<usize>,
    pub message: String,
    #[serde(default)]
    pub metrics: Metrics,
}

impl ProgressEvent {
    /// Create an event stamped now
    pub fn new(
        run_id: impl Into<String>,
        event_type: ProgressEventType,
        stage: impl Into<String>,
        progress_percent: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            run_id: run_id.into(),
            timestamp: Utc::now(),
            stage: stage.into(),
            progress_percent: progress_percent.clamp(0.0, 100.0),
            current_item: None,
            total_items: None,
            completed_items: None,
            message: message.into(),
            metrics: Metrics::new(),
        }
    }

    /// Synthetic keep-alive repeating the last known percent
    pub fn heartbeat(run_id: impl Into<String>, progress_percent: f64) -> Self {
        Self::new(
            run_id,
            ProgressEventType::Heartbeat,
            stage::HEARTBEAT,
            progress_percent,
            "heartbeat",
        )
    }

    /// Attach item counters
    pub fn with_counts(mut self, completed: usize, total: usize) -> Self {
        self.completed_items = Some(completed);
        self.total_items = Some(total);
        self
    }

    /// Attach the item this event is about
    pub fn with_item(mut self, item_key: impl Into<String>) -> Self {
        self.current_item = Some(item_key.into());
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == ProgressEventType::Heartbeat
    }
}

/// Percent for a processing-stage event: `completed / total * 100`, held
/// under [`PROCESSING_CEILING`].
pub fn processing_percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64 * 100.0).min(PROCESSING_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_types() {
        assert!(ProgressEventType::Completed.is_terminal());
        assert!(ProgressEventType::Error.is_terminal());
        assert!(ProgressEventType::Cancelled.is_terminal());
        assert!(!ProgressEventType::Heartbeat.is_terminal());
        assert!(!ProgressEventType::OverallProgress.is_terminal());
    }

    #[test]
    fn test_percent_is_clamped() {
        let event = ProgressEvent::new("r", ProgressEventType::Started, stage::STARTING, 140.0, "x");
        assert_eq!(event.progress_percent, 100.0);
        let event = ProgressEvent::new("r", ProgressEventType::Started, stage::STARTING, -3.0, "x");
        assert_eq!(event.progress_percent, 0.0);
    }

    #[test]
    fn test_processing_percent() {
        assert_eq!(processing_percent(0, 0), 0.0);
        assert_eq!(processing_percent(5, 10), 50.0);
        assert_eq!(processing_percent(10, 10), PROCESSING_CEILING);
    }

    #[test]
    fn test_wire_shape() {
        let event = ProgressEvent::new("run-1", ProgressEventType::ItemProgress, stage::PROCESSING, 40.0, "AAPL done")
            .with_item("AAPL")
            .with_counts(4, 10);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "ItemProgress");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["stage"], "processing");
        assert_eq!(json["current_item"], "AAPL");
        assert!(json["metrics"].is_object());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let json = r#"{
            "event_type": "Heartbeat",
            "run_id": "run-1",
            "timestamp": "2026-01-01T00:00:00Z",
            "stage": "heartbeat",
            "progress_percent": 12.5,
            "message": "heartbeat",
            "metrics": {},
            "server_node": "n1"
        }"#;
        let event: ProgressEvent = serde_json::from_str(json).unwrap();
        assert!(event.is_heartbeat());
        assert!(event.current_item.is_none());
    }
}
