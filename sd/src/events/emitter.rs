//! Per-run event emitter

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::broadcaster::ProgressBroadcaster;
use super::types::{ProgressEvent, ProgressEventType, processing_percent, stage};
use crate::domain::Metrics;

/// Handle for emitting one run's progress events without owning the broadcaster
#[derive(Clone)]
pub struct ProgressEmitter {
    run_id: String,
    broadcaster: Arc<ProgressBroadcaster>,
}

fn counts(processed: usize, qualifying: usize, errors: usize) -> Metrics {
    let mut metrics = Metrics::new();
    metrics.insert("processed".to_string(), json!(processed));
    metrics.insert("qualifying".to_string(), json!(qualifying));
    metrics.insert("errors".to_string(), json!(errors));
    metrics
}

impl ProgressEmitter {
    pub fn new(run_id: impl Into<String>, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            run_id: run_id.into(),
            broadcaster,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit a raw event
    pub fn emit(&self, event: ProgressEvent) {
        debug!(run_id = %self.run_id, event_type = %event.event_type, "ProgressEmitter::emit");
        self.broadcaster.publish(event);
    }

    /// Run moved to Running
    pub fn started(&self, total: usize) {
        self.emit(
            ProgressEvent::new(
                &self.run_id,
                ProgressEventType::Started,
                stage::STARTING,
                0.0,
                format!("Evaluating {} items", total),
            )
            .with_counts(0, total),
        );
    }

    /// One item finished
    pub fn item_progress(&self, item_key: &str, completed: usize, total: usize, metrics: Metrics) {
        self.emit(
            ProgressEvent::new(
                &self.run_id,
                ProgressEventType::ItemProgress,
                stage::PROCESSING,
                processing_percent(completed, total),
                format!("Processed {}", item_key),
            )
            .with_item(item_key)
            .with_counts(completed, total)
            .with_metrics(metrics),
        );
    }

    /// Periodic summary
    pub fn overall_progress(&self, completed: usize, total: usize, qualifying: usize, errors: usize) {
        self.emit(
            ProgressEvent::new(
                &self.run_id,
                ProgressEventType::OverallProgress,
                stage::PROCESSING,
                processing_percent(completed, total),
                format!("{}/{} items processed, {} qualifying", completed, total, qualifying),
            )
            .with_counts(completed, total)
            .with_metrics(counts(completed, qualifying, errors)),
        );
    }

    /// Every item processed; the only event that reports 100
    pub fn completed(&self, total: usize, qualifying: usize, errors: usize, duration_ms: u64) {
        let mut metrics = counts(total, qualifying, errors);
        metrics.insert("duration_ms".to_string(), json!(duration_ms));
        self.emit(
            ProgressEvent::new(
                &self.run_id,
                ProgressEventType::Completed,
                stage::COMPLETED,
                100.0,
                format!("Completed: {} of {} items qualified", qualifying, total),
            )
            .with_counts(total, total)
            .with_metrics(metrics),
        );
    }

    /// Run stopped by cancel; percent stays where it was
    pub fn cancelled(&self, processed: usize, total: usize, qualifying: usize) {
        self.emit(
            ProgressEvent::new(
                &self.run_id,
                ProgressEventType::Cancelled,
                stage::CANCELLED,
                0.0,
                format!("Cancelled after {} of {} items", processed, total),
            )
            .with_counts(processed, total)
            .with_metrics(counts(processed, qualifying, 0)),
        );
    }

    /// Run-fatal error
    pub fn error(&self, message: &str, processed: usize, total: usize) {
        self.emit(
            ProgressEvent::new(&self.run_id, ProgressEventType::Error, stage::FAILED, 0.0, message)
                .with_counts(processed, total),
        );
    }
}

impl std::fmt::Debug for ProgressEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEmitter").field("run_id", &self.run_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitter_sequence() {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let emitter = broadcaster.emitter_for("r1");
        emitter.started(4);
        emitter.item_progress("A", 1, 4, Metrics::new());
        emitter.overall_progress(4, 4, 2, 0);
        emitter.completed(4, 2, 0, 15);

        let history = broadcaster.history("r1");
        let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                ProgressEventType::Started,
                ProgressEventType::ItemProgress,
                ProgressEventType::OverallProgress,
                ProgressEventType::Completed,
            ]
        );
        assert_eq!(history[1].progress_percent, 25.0);
        assert_eq!(history[2].progress_percent, 99.0);
        assert_eq!(history[3].progress_percent, 100.0);
        assert_eq!(history[3].metrics["qualifying"], 2);
    }

    #[test]
    fn test_cancel_keeps_last_percent() {
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let emitter = broadcaster.emitter_for("r1");
        emitter.item_progress("A", 1, 2, Metrics::new());
        emitter.cancelled(1, 2, 0);
        let history = broadcaster.history("r1");
        assert_eq!(history[1].progress_percent, 50.0);
        assert!(history[1].is_terminal());
    }
}
