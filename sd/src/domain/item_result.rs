//! Per-item evaluation results

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratstore::{Filter, FilterOp, IndexValue, Record, now_ms};

use super::Metrics;

/// What an evaluator returns for one item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evaluation {
    pub passed: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
}

/// Stored outcome of evaluating one item within a run
///
/// Keyed by `(run_id, item_key)`; writing the same key again overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    /// Composite store key `{run_id}/{item_key}`
    pub id: String,
    pub run_id: String,
    pub item_key: String,
    pub passed: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub metrics: Metrics,
    /// Completion order within the run, starting at 1
    pub sequence_number: u64,
    pub processed_at: DateTime<Utc>,
    pub processing_time_ms: u64,
    /// Item-level evaluation failure
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: i64,
}

impl ItemResult {
    fn key(run_id: &str, item_key: &str) -> String {
        format!("{}/{}", run_id, item_key)
    }

    /// Result for a successful evaluation
    pub fn from_evaluation(
        run_id: &str,
        item_key: &str,
        evaluation: Evaluation,
        sequence_number: u64,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: Self::key(run_id, item_key),
            run_id: run_id.to_string(),
            item_key: item_key.to_string(),
            passed: evaluation.passed,
            score: evaluation.score,
            classification: evaluation.classification,
            reasons: evaluation.reasons,
            metrics: evaluation.metrics,
            sequence_number,
            processed_at: Utc::now(),
            processing_time_ms,
            error: None,
            updated_at: now_ms(),
        }
    }

    /// Result for an evaluation that failed; never passes
    pub fn from_error(
        run_id: &str,
        item_key: &str,
        error: impl Into<String>,
        sequence_number: u64,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            id: Self::key(run_id, item_key),
            run_id: run_id.to_string(),
            item_key: item_key.to_string(),
            passed: false,
            score: None,
            classification: None,
            reasons: Vec::new(),
            metrics: Metrics::new(),
            sequence_number,
            processed_at: Utc::now(),
            processing_time_ms,
            error: Some(error.into()),
            updated_at: now_ms(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Record for ItemResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "item_results"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run_id".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("item_key".to_string(), IndexValue::String(self.item_key.clone()));
        fields.insert("passed".to_string(), IndexValue::Bool(self.passed));
        fields.insert("has_error".to_string(), IndexValue::Bool(self.error.is_some()));
        fields.insert(
            "sequence_number".to_string(),
            IndexValue::Int(self.sequence_number as i64),
        );
        if let Some(score) = self.score {
            fields.insert("score".to_string(), IndexValue::Float(score));
        }
        if let Some(ref classification) = self.classification {
            fields.insert("classification".to_string(), IndexValue::String(classification.clone()));
        }
        fields
    }
}

/// Query options for a run's results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFilter {
    /// Only passing (true) or failing (false) items
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub classification: Option<String>,
    /// Inclusive lower bound; items without a score are excluded
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Only items whose evaluation failed
    #[serde(default)]
    pub errors_only: bool,
    /// Maximum number of results, in sequence order
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ResultFilter {
    /// Store filters for this query scoped to one run
    pub fn to_store_filters(&self, run_id: &str) -> Vec<Filter> {
        let mut filters = vec![Filter::eq("run_id", run_id)];
        if let Some(passed) = self.passed {
            filters.push(Filter::eq("passed", passed));
        }
        if let Some(ref classification) = self.classification {
            filters.push(Filter::eq("classification", classification.as_str()));
        }
        if let Some(min_score) = self.min_score {
            filters.push(Filter::new("score", FilterOp::Gte, min_score));
        }
        if self.errors_only {
            filters.push(Filter::eq("has_error", true));
        }
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_evaluation() {
        let evaluation = Evaluation {
            passed: true,
            score: Some(72.5),
            classification: Some("strong".to_string()),
            reasons: vec!["above threshold".to_string()],
            metrics: Metrics::new(),
        };
        let result = ItemResult::from_evaluation("run-1", "AAPL", evaluation, 4, 12);
        assert_eq!(result.id, "run-1/AAPL");
        assert!(result.passed);
        assert_eq!(result.sequence_number, 4);
        assert!(!result.is_error());
    }

    #[test]
    fn test_from_error_never_passes() {
        let result = ItemResult::from_error("run-1", "MSFT", "timeout", 1, 30_000);
        assert!(!result.passed);
        assert!(result.is_error());
        assert_eq!(result.error.as_deref(), Some("timeout"));
        assert_eq!(
            result.indexed_fields().get("has_error"),
            Some(&IndexValue::Bool(true))
        );
    }

    #[test]
    fn test_filter_translation() {
        let filter = ResultFilter {
            passed: Some(true),
            classification: Some("strong".to_string()),
            min_score: Some(50.0),
            errors_only: false,
            limit: Some(10),
        };
        let filters = filter.to_store_filters("run-1");
        assert_eq!(filters.len(), 4);
        assert_eq!(filters[0], Filter::eq("run_id", "run-1"));
        assert_eq!(filters[3].op, FilterOp::Gte);

        assert_eq!(ResultFilter::default().to_store_filters("r").len(), 1);
    }
}
