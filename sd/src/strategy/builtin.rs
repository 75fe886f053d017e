//! Built-in strategies
//!
//! Small deterministic evaluators so the daemon is usable without external
//! plugins.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{EvaluationError, ItemEvaluator};
use crate::domain::{Evaluation, Metrics, Parameters};

/// Every item passes with score 1.0
#[derive(Debug, Clone, Copy, Default)]
pub struct PassAllStrategy;

impl PassAllStrategy {
    pub const CODE: &'static str = "pass_all";
}

#[async_trait]
impl ItemEvaluator for PassAllStrategy {
    async fn evaluate(&self, _item_key: &str, _parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        Ok(Evaluation {
            passed: true,
            score: Some(1.0),
            classification: Some("pass".to_string()),
            reasons: vec!["accepted unconditionally".to_string()],
            metrics: Metrics::new(),
        })
    }

    fn description(&self) -> &str {
        "Every item passes"
    }
}

/// Deterministic pseudo-score 0-99 derived from the item key
///
/// Parameters: `min_score` (default 50) is the inclusive pass threshold,
/// `delay_ms` (default 0) simulates slow data access per item.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumStrategy;

impl ChecksumStrategy {
    pub const CODE: &'static str = "checksum";
    pub const DEFAULT_MIN_SCORE: f64 = 50.0;

    /// FNV-1a over the key bytes, reduced to 0-99
    pub fn score(item_key: &str) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in item_key.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        hash % 100
    }

    fn min_score(parameters: &Parameters) -> Result<f64, String> {
        match parameters.get("min_score") {
            None | Some(Value::Null) => Ok(Self::DEFAULT_MIN_SCORE),
            Some(value) => match value.as_f64() {
                Some(v) if (0.0..=100.0).contains(&v) => Ok(v),
                _ => Err(format!("min_score must be a number between 0 and 100, got {}", value)),
            },
        }
    }

    fn delay(parameters: &Parameters) -> Result<Duration, String> {
        match parameters.get("delay_ms") {
            None | Some(Value::Null) => Ok(Duration::ZERO),
            Some(value) => value
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| format!("delay_ms must be a non-negative integer, got {}", value)),
        }
    }
}

#[async_trait]
impl ItemEvaluator for ChecksumStrategy {
    async fn evaluate(&self, item_key: &str, parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        let min_score = Self::min_score(parameters).map_err(EvaluationError::InvalidInput)?;
        let delay = Self::delay(parameters).map_err(EvaluationError::InvalidInput)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let score = Self::score(item_key) as f64;
        let passed = score >= min_score;
        let classification = match score as u64 {
            75.. => "strong",
            50..=74 => "moderate",
            _ => "weak",
        };

        let mut metrics = Metrics::new();
        metrics.insert("key_length".to_string(), json!(item_key.len()));
        metrics.insert("min_score".to_string(), json!(min_score));

        let reason = if passed {
            format!("score {} >= {}", score, min_score)
        } else {
            format!("score {} < {}", score, min_score)
        };

        Ok(Evaluation {
            passed,
            score: Some(score),
            classification: Some(classification.to_string()),
            reasons: vec![reason],
            metrics,
        })
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        Self::min_score(parameters)?;
        Self::delay(parameters)?;
        Ok(())
    }

    fn description(&self) -> &str {
        "Deterministic score from the item key; passes at or above min_score"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => Parameters::new(),
        }
    }

    #[tokio::test]
    async fn test_pass_all() {
        let eval = PassAllStrategy.evaluate("AAPL", &Parameters::new()).await.unwrap();
        assert!(eval.passed);
        assert_eq!(eval.score, Some(1.0));
    }

    #[test]
    fn test_checksum_score_is_stable() {
        assert_eq!(ChecksumStrategy::score("AAPL"), ChecksumStrategy::score("AAPL"));
        for key in ["A", "MSFT", "GOOG", "BRK.B", ""] {
            assert!(ChecksumStrategy::score(key) < 100);
        }
    }

    #[tokio::test]
    async fn test_checksum_threshold() {
        let key = "AAPL";
        let score = ChecksumStrategy::score(key) as f64;

        let at = ChecksumStrategy.evaluate(key, &params(json!({ "min_score": score }))).await.unwrap();
        assert!(at.passed);

        let above = ChecksumStrategy
            .evaluate(key, &params(json!({ "min_score": score + 0.5 })))
            .await
            .unwrap();
        assert!(!above.passed);
        assert_eq!(above.score, Some(score));
    }

    #[test]
    fn test_checksum_validate() {
        assert!(ChecksumStrategy.validate(&Parameters::new()).is_ok());
        assert!(ChecksumStrategy.validate(&params(json!({ "min_score": 20, "delay_ms": 5 }))).is_ok());
        assert!(ChecksumStrategy.validate(&params(json!({ "min_score": "high" }))).is_err());
        assert!(ChecksumStrategy.validate(&params(json!({ "min_score": 101 }))).is_err());
        assert!(ChecksumStrategy.validate(&params(json!({ "delay_ms": -1 }))).is_err());
    }
}
