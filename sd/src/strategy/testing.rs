//! Scripted evaluator for unit tests

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{EvaluationError, ItemEvaluator};
use crate::domain::{Evaluation, Parameters};

/// Passes every item unless told to fail or hang on it
#[derive(Default)]
pub struct ScriptedEvaluator {
    pub fail: HashSet<String>,
    pub hang: HashSet<String>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, item: &str) -> Self {
        self.fail.insert(item.to_string());
        self
    }

    pub fn hanging(mut self, item: &str) -> Self {
        self.hang.insert(item.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemEvaluator for ScriptedEvaluator {
    async fn evaluate(&self, item_key: &str, parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.contains(item_key) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.contains(item_key) {
            return Err(EvaluationError::Failed(format!("no data for {}", item_key)));
        }
        Ok(Evaluation {
            passed: true,
            score: Some(50.0),
            ..Evaluation::default()
        })
    }

    fn validate(&self, parameters: &Parameters) -> Result<(), String> {
        if parameters.contains_key("reject") {
            return Err("reject requested".to_string());
        }
        Ok(())
    }
}

/// Blocks every item until the test releases a permit
pub struct GateEvaluator {
    gate: tokio::sync::Semaphore,
}

impl GateEvaluator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    /// Let `n` more items finish
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ItemEvaluator for GateEvaluator {
    async fn evaluate(&self, _item_key: &str, _parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EvaluationError::Failed(e.to_string()))?;
        permit.forget();
        Ok(Evaluation {
            passed: true,
            ..Evaluation::default()
        })
    }
}
