//! StrategyRegistry - lookup of evaluators by strategy code

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::ItemEvaluator;
use super::builtin::{ChecksumStrategy, PassAllStrategy};

/// Read-mostly table of registered strategies, populated at startup
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ItemEvaluator>>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies
    pub fn with_builtins() -> Self {
        debug!("StrategyRegistry::with_builtins: called");
        let mut registry = Self::new();
        registry.register(PassAllStrategy::CODE, Arc::new(PassAllStrategy));
        registry.register(ChecksumStrategy::CODE, Arc::new(ChecksumStrategy));
        registry
    }

    /// Register (or replace) a strategy under `code`
    pub fn register(&mut self, code: impl Into<String>, evaluator: Arc<dyn ItemEvaluator>) {
        let code = code.into();
        debug!(%code, "StrategyRegistry::register: called");
        self.strategies.insert(code, evaluator);
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn ItemEvaluator>> {
        self.strategies.get(code).cloned()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.strategies.contains_key(code)
    }

    /// Registered codes, sorted
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.strategies.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// `(code, description)` pairs, sorted by code
    pub fn describe(&self) -> Vec<(String, String)> {
        self.codes()
            .into_iter()
            .map(|code| {
                let description = self
                    .strategies
                    .get(&code)
                    .map(|e| e.description().to_string())
                    .unwrap_or_default();
                (code, description)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry").field("codes", &self.codes()).finish()
    }
}
