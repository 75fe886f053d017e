//! Strategy plugins
//!
//! Each strategy code maps to an [`ItemEvaluator`]. Codes are registered at
//! startup; unknown codes are rejected at submission.

mod builtin;
mod evaluator;
mod registry;

pub use builtin::{ChecksumStrategy, PassAllStrategy};
pub use evaluator::{EvaluationError, ItemEvaluator};
pub use registry::StrategyRegistry;

#[cfg(test)]
pub(crate) mod testing;
