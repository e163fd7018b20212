//! Common data types for featureglm

use serde::{Deserialize, Serialize};

/// How a fit run terminated.
///
/// `MaxIterationsReached` is a partial success, not an error: the returned
/// parameters are the best estimates found so far and the per-feature
/// `converged` flags say which columns are trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// The configured convergence criterion triggered.
    Converged,
    /// The iteration cap was hit before convergence.
    MaxIterationsReached,
}

impl FitStatus {
    /// Whether the run ended by satisfying the convergence criterion.
    pub fn is_converged(&self) -> bool {
        matches!(self, FitStatus::Converged)
    }
}
