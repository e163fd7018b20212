//! # fg-fit
//!
//! Fits one Generalized Linear Model per feature (column) of a
//! feature-by-observation matrix, all features simultaneously. Supported
//! noise models are Negative Binomial (log/log links) and Normal
//! (identity/log links); updates are Newton-Raphson or IRLS steps guarded
//! by a per-feature trust region.
//!
//! Data flow per iteration:
//! model weights → derivative aggregation → linear solve → trust-region
//! accept/reject → parameter state update.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Streaming reduction of per-batch derivative contributions.
pub mod aggregate;
/// Observation matrix, design matrices, batching.
pub mod data;
/// Outer iteration loop, convergence tracking, fit results.
pub mod estimator;
/// Concrete noise models (Negative Binomial, Normal).
pub mod model;
/// Per-feature Newton/IRLS linear solves.
pub mod newton;
/// Adaptive trust-region step control.
pub mod trust_region;

pub use aggregate::{Aggregator, FeatureDerivatives, ModelBlocks};
pub use data::{BatchRanges, InputData, ObsMatrix};
pub use estimator::{
    ConvergenceCriteria, Estimator, FitConfig, FitResult, Optimizer, TerminationType,
};
pub use model::{NegativeBinomialModel, NormalModel};
pub use trust_region::{TrustRegion, TrustRegionConfig};
