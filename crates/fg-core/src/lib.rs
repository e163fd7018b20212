//! # fg-core
//!
//! Core types shared across the featureglm workspace:
//! - error and result types
//! - fit status reporting
//! - the noise-model capability interface used by the fitting engine

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error and result types.
pub mod error;
/// Noise-model capability interface and numeric safety policy.
pub mod noise;
/// Shared fit status types.
pub mod types;

pub use error::{Error, Result};
pub use noise::{NoiseModel, NumericBounds, WeightPoint};
pub use types::FitStatus;
