//! Probability building blocks for featureglm.
//!
//! This crate hosts reusable probability math used by the fitting engine:
//! - base densities (Negative Binomial log-PMF, Normal log-PDF)
//! - small numeric helpers (clamped exp, trigamma)

pub mod math;
pub mod neg_binomial;
pub mod normal;
