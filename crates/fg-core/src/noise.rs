//! Noise-model capability interface.
//!
//! The fitting engine is generic over a small closed set of noise models
//! (Negative Binomial, Normal). Each model maps the two linear predictors
//! (`eta_loc` for the mean submodel, `eta_scale` for the dispersion
//! submodel) to per-observation likelihood and derivative weights. All
//! engine-side math is expressed through this trait; concrete models live
//! in `fg-fit::model`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Numeric safety policy applied inside noise-model kernels.
///
/// Linear predictors are clamped before the link transform so that
/// `exp(eta)` never overflows, and per-observation log-likelihood values
/// are clipped to a finite range (non-finite values are replaced by the
/// lower bound). The clip bounds are part of the fit configuration rather
/// than hidden constants; the defaults are wide enough that a healthy fit
/// never touches them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericBounds {
    /// Clamp range for the location linear predictor.
    pub eta_loc: (f64, f64),
    /// Clamp range for the scale linear predictor.
    pub eta_scale: (f64, f64),
    /// Clip range for per-observation log-likelihood values.
    pub ll: (f64, f64),
}

impl Default for NumericBounds {
    fn default() -> Self {
        // +-700 keeps exp() inside f64 range; the ll window only exists to
        // stop -inf/nan from degenerate parameters escaping into the
        // convergence bookkeeping.
        Self { eta_loc: (-700.0, 700.0), eta_scale: (-700.0, 700.0), ll: (-1e12, 1e12) }
    }
}

impl NumericBounds {
    /// Validate ordering and finiteness of all bound pairs.
    pub fn validate(&self) -> Result<()> {
        for (name, (lo, hi)) in [
            ("eta_loc", self.eta_loc),
            ("eta_scale", self.eta_scale),
            ("ll", self.ll),
        ] {
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(Error::Validation(format!(
                    "numeric bounds for {} must be finite with min < max, got ({}, {})",
                    name, lo, hi
                )));
            }
        }
        Ok(())
    }

    /// Clamp a location linear predictor.
    #[inline]
    pub fn clamp_eta_loc(&self, eta: f64) -> f64 {
        eta.clamp(self.eta_loc.0, self.eta_loc.1)
    }

    /// Clamp a scale linear predictor.
    #[inline]
    pub fn clamp_eta_scale(&self, eta: f64) -> f64 {
        eta.clamp(self.eta_scale.0, self.eta_scale.1)
    }

    /// Clip a log-likelihood value; non-finite values collapse to the lower bound.
    #[inline]
    pub fn clip_ll(&self, ll: f64) -> f64 {
        if ll.is_finite() { ll.clamp(self.ll.0, self.ll.1) } else { self.ll.0 }
    }
}

/// Per-observation likelihood and derivative weights at the current
/// linear predictors.
///
/// All derivatives are taken with respect to the linear predictors, so the
/// aggregator only needs outer products with design-matrix rows:
/// - `jac_loc`, `jac_scale`: first derivatives of the log-likelihood
/// - `hess_aa`, `hess_ab`, `hess_bb`: second derivatives (location/location,
///   location/scale, scale/scale)
/// - `fim_loc`: the Fisher-information weight of the mean submodel. Kept in
///   the same (negative) sign convention as the Hessian weights; the
///   aggregator negates it when assembling the positive semi-definite FIM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightPoint {
    /// Clipped per-observation log-likelihood.
    pub ll: f64,
    /// d ll / d eta_loc
    pub jac_loc: f64,
    /// d ll / d eta_scale
    pub jac_scale: f64,
    /// d2 ll / d eta_loc2
    pub hess_aa: f64,
    /// d2 ll / (d eta_loc d eta_scale)
    pub hess_ab: f64,
    /// d2 ll / d eta_scale2
    pub hess_bb: f64,
    /// Expected d2 ll / d eta_loc2 (negative of the FIM weight).
    pub fim_loc: f64,
}

/// Capability interface of a GLM noise model.
///
/// One implementation is selected at configuration time; the engine never
/// needs dynamic dispatch beyond this trait.
pub trait NoiseModel: Send + Sync {
    /// Mean of one observation given the location linear predictor.
    fn location(&self, eta_loc: f64) -> f64;

    /// Dispersion of one observation given the scale linear predictor.
    fn scale(&self, eta_scale: f64) -> f64;

    /// Link transform of the location (inverse of [`Self::location`]).
    fn location_link(&self, location: f64) -> f64;

    /// Link transform of the scale (inverse of [`Self::scale`]).
    fn scale_link(&self, scale: f64) -> f64;

    /// Clipped log-likelihood of one observation.
    fn log_likelihood(&self, x: f64, eta_loc: f64, eta_scale: f64) -> f64;

    /// Full derivative weight set of one observation.
    fn weights(&self, x: f64, eta_loc: f64, eta_scale: f64) -> WeightPoint;

    /// Method-of-moments dispersion estimate from a feature's sample mean
    /// and variance, used to seed the fit.
    fn init_scale(&self, mean: f64, variance: f64) -> f64;

    /// Numeric safety policy in effect for this model.
    fn bounds(&self) -> &NumericBounds;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds_valid() {
        assert!(NumericBounds::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut b = NumericBounds::default();
        b.eta_loc = (1.0, -1.0);
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_clip_ll_handles_non_finite() {
        let b = NumericBounds::default();
        assert_eq!(b.clip_ll(f64::NAN), b.ll.0);
        assert_eq!(b.clip_ll(f64::NEG_INFINITY), b.ll.0);
        assert_eq!(b.clip_ll(-1.5), -1.5);
    }
}
