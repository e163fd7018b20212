//! Adaptive trust-region control of Newton-type steps.
//!
//! Each feature carries its own radius. A proposed update is rescaled so
//! its magnitude never exceeds the radius; after the trial evaluation the
//! agreement between predicted and actual cost gain decides whether the
//! radius shrinks, grows or holds. The cost function is the
//! observation-normalized negative log-likelihood, so a positive gain is
//! an improvement.

use fg_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Trust-region hyperparameters.
///
/// Invariants (checked once at construction, never per iteration):
/// `eta0 < eta1 < eta2`, `0 < t1 < 1 < t2`, `upper_bound >= 1`,
/// `0 < radius_init <= upper_bound`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustRegionConfig {
    /// Minimum actual gain for a trial step to be accepted.
    pub eta0: f64,
    /// Gain ratio below which the radius shrinks.
    pub eta1: f64,
    /// Gain ratio above which the radius grows.
    pub eta2: f64,
    /// Shrink factor (< 1).
    pub t1: f64,
    /// Growth factor (> 1).
    pub t2: f64,
    /// Initial radius of every feature.
    pub radius_init: f64,
    /// Radius ceiling.
    pub upper_bound: f64,
}

impl Default for TrustRegionConfig {
    fn default() -> Self {
        Self {
            eta0: 0.0,
            eta1: 0.25,
            eta2: 0.75,
            t1: 0.5,
            t2: 1.5,
            radius_init: 100.0,
            upper_bound: 1e5,
        }
    }
}

impl TrustRegionConfig {
    /// Check all hyperparameter orderings; a violation is a fatal
    /// configuration error.
    pub fn validate(&self) -> Result<()> {
        if !(self.eta0 < self.eta1 && self.eta1 < self.eta2) {
            return Err(Error::Validation(format!(
                "trust region thresholds must satisfy eta0 < eta1 < eta2, got {} / {} / {}",
                self.eta0, self.eta1, self.eta2
            )));
        }
        if !(self.t1 > 0.0 && self.t1 < 1.0) {
            return Err(Error::Validation(format!("t1 must be in (0, 1), got {}", self.t1)));
        }
        if !(self.t2 > 1.0) {
            return Err(Error::Validation(format!("t2 must be > 1, got {}", self.t2)));
        }
        if !(self.upper_bound >= 1.0) {
            return Err(Error::Validation(format!(
                "upper_bound must be >= 1, got {}",
                self.upper_bound
            )));
        }
        if !(self.radius_init > 0.0 && self.radius_init <= self.upper_bound) {
            return Err(Error::Validation(format!(
                "radius_init must be in (0, upper_bound], got {}",
                self.radius_init
            )));
        }
        Ok(())
    }
}

/// Per-feature trust-region state.
#[derive(Debug, Clone)]
pub struct TrustRegion {
    config: TrustRegionConfig,
    radius: DVector<f64>,
}

impl TrustRegion {
    /// Validate the configuration and initialize every radius to
    /// `radius_init`.
    pub fn new(config: TrustRegionConfig, n_features: usize) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, radius: DVector::from_element(n_features, config.radius_init) })
    }

    /// Hyperparameters in effect.
    pub fn config(&self) -> &TrustRegionConfig {
        &self.config
    }

    /// Current radius of a feature.
    pub fn radius(&self, feature: usize) -> f64 {
        self.radius[feature]
    }

    /// Rescale a raw update so its magnitude is `min(radius, |raw|)`.
    /// A zero update stays zero.
    pub fn constrain_step(&self, feature: usize, raw: &DVector<f64>) -> DVector<f64> {
        let magnitude = raw.norm();
        if magnitude == 0.0 || !magnitude.is_finite() {
            return DVector::zeros(raw.len());
        }
        let scale = self.radius[feature].min(magnitude) / magnitude;
        raw * scale
    }

    /// Second-order predicted cost gain of a trial step, normalized by
    /// observation count: `(neg_jac · step)/n + 0.5 · stepᵀ·curv·step / n²`.
    ///
    /// `curvature` is the negative Hessian (Newton) or the submodel FIM
    /// (IRLS) over the same parameters as `step`.
    pub fn predicted_gain(
        neg_jac: &DVector<f64>,
        curvature: &DMatrix<f64>,
        step: &DVector<f64>,
        n_obs: f64,
    ) -> f64 {
        let linear = neg_jac.dot(step) / n_obs;
        let quadratic = 0.5 * step.dot(&(curvature * step)) / (n_obs * n_obs);
        linear + quadratic
    }

    /// Resize one feature's radius from its gain ratio
    /// `rho = actual_gain / predicted_gain`.
    pub fn update_radius(&mut self, feature: usize, rho: f64) {
        let factor = if rho < self.config.eta1 {
            self.config.t1
        } else if rho > self.config.eta2 {
            self.config.t2
        } else {
            1.0
        };
        self.radius[feature] = (self.radius[feature] * factor).min(self.config.upper_bound);
    }

    /// Whether a trial step with this actual gain is acceptable.
    pub fn accepts(&self, actual_gain: f64) -> bool {
        actual_gain > self.config.eta0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(TrustRegionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut c = TrustRegionConfig::default();
        c.eta1 = c.eta2 + 1.0;
        assert!(c.validate().is_err());

        let mut c = TrustRegionConfig::default();
        c.t1 = 1.5;
        assert!(c.validate().is_err());

        let mut c = TrustRegionConfig::default();
        c.t2 = 0.5;
        assert!(c.validate().is_err());

        let mut c = TrustRegionConfig::default();
        c.upper_bound = 0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_constrain_step_caps_magnitude() {
        let mut tr = TrustRegion::new(TrustRegionConfig::default(), 1).unwrap();
        tr.radius[0] = 2.0;
        let raw = DVector::from_vec(vec![3.0, 4.0]); // |raw| = 5
        let step = tr.constrain_step(0, &raw);
        assert!((step.norm() - 2.0).abs() < 1e-12);
        // direction preserved
        assert!((step[0] / step[1] - 0.75).abs() < 1e-12);

        // short steps pass through unchanged
        let short = DVector::from_vec(vec![0.3, 0.4]);
        let kept = tr.constrain_step(0, &short);
        assert!((kept - short).norm() < 1e-15);
    }

    #[test]
    fn test_zero_step_stays_zero() {
        let tr = TrustRegion::new(TrustRegionConfig::default(), 1).unwrap();
        let step = tr.constrain_step(0, &DVector::zeros(3));
        assert_eq!(step, DVector::zeros(3));
    }

    #[test]
    fn test_radius_stays_in_bounds() {
        let config = TrustRegionConfig { radius_init: 1.0, upper_bound: 4.0, ..Default::default() };
        let mut tr = TrustRegion::new(config, 1).unwrap();
        for _ in 0..20 {
            tr.update_radius(0, 10.0); // always grow
            assert!(tr.radius(0) <= 4.0);
        }
        for _ in 0..200 {
            tr.update_radius(0, -1.0); // always shrink
            assert!(tr.radius(0) >= 0.0);
        }
    }

    #[test]
    fn test_hold_band_keeps_radius() {
        let mut tr = TrustRegion::new(TrustRegionConfig::default(), 1).unwrap();
        let before = tr.radius(0);
        tr.update_radius(0, 0.5); // eta1 < 0.5 < eta2
        assert_eq!(tr.radius(0), before);
    }

    #[test]
    fn test_predicted_gain_of_newton_step_positive() {
        // for delta solving curv*delta = neg_jac, both terms are positive
        let curv = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 1.0]);
        let neg_jac = DVector::from_vec(vec![1.0, 1.0]);
        let step = DVector::from_vec(vec![0.5, 1.0]);
        let gain = TrustRegion::predicted_gain(&neg_jac, &curv, &step, 10.0);
        assert!(gain > 0.0);
    }
}
