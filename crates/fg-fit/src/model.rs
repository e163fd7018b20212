//! Concrete GLM noise models.
//!
//! Two noise models for feature-wise count/expression data:
//!
//! - **Negative Binomial**: `X ~ NB(mean = loc, size = scale)`, log link for
//!   both submodels. `Var(X) = loc + loc^2 / scale`, so a large fitted
//!   `scale` means low overdispersion.
//! - **Normal**: identity link for the mean, log link for the standard
//!   deviation.
//!
//! All derivatives are taken with respect to the linear predictors, which is
//! what the IRLS/Newton weight assembly in [`crate::aggregate`] consumes.

use fg_core::{NoiseModel, NumericBounds, Result, WeightPoint};
use fg_prob::math::{exp_clamped, ln_factorial, trigamma};
use statrs::function::gamma::{digamma, ln_gamma};

// ---------------------------------------------------------------------------
// Negative Binomial (log/log)
// ---------------------------------------------------------------------------

/// Negative Binomial noise model with log links.
#[derive(Debug, Clone)]
pub struct NegativeBinomialModel {
    bounds: NumericBounds,
}

impl NegativeBinomialModel {
    /// Create the model under a validated numeric safety policy.
    pub fn new(bounds: NumericBounds) -> Result<Self> {
        bounds.validate()?;
        Ok(Self { bounds })
    }

    /// Moment estimate of the size parameter: `mean^2 / (var - mean)`.
    /// Underdispersed features (sample variance at or below the mean) get a
    /// large size, matching their near-Poisson behavior.
    fn moments_to_size(mean: f64, variance: f64) -> f64 {
        let excess = variance - mean;
        if mean > 0.0 && excess > 0.0 {
            mean * mean / excess
        } else {
            1e4
        }
    }

    /// Weighted residual `(x - loc) / loc` of the IRLS weighted
    /// least-squares formation: `fim_weight * ybar` equals the negative
    /// location-submodel score.
    pub fn ybar(&self, x: f64, eta_loc: f64) -> f64 {
        let loc = self.location(eta_loc);
        (x - loc) / loc
    }
}

impl Default for NegativeBinomialModel {
    fn default() -> Self {
        Self { bounds: NumericBounds::default() }
    }
}

impl NoiseModel for NegativeBinomialModel {
    fn location(&self, eta_loc: f64) -> f64 {
        exp_clamped(self.bounds.clamp_eta_loc(eta_loc))
    }

    fn scale(&self, eta_scale: f64) -> f64 {
        exp_clamped(self.bounds.clamp_eta_scale(eta_scale))
    }

    fn location_link(&self, location: f64) -> f64 {
        location.ln()
    }

    fn scale_link(&self, scale: f64) -> f64 {
        scale.ln()
    }

    fn log_likelihood(&self, x: f64, eta_loc: f64, eta_scale: f64) -> f64 {
        let eta_loc = self.bounds.clamp_eta_loc(eta_loc);
        let eta_scale = self.bounds.clamp_eta_scale(eta_scale);
        let loc = exp_clamped(eta_loc);
        let r = exp_clamped(eta_scale);
        let ln_r_plus_loc = (r + loc).ln();
        let ll = ln_gamma(r + x) - ln_factorial(x) - ln_gamma(r)
            + x * (eta_loc - ln_r_plus_loc)
            + r * (eta_scale - ln_r_plus_loc);
        self.bounds.clip_ll(ll)
    }

    fn weights(&self, x: f64, eta_loc: f64, eta_scale: f64) -> WeightPoint {
        let eta_loc = self.bounds.clamp_eta_loc(eta_loc);
        let eta_scale = self.bounds.clamp_eta_scale(eta_scale);
        let loc = exp_clamped(eta_loc);
        let r = exp_clamped(eta_scale);
        let r_plus_loc = r + loc;
        let ln_r_plus_loc = r_plus_loc.ln();

        let ll = self.bounds.clip_ll(
            ln_gamma(r + x) - ln_factorial(x) - ln_gamma(r)
                + x * (eta_loc - ln_r_plus_loc)
                + r * (eta_scale - ln_r_plus_loc),
        );

        let jac_loc = r * (x - loc) / r_plus_loc;
        // digamma terms of the dispersion-submodel score
        let jac_scale = r
            * (digamma(r + x) - digamma(r) - (r + x) / r_plus_loc + r.ln() + 1.0
                - ln_r_plus_loc);

        let denom2 = r_plus_loc * r_plus_loc;
        let hess_aa = -loc * r * (x + r) / denom2;
        let hess_ab = loc * r * (x - loc) / denom2;
        let hess_bb = jac_scale
            + r * r
                * (trigamma(r + x) - trigamma(r) + (x - loc) / denom2 + 1.0 / r
                    - 1.0 / r_plus_loc);

        let fim_loc = -loc * r / r_plus_loc;

        WeightPoint { ll, jac_loc, jac_scale, hess_aa, hess_ab, hess_bb, fim_loc }
    }

    fn init_scale(&self, mean: f64, variance: f64) -> f64 {
        Self::moments_to_size(mean, variance)
    }

    fn bounds(&self) -> &NumericBounds {
        &self.bounds
    }
}

// ---------------------------------------------------------------------------
// Normal (identity/log)
// ---------------------------------------------------------------------------

/// Normal noise model: identity link for the mean, log link for the
/// standard deviation.
#[derive(Debug, Clone)]
pub struct NormalModel {
    bounds: NumericBounds,
}

impl NormalModel {
    /// Create the model under a validated numeric safety policy.
    pub fn new(bounds: NumericBounds) -> Result<Self> {
        bounds.validate()?;
        Ok(Self { bounds })
    }
}

impl Default for NormalModel {
    fn default() -> Self {
        Self { bounds: NumericBounds::default() }
    }
}

impl NoiseModel for NormalModel {
    fn location(&self, eta_loc: f64) -> f64 {
        self.bounds.clamp_eta_loc(eta_loc)
    }

    fn scale(&self, eta_scale: f64) -> f64 {
        exp_clamped(self.bounds.clamp_eta_scale(eta_scale))
    }

    fn location_link(&self, location: f64) -> f64 {
        location
    }

    fn scale_link(&self, scale: f64) -> f64 {
        scale.ln()
    }

    fn log_likelihood(&self, x: f64, eta_loc: f64, eta_scale: f64) -> f64 {
        let mean = self.location(eta_loc);
        let eta_scale = self.bounds.clamp_eta_scale(eta_scale);
        let sd = exp_clamped(eta_scale);
        let z = (x - mean) / sd;
        self.bounds.clip_ll(-0.5 * z * z - eta_scale - fg_prob::normal::LN_SQRT_2PI)
    }

    fn weights(&self, x: f64, eta_loc: f64, eta_scale: f64) -> WeightPoint {
        let mean = self.location(eta_loc);
        let eta_scale = self.bounds.clamp_eta_scale(eta_scale);
        let sd = exp_clamped(eta_scale);
        let var = sd * sd;
        let resid = x - mean;
        let z2 = (resid / sd) * (resid / sd);

        WeightPoint {
            ll: self.bounds.clip_ll(-0.5 * z2 - eta_scale - fg_prob::normal::LN_SQRT_2PI),
            jac_loc: resid / var,
            jac_scale: z2 - 1.0,
            hess_aa: -1.0 / var,
            hess_ab: -2.0 * resid / var,
            hess_bb: -2.0 * z2,
            fim_loc: -1.0 / var,
        }
    }

    fn init_scale(&self, _mean: f64, variance: f64) -> f64 {
        variance.max(f64::MIN_POSITIVE).sqrt()
    }

    fn bounds(&self) -> &NumericBounds {
        &self.bounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_grad<F: Fn(f64) -> f64>(f: F, at: f64) -> f64 {
        let h = 1e-6 * at.abs().max(1.0);
        (f(at + h) - f(at - h)) / (2.0 * h)
    }

    #[test]
    fn test_links_strictly_positive() {
        let nb = NegativeBinomialModel::default();
        for &eta in &[-900.0, -5.0, 0.0, 3.0, 900.0] {
            assert!(nb.location(eta) > 0.0);
            assert!(nb.scale(eta) > 0.0);
        }
        let norm = NormalModel::default();
        assert!(norm.scale(-900.0) > 0.0);
    }

    #[test]
    fn test_nb_ll_matches_density() {
        let nb = NegativeBinomialModel::default();
        let (x, eta_loc, eta_scale) = (7.0, 1.2, 0.4);
        let ll = nb.log_likelihood(x, eta_loc, eta_scale);
        let direct =
            fg_prob::neg_binomial::logpmf_mean_size(x, eta_loc.exp(), eta_scale.exp()).unwrap();
        assert!((ll - direct).abs() < 1e-10, "{} vs {}", ll, direct);
    }

    #[test]
    fn test_nb_scores_match_finite_differences() {
        let nb = NegativeBinomialModel::default();
        let (x, eta_loc, eta_scale) = (4.0, 0.8, -0.3);
        let w = nb.weights(x, eta_loc, eta_scale);

        let g_loc = fd_grad(|e| nb.log_likelihood(x, e, eta_scale), eta_loc);
        let g_scale = fd_grad(|e| nb.log_likelihood(x, eta_loc, e), eta_scale);
        assert!((w.jac_loc - g_loc).abs() < 1e-5, "{} vs {}", w.jac_loc, g_loc);
        assert!((w.jac_scale - g_scale).abs() < 1e-5, "{} vs {}", w.jac_scale, g_scale);
    }

    #[test]
    fn test_nb_hessian_matches_finite_differences() {
        let nb = NegativeBinomialModel::default();
        let (x, eta_loc, eta_scale) = (9.0, 1.5, 0.7);
        let w = nb.weights(x, eta_loc, eta_scale);

        let h_aa = fd_grad(|e| nb.weights(x, e, eta_scale).jac_loc, eta_loc);
        let h_ab = fd_grad(|e| nb.weights(x, eta_loc, e).jac_loc, eta_scale);
        let h_bb = fd_grad(|e| nb.weights(x, eta_loc, e).jac_scale, eta_scale);
        assert!((w.hess_aa - h_aa).abs() < 1e-4, "{} vs {}", w.hess_aa, h_aa);
        assert!((w.hess_ab - h_ab).abs() < 1e-4, "{} vs {}", w.hess_ab, h_ab);
        assert!((w.hess_bb - h_bb).abs() < 1e-4, "{} vs {}", w.hess_bb, h_bb);
    }

    #[test]
    fn test_nb_ybar_identity() {
        // fim_weight * ybar is the negative location score.
        let nb = NegativeBinomialModel::default();
        let (x, eta_loc, eta_scale) = (3.0, 0.5, 0.2);
        let w = nb.weights(x, eta_loc, eta_scale);
        let lhs = w.fim_loc * nb.ybar(x, eta_loc);
        assert!((lhs + w.jac_loc).abs() < 1e-12);
    }

    #[test]
    fn test_init_scale_from_moments() {
        let nb = NegativeBinomialModel::default();
        // mean 4, variance 8: size = 16 / 4 = 4
        assert!((nb.init_scale(4.0, 8.0) - 4.0).abs() < 1e-12);
        // underdispersed counts seed a large size (near-Poisson)
        assert!(nb.init_scale(4.0, 2.0) > 1e3);

        let norm = NormalModel::default();
        assert!((norm.init_scale(0.0, 9.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_nb_degenerate_eta_stays_finite() {
        let nb = NegativeBinomialModel::default();
        let ll = nb.log_likelihood(5.0, 5000.0, -5000.0);
        assert!(ll.is_finite());
        let w = nb.weights(0.0, -5000.0, 5000.0);
        assert!(w.ll.is_finite());
    }

    #[test]
    fn test_normal_scores_match_finite_differences() {
        let norm = NormalModel::default();
        let (x, eta_loc, eta_scale) = (2.5, 1.0, 0.3);
        let w = norm.weights(x, eta_loc, eta_scale);

        let g_loc = fd_grad(|e| norm.log_likelihood(x, e, eta_scale), eta_loc);
        let g_scale = fd_grad(|e| norm.log_likelihood(x, eta_loc, e), eta_scale);
        assert!((w.jac_loc - g_loc).abs() < 1e-5);
        assert!((w.jac_scale - g_scale).abs() < 1e-5);

        let h_aa = fd_grad(|e| norm.weights(x, e, eta_scale).jac_loc, eta_loc);
        let h_ab = fd_grad(|e| norm.weights(x, eta_loc, e).jac_loc, eta_scale);
        let h_bb = fd_grad(|e| norm.weights(x, eta_loc, e).jac_scale, eta_scale);
        assert!((w.hess_aa - h_aa).abs() < 1e-5);
        assert!((w.hess_ab - h_ab).abs() < 1e-5);
        assert!((w.hess_bb - h_bb).abs() < 1e-5);
    }

    #[test]
    fn test_normal_ll_matches_density() {
        let norm = NormalModel::default();
        let ll = norm.log_likelihood(1.0, 0.5, 0.2);
        let direct = fg_prob::normal::logpdf(1.0, 0.5, 0.2f64.exp()).unwrap();
        assert!((ll - direct).abs() < 1e-12);
    }
}
