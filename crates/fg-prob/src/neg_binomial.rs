//! Negative binomial distribution utilities.

use fg_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

use crate::math::ln_factorial;

/// Log-PMF of a Negative Binomial distribution parameterized by mean `mu`
/// and size `r` (the GLM dispersion submodel output).
///
/// This parameterization has:
/// - `mu > 0`, `r > 0`
/// - `Var(X) = mu + mu^2 / r`
///
/// `x` is accepted as a non-negative real so that normalized count matrices
/// work; for integer `x` this is the exact PMF.
pub fn logpmf_mean_size(x: f64, mu: f64, r: f64) -> Result<f64> {
    if !mu.is_finite() || mu <= 0.0 {
        return Err(Error::Validation(format!("mu must be finite and > 0, got {}", mu)));
    }
    if !r.is_finite() || r <= 0.0 {
        return Err(Error::Validation(format!("r must be finite and > 0, got {}", r)));
    }
    if !x.is_finite() || x < 0.0 {
        return Err(Error::Validation(format!("x must be finite and >= 0, got {}", x)));
    }

    let ln_coeff = ln_gamma(r + x) - ln_factorial(x) - ln_gamma(r);
    Ok(ln_coeff + x * (mu.ln() - (r + mu).ln()) + r * (r.ln() - (r + mu).ln()))
}

/// Negative log-likelihood for NB(mean `mu`, size `r`).
pub fn nll_mean_size(x: f64, mu: f64, r: f64) -> Result<f64> {
    Ok(-logpmf_mean_size(x, mu, r)?)
}

/// Log-PMF in the classical (r, p) parameterization: `x` successes with
/// probability `p` before `r` failures.
///
/// Related to the mean/size form by `p = mu / (r + mu)`.
pub fn logpmf_r_p(x: f64, r: f64, p: f64) -> Result<f64> {
    if !r.is_finite() || r <= 0.0 {
        return Err(Error::Validation(format!("r must be finite and > 0, got {}", r)));
    }
    if !p.is_finite() || p <= 0.0 || p >= 1.0 {
        return Err(Error::Validation(format!("p must be in (0, 1), got {}", p)));
    }
    if !x.is_finite() || x < 0.0 {
        return Err(Error::Validation(format!("x must be finite and >= 0, got {}", x)));
    }

    Ok(ln_gamma(r + x) - ln_factorial(x) - ln_gamma(r) + x * p.ln() + r * (1.0 - p).ln())
}
