//! Per-feature Newton/IRLS linear solves.
//!
//! Every feature owns a small p×p system `lhs · delta = rhs` built from its
//! aggregated derivatives. The mean-submodel FIM is positive semi-definite
//! by construction, so it takes a Cholesky fast path; everything else (and
//! any Cholesky failure) goes through SVD least squares. A feature whose
//! system cannot be solved at all gets a zero update and a warning — it
//! simply stays non-converged, the batch solve never fails as a whole.

use nalgebra::{DMatrix, DVector};

use crate::aggregate::{FeatureDerivatives, ModelBlocks};

/// Relative singular-value cutoff of the least-squares fallback.
const LSTSQ_EPS: f64 = 1e-12;

/// Solve `lhs · delta = rhs` for one feature.
///
/// `psd` marks the left-hand side as guaranteed positive semi-definite
/// (Cholesky fast path). Ill-conditioned systems degrade to the SVD
/// least-squares solution; an unusable result degrades to a zero update.
pub fn solve_system(lhs: &DMatrix<f64>, rhs: &DVector<f64>, psd: bool) -> DVector<f64> {
    if psd {
        if let Some(chol) = lhs.clone().cholesky() {
            let delta = chol.solve(rhs);
            if delta.iter().all(|v| v.is_finite()) {
                return delta;
            }
        }
    }

    let svd = lhs.clone().svd(true, true);
    match svd.solve(rhs, LSTSQ_EPS) {
        Ok(delta) if delta.iter().all(|v| v.is_finite()) => delta,
        _ => {
            log::warn!("linear solve degenerate ({}x{}); zero update", lhs.nrows(), lhs.ncols());
            DVector::zeros(rhs.len())
        }
    }
}

/// Newton-Raphson raw update over all trained parameters:
/// `neg_hessian · delta = neg_jac`.
pub fn newton_update(d: &FeatureDerivatives) -> DVector<f64> {
    solve_system(&d.neg_hessian, &d.neg_jac, false)
}

/// IRLS raw updates, one per submodel block.
///
/// The mean block solves against the FIM (`psd = true`); the dispersion
/// block has no positive-definiteness guarantee and solves against the
/// observed negative Hessian block.
pub fn irls_update(d: &FeatureDerivatives) -> (DVector<f64>, DVector<f64>) {
    let loc = if d.n_loc > 0 {
        solve_system(&d.fim_loc, &d.neg_jac_loc(), true)
    } else {
        DVector::zeros(0)
    };
    let scale = if d.n_scale > 0 {
        solve_system(&d.neg_hessian_scale(), &d.neg_jac_scale(), false)
    } else {
        DVector::zeros(0)
    };
    (loc, scale)
}

/// Pad a trained-parameter step to the full parameter length, inserting
/// zero blocks for untrained submodels.
pub fn pad_update(
    step: &DVector<f64>,
    blocks: ModelBlocks,
    n_loc_full: usize,
    n_scale_full: usize,
) -> DVector<f64> {
    let mut out = DVector::zeros(n_loc_full + n_scale_full);
    match blocks {
        ModelBlocks::Both => {
            debug_assert_eq!(step.len(), n_loc_full + n_scale_full);
            out.copy_from(step);
        }
        ModelBlocks::Location => {
            debug_assert_eq!(step.len(), n_loc_full);
            out.rows_mut(0, n_loc_full).copy_from(step);
        }
        ModelBlocks::Scale => {
            debug_assert_eq!(step.len(), n_scale_full);
            out.rows_mut(n_loc_full, n_scale_full).copy_from(step);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psd_solve_matches_direct() {
        let lhs = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let rhs = DVector::from_vec(vec![1.0, 2.0]);
        let delta = solve_system(&lhs, &rhs, true);
        let back = &lhs * &delta;
        assert!((back - rhs).norm() < 1e-12);
    }

    #[test]
    fn test_singular_system_degrades_to_least_squares() {
        // rank-1 matrix: exact solve impossible, least squares well-defined
        let lhs = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DVector::from_vec(vec![2.0, 0.0]);
        let delta = solve_system(&lhs, &rhs, false);
        assert!(delta.iter().all(|v| v.is_finite()));
        // minimum-norm solution of the normal equations: both entries 0.5
        assert!((delta[0] - 0.5).abs() < 1e-10);
        assert!((delta[1] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_psd_flag_falls_back_when_not_psd() {
        // indefinite lhs with psd=true must still produce a finite solution
        let lhs = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let rhs = DVector::from_vec(vec![1.0, 1.0]);
        let delta = solve_system(&lhs, &rhs, true);
        assert!(delta.iter().all(|v| v.is_finite()));
        assert!((&lhs * &delta - rhs).norm() < 1e-10);
    }

    #[test]
    fn test_pad_update_blocks() {
        let step = DVector::from_vec(vec![1.0, 2.0]);
        let loc = pad_update(&step, ModelBlocks::Location, 2, 3);
        assert_eq!(loc.as_slice(), &[1.0, 2.0, 0.0, 0.0, 0.0]);
        let scale = pad_update(&step, ModelBlocks::Scale, 3, 2);
        assert_eq!(scale.as_slice(), &[0.0, 0.0, 0.0, 1.0, 2.0]);
        let both = pad_update(&DVector::from_vec(vec![1.0, 2.0, 3.0]), ModelBlocks::Both, 2, 1);
        assert_eq!(both.as_slice(), &[1.0, 2.0, 3.0]);
    }
}
