//! Outer fitting loop: parameter state, convergence tracking, termination.
//!
//! The estimator owns nothing between calls; `fit` takes the validated
//! input data and produces a [`FitResult`]. Per iteration it aggregates
//! derivatives for the active features, proposes Newton or IRLS steps,
//! runs them through the trust region (when configured) and commits the
//! accepted trial columns. Features are independent; all per-feature work
//! inside an iteration runs in parallel, writes to the parameter matrices
//! happen serially at the iteration boundary.

use fg_core::{Error, FitStatus, NoiseModel, Result};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregator, FeatureDerivatives, ModelBlocks};
use crate::data::InputData;
use crate::newton;
use crate::trust_region::{TrustRegion, TrustRegionConfig};

/// Update rule of the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Optimizer {
    /// Newton-Raphson, unguarded.
    Nr,
    /// Newton-Raphson with trust-region step control.
    NrTr,
    /// IRLS (FIM in place of the Hessian for the mean submodel), unguarded.
    Irls,
    /// IRLS with trust-region step control.
    IrlsTr,
    /// Plain gradient descent. Not implemented.
    Gd,
    /// Adam. Not implemented.
    Adam,
    /// RMSProp. Not implemented.
    Rmsprop,
}

impl Optimizer {
    /// Whether steps are guarded by a trust region.
    pub fn uses_trust_region(&self) -> bool {
        matches!(self, Optimizer::NrTr | Optimizer::IrlsTr)
    }

    /// Whether the mean-submodel solve uses the FIM instead of the Hessian.
    pub fn is_irls(&self) -> bool {
        matches!(self, Optimizer::Irls | Optimizer::IrlsTr)
    }
}

/// Granularity of the convergence decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationType {
    /// One shared criterion; all features step together until the summed
    /// log-likelihood stops moving.
    Global,
    /// Independent per-feature criterion; converged features are frozen
    /// and masked out of subsequent solves.
    ByFeature,
}

/// Per-feature convergence test, evaluated against `stopping_criteria`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceCriteria {
    /// Normalized log-likelihood change of the trial step.
    LogLikelihoodChange,
    /// Euclidean norm of the applied parameter step.
    ParameterChange,
}

/// Fit configuration. Validated once, immutable for the fit's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Update rule.
    pub optimizer: Optimizer,
    /// Convergence decision granularity.
    pub termination: TerminationType,
    /// Per-feature convergence test.
    pub convergence: ConvergenceCriteria,
    /// Tolerance of the convergence test.
    pub stopping_criteria: f64,
    /// Iteration cap; hitting it is a partial success, not an error.
    pub max_iterations: usize,
    /// Which submodel blocks are trained.
    pub blocks: ModelBlocks,
    /// Propose steps from a random observation subset each iteration
    /// instead of the full data. The accept/reject decision stays on the
    /// full data.
    pub use_batching: bool,
    /// Observations per batch, both for streaming reduction and for the
    /// stochastic subset when `use_batching` is set.
    pub batch_size: usize,
    /// Trust-region hyperparameters (ignored by unguarded optimizers).
    pub trust_region: TrustRegionConfig,
    /// Seed of the stochastic subset sampler.
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            optimizer: Optimizer::IrlsTr,
            termination: TerminationType::ByFeature,
            convergence: ConvergenceCriteria::LogLikelihoodChange,
            stopping_criteria: 1e-8,
            max_iterations: 1000,
            blocks: ModelBlocks::Both,
            use_batching: false,
            batch_size: 500,
            trust_region: TrustRegionConfig::default(),
            seed: 0,
        }
    }
}

impl FitConfig {
    /// Fail fast on anything that would otherwise surface mid-iteration.
    pub fn validate(&self) -> Result<()> {
        match self.optimizer {
            Optimizer::Gd | Optimizer::Adam | Optimizer::Rmsprop => {
                return Err(Error::NotImplemented(format!(
                    "first-order optimizer {:?} is not available in this engine",
                    self.optimizer
                )));
            }
            _ => {}
        }
        if self.use_batching && self.optimizer == Optimizer::IrlsTr {
            // The batched predicted-gain formula for the split IRLS solve is
            // an open problem upstream; refusing beats guessing.
            return Err(Error::NotImplemented(
                "batched trial steps are not supported with irls_tr".to_string(),
            ));
        }
        if self.use_batching && !self.optimizer.uses_trust_region() {
            return Err(Error::Validation(
                "use_batching requires a trust-region optimizer".to_string(),
            ));
        }
        if !(self.stopping_criteria > 0.0 && self.stopping_criteria.is_finite()) {
            return Err(Error::Validation(format!(
                "stopping_criteria must be a positive finite number, got {}",
                self.stopping_criteria
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be >= 1".to_string()));
        }
        self.trust_region.validate()?;
        Ok(())
    }
}

/// Outcome of a fit run.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Location coefficients, num_loc_params × num_features.
    pub a_var: DMatrix<f64>,
    /// Scale coefficients, num_scale_params × num_features.
    pub b_var: DMatrix<f64>,
    /// Full-data log-likelihood per feature at the solution.
    pub log_likelihoods: DVector<f64>,
    /// Per-feature convergence flags.
    pub converged: Vec<bool>,
    /// Whether each feature's last trial step was accepted.
    pub updated: Vec<bool>,
    /// How the run terminated.
    pub status: FitStatus,
    /// Iterations actually executed.
    pub iterations: usize,
    /// Jacobian/Hessian/FIM/ll per feature at the solution, both submodel
    /// blocks, for downstream hypothesis testing.
    pub derivatives: Vec<FeatureDerivatives>,
}

impl FitResult {
    /// Full parameter matrix: location block stacked over scale block.
    pub fn params(&self) -> DMatrix<f64> {
        let (nl, ns, nf) = (self.a_var.nrows(), self.b_var.nrows(), self.a_var.ncols());
        let mut out = DMatrix::zeros(nl + ns, nf);
        out.rows_mut(0, nl).copy_from(&self.a_var);
        out.rows_mut(nl, ns).copy_from(&self.b_var);
        out
    }
}

/// Evaluated trial step of one feature, produced in parallel and applied
/// serially.
struct Trial {
    feature: usize,
    a_col: DVector<f64>,
    b_col: DVector<f64>,
    ll_new: f64,
    gain: f64,
    rho: f64,
    step_norm: f64,
}

/// Fits one GLM per feature of the input data.
pub struct Estimator<'a, M: NoiseModel> {
    data: &'a InputData,
    model: &'a M,
    config: FitConfig,
}

impl<'a, M: NoiseModel> Estimator<'a, M> {
    /// New estimator over validated input; configuration errors surface
    /// here, never mid-iteration.
    pub fn new(data: &'a InputData, model: &'a M, config: FitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { data, model, config })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Closed-form starting values: per feature, the link-transformed
    /// sample moments regressed onto the design matrices via normal
    /// equations. Exact for intercept-only designs.
    pub fn init_params(&self) -> (DMatrix<f64>, DMatrix<f64>) {
        let n = self.data.num_observations();
        let nl = self.data.num_loc_params();
        let ns = self.data.num_scale_params();
        let nf = self.data.num_features();

        let ones = DVector::from_element(n, 1.0);
        let xtx_loc = self.data.design_loc.tr_mul(&self.data.design_loc);
        let xtx_scale = self.data.design_scale.tr_mul(&self.data.design_scale);
        let colsum_loc = self.data.design_loc.tr_mul(&ones);
        let colsum_scale = self.data.design_scale.tr_mul(&ones);
        let mean_lsf = self.data.log_size_factors.as_ref().map_or(0.0, |v| v.mean());
        let bounds = self.model.bounds();

        let cols: Vec<(DVector<f64>, DVector<f64>)> = (0..nf)
            .into_par_iter()
            .map(|f| {
                let mut x_col = vec![0.0; n];
                self.data.x.column_into(f, &mut x_col);
                let mean = x_col.iter().sum::<f64>() / n as f64;
                let variance = if n > 1 {
                    x_col.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>()
                        / (n as f64 - 1.0)
                } else {
                    0.0
                };

                let mut eta_loc = self.model.location_link(mean) - mean_lsf;
                if !eta_loc.is_finite() {
                    eta_loc = bounds.eta_loc.0;
                }
                let mut eta_scale =
                    self.model.scale_link(self.model.init_scale(mean, variance));
                if !eta_scale.is_finite() {
                    eta_scale = bounds.eta_scale.0;
                }

                let a = newton::solve_system(&xtx_loc, &(&colsum_loc * eta_loc), true);
                let b = newton::solve_system(&xtx_scale, &(&colsum_scale * eta_scale), true);
                (a, b)
            })
            .collect();

        let mut a_var = DMatrix::zeros(nl, nf);
        let mut b_var = DMatrix::zeros(ns, nf);
        for (f, (a, b)) in cols.into_iter().enumerate() {
            a_var.set_column(f, &a);
            b_var.set_column(f, &b);
        }
        (a_var, b_var)
    }

    /// Fit from closed-form starting values.
    pub fn fit(&self) -> Result<FitResult> {
        let (a_var, b_var) = self.init_params();
        self.fit_from(a_var, b_var)
    }

    /// Fit from caller-supplied starting values (warm start).
    pub fn fit_from(
        &self,
        mut a_var: DMatrix<f64>,
        mut b_var: DMatrix<f64>,
    ) -> Result<FitResult> {
        let nf = self.data.num_features();
        let n_obs = self.data.num_observations();
        let nl = self.data.num_loc_params();
        let ns = self.data.num_scale_params();
        if a_var.shape() != (nl, nf) || b_var.shape() != (ns, nf) {
            return Err(Error::Validation(format!(
                "starting values have shape {:?}/{:?}, expected ({}, {})/({}, {})",
                a_var.shape(),
                b_var.shape(),
                nl,
                nf,
                ns,
                nf
            )));
        }

        let agg = Aggregator::new(self.data, self.model, self.config.blocks, self.config.batch_size);
        let mut tr = if self.config.optimizer.uses_trust_region() {
            Some(TrustRegion::new(self.config.trust_region, nf)?)
        } else {
            None
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut ll_prev = agg.log_likelihoods(&a_var, &b_var);
        let mut converged = vec![false; nf];
        let mut updated = vec![false; nf];
        let mut status = FitStatus::MaxIterationsReached;
        let mut iterations = 0;
        let tol = self.config.stopping_criteria;
        let n_obs_f = n_obs as f64;

        for it in 0..self.config.max_iterations {
            let active: Vec<usize> = match self.config.termination {
                TerminationType::Global => (0..nf).collect(),
                TerminationType::ByFeature => {
                    (0..nf).filter(|&f| !converged[f]).collect()
                }
            };
            if active.is_empty() {
                status = FitStatus::Converged;
                break;
            }

            let rows: Option<Vec<usize>> = if self.config.use_batching {
                let k = self.config.batch_size.min(n_obs);
                let mut idx = rand::seq::index::sample(&mut rng, n_obs, k).into_vec();
                idx.sort_unstable();
                Some(idx)
            } else {
                None
            };
            let n_norm = rows.as_ref().map_or(n_obs_f, |r| r.len() as f64);

            let derivs = agg.derivatives(&a_var, &b_var, &active, rows.as_deref());

            let tr_ref = tr.as_ref();
            let rows_ref = rows.as_deref();
            let trials: Vec<Trial> = active
                .par_iter()
                .enumerate()
                .map(|(idx, &f)| {
                    let d = &derivs[idx];
                    let (step, predicted) = self.propose_step(f, d, tr_ref, n_norm);

                    let mut a_col = a_var.column(f).into_owned();
                    let mut b_col = b_var.column(f).into_owned();
                    for k in 0..nl {
                        a_col[k] -= step[k];
                    }
                    for k in 0..ns {
                        b_col[k] -= step[nl + k];
                    }

                    let ll_new =
                        agg.feature_log_likelihood(f, a_col.as_slice(), b_col.as_slice(), None);
                    let gain = (ll_new - ll_prev[f]) / n_obs_f;

                    // In stochastic mode the radius is driven by the same
                    // minibatch the step was proposed from; the full-data
                    // gain is used only for the accept decision.
                    let rho = match (tr_ref, rows_ref) {
                        (None, _) => 0.0,
                        (Some(_), None) => gain / predicted,
                        (Some(_), Some(r)) => {
                            let batch_new = agg.feature_log_likelihood(
                                f,
                                a_col.as_slice(),
                                b_col.as_slice(),
                                Some(r),
                            );
                            ((batch_new - d.ll) / n_norm) / predicted
                        }
                    };

                    let step_norm = step.norm();
                    Trial { feature: f, a_col, b_col, ll_new, gain, rho, step_norm }
                })
                .collect();

            let mut any_accepted = false;
            let mut total_gain = 0.0;
            let mut n_accepted = 0usize;
            for t in &trials {
                let accept = match tr.as_ref() {
                    Some(trc) => trc.accepts(t.gain),
                    None => true,
                };
                if accept {
                    a_var.column_mut(t.feature).copy_from(&t.a_col);
                    b_var.column_mut(t.feature).copy_from(&t.b_col);
                    ll_prev[t.feature] = t.ll_new;
                    updated[t.feature] = true;
                    any_accepted = true;
                    total_gain += t.gain;
                    n_accepted += 1;
                } else {
                    updated[t.feature] = false;
                }

                if self.config.termination == TerminationType::ByFeature {
                    // A rejected trial with a vanishing gain is a plateau;
                    // the feature is converged at its committed parameters.
                    let small = match self.config.convergence {
                        ConvergenceCriteria::LogLikelihoodChange => t.gain.abs() < tol,
                        ConvergenceCriteria::ParameterChange => t.step_norm < tol,
                    };
                    if small {
                        converged[t.feature] = true;
                    }
                    // converged features report updated = false from here on
                    if converged[t.feature] {
                        updated[t.feature] = false;
                    }
                }

                if let Some(trc) = tr.as_mut() {
                    trc.update_radius(t.feature, t.rho);
                }
            }

            iterations = it + 1;
            log::debug!(
                "iteration {}: {} active, {} accepted, summed gain {:.3e}",
                iterations,
                active.len(),
                n_accepted,
                total_gain
            );

            match self.config.termination {
                TerminationType::Global => {
                    if any_accepted && total_gain.abs() < tol {
                        converged.iter_mut().for_each(|c| *c = true);
                        status = FitStatus::Converged;
                        break;
                    }
                }
                TerminationType::ByFeature => {
                    if converged.iter().all(|&c| c) {
                        status = FitStatus::Converged;
                        break;
                    }
                }
            }
        }

        self.override_zero_features(&mut a_var, &mut converged, &mut updated);

        let final_agg =
            Aggregator::new(self.data, self.model, ModelBlocks::Both, self.config.batch_size);
        let log_likelihoods = final_agg.log_likelihoods(&a_var, &b_var);
        let all: Vec<usize> = (0..nf).collect();
        let derivatives = final_agg.derivatives(&a_var, &b_var, &all, None);

        Ok(FitResult {
            a_var,
            b_var,
            log_likelihoods,
            converged,
            updated,
            status,
            iterations,
            derivatives,
        })
    }

    /// Raw Newton/IRLS update, trust-region constrained when configured,
    /// padded to the full parameter length. Returns the step and the
    /// predicted normalized gain (0 without a trust region).
    fn propose_step(
        &self,
        feature: usize,
        d: &FeatureDerivatives,
        tr: Option<&TrustRegion>,
        n_norm: f64,
    ) -> (DVector<f64>, f64) {
        let (trained, predicted) = if self.config.optimizer.is_irls() {
            let (loc_raw, scale_raw) = newton::irls_update(d);
            let (ls, ss, p) = match tr {
                None => (loc_raw, scale_raw, 0.0),
                Some(tr) => {
                    // Each submodel block is constrained against the same
                    // radius; the predicted gain sums the block quadratics.
                    let ls = tr.constrain_step(feature, &loc_raw);
                    let ss = tr.constrain_step(feature, &scale_raw);
                    let mut p = 0.0;
                    if d.n_loc > 0 {
                        p += TrustRegion::predicted_gain(
                            &d.neg_jac_loc(),
                            &d.fim_loc,
                            &ls,
                            n_norm,
                        );
                    }
                    if d.n_scale > 0 {
                        p += TrustRegion::predicted_gain(
                            &d.neg_jac_scale(),
                            &d.neg_hessian_scale(),
                            &ss,
                            n_norm,
                        );
                    }
                    (ls, ss, p)
                }
            };
            let mut u = DVector::zeros(d.n_loc + d.n_scale);
            u.rows_mut(0, d.n_loc).copy_from(&ls);
            u.rows_mut(d.n_loc, d.n_scale).copy_from(&ss);
            (u, p)
        } else {
            let u = newton::newton_update(d);
            match tr {
                None => (u, 0.0),
                Some(tr) => {
                    let u = tr.constrain_step(feature, &u);
                    let p = TrustRegion::predicted_gain(&d.neg_jac, &d.neg_hessian, &u, n_norm);
                    (u, p)
                }
            }
        };
        let step = newton::pad_update(
            &trained,
            self.config.blocks,
            self.data.num_loc_params(),
            self.data.num_scale_params(),
        );
        (step, predicted)
    }

    /// Post-fit override for all-zero feature columns under a log mean
    /// link: the MLE sits at the boundary, so the location coefficients are
    /// pinned to the lower linear-predictor bound instead of drifting there
    /// numerically.
    fn override_zero_features(
        &self,
        a_var: &mut DMatrix<f64>,
        converged: &mut [bool],
        updated: &mut [bool],
    ) {
        if self.model.location_link(0.0).is_finite() {
            return;
        }
        for f in 0..self.data.num_features() {
            if self.data.x.column_is_zero(f) {
                a_var.column_mut(f).fill(0.0);
                a_var[(0, f)] = self.model.bounds().eta_loc.0;
                converged[f] = true;
                updated[f] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ObsMatrix;
    use crate::model::NegativeBinomialModel;

    fn intercept_data(x: DMatrix<f64>) -> InputData {
        let n = x.nrows();
        let design = DMatrix::from_element(n, 1, 1.0);
        InputData::new(ObsMatrix::Dense(x), design.clone(), design, None, None, None).unwrap()
    }

    #[test]
    fn test_first_order_optimizers_rejected() {
        for opt in [Optimizer::Gd, Optimizer::Adam, Optimizer::Rmsprop] {
            let config = FitConfig { optimizer: opt, ..Default::default() };
            assert!(matches!(config.validate(), Err(Error::NotImplemented(_))));
        }
    }

    #[test]
    fn test_batched_irls_tr_rejected() {
        let config =
            FitConfig { optimizer: Optimizer::IrlsTr, use_batching: true, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::NotImplemented(_))));
        // the Newton trust-region path does support batching
        let ok =
            FitConfig { optimizer: Optimizer::NrTr, use_batching: true, ..Default::default() };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_batching_requires_trust_region() {
        let config =
            FitConfig { optimizer: Optimizer::Irls, use_batching: true, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let config = FitConfig { stopping_criteria: 0.0, ..Default::default() };
        assert!(config.validate().is_err());
        let config = FitConfig { stopping_criteria: f64::NAN, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_params_intercept_only_is_link_of_mean() {
        let data = intercept_data(DMatrix::from_element(20, 1, 10.0));
        let model = NegativeBinomialModel::default();
        let est = Estimator::new(&data, &model, FitConfig::default()).unwrap();
        let (a, _b) = est.init_params();
        assert!((a[(0, 0)] - 10.0f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn test_zero_iterations_keeps_initial_likelihood() {
        let x = DMatrix::from_column_slice(6, 1, &[3., 5., 2., 8., 4., 6.]);
        let data = intercept_data(x);
        let model = NegativeBinomialModel::default();
        let config = FitConfig { max_iterations: 0, ..Default::default() };
        let est = Estimator::new(&data, &model, config).unwrap();

        let (a, b) = est.init_params();
        let agg = Aggregator::new(&data, &model, ModelBlocks::Both, 64);
        let initial = agg.log_likelihoods(&a, &b);

        let result = est.fit().unwrap();
        assert_eq!(result.iterations, 0);
        assert!((result.log_likelihoods[0] - initial[0]).abs() < 1e-12);
        assert_eq!(result.a_var, a);
        assert_eq!(result.b_var, b);
    }

    #[test]
    fn test_warm_start_shape_mismatch_is_fatal() {
        let data = intercept_data(DMatrix::from_element(5, 1, 2.0));
        let model = NegativeBinomialModel::default();
        let est = Estimator::new(&data, &model, FitConfig::default()).unwrap();
        let bad = est.fit_from(DMatrix::zeros(2, 1), DMatrix::zeros(1, 1));
        assert!(bad.is_err());
    }
}
