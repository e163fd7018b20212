//! Derivative aggregation: streaming reduction of per-batch contributions
//! into per-feature Jacobian, Hessian, FIM and log-likelihood sums.
//!
//! All observations contribute additively, so the reduction is a plain fold
//! over restartable observation ranges: one batch contribution is
//! materialized, added into the running aggregate and discarded. Features
//! are independent and reduced in parallel.

use fg_core::NoiseModel;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{BatchRanges, InputData};

/// Which submodel blocks to compute (and train).
///
/// Skipping a block shrinks the derivative tensors and skips the unused
/// per-observation weight products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelBlocks {
    /// Location (mean) submodel only.
    Location,
    /// Scale (dispersion) submodel only.
    Scale,
    /// Both submodels.
    Both,
}

impl ModelBlocks {
    /// Whether the location block is included.
    pub fn has_location(&self) -> bool {
        matches!(self, ModelBlocks::Location | ModelBlocks::Both)
    }

    /// Whether the scale block is included.
    pub fn has_scale(&self) -> bool {
        matches!(self, ModelBlocks::Scale | ModelBlocks::Both)
    }
}

/// Summed derivatives of one feature over a set of observations.
///
/// Layout: the trained parameter vector is the location block followed by
/// the scale block (either may be absent depending on [`ModelBlocks`]).
/// Sign convention follows the cost function (normalized negative
/// log-likelihood): `neg_jac` and `neg_hessian` are the derivatives of
/// `-ll`, and `fim_loc` is the positive semi-definite expected information
/// of the location submodel.
#[derive(Debug, Clone)]
pub struct FeatureDerivatives {
    /// Location block dimension (0 when the block is not computed).
    pub n_loc: usize,
    /// Scale block dimension (0 when the block is not computed).
    pub n_scale: usize,
    /// Negative Jacobian over trained parameters.
    pub neg_jac: DVector<f64>,
    /// Negative Hessian over trained parameters.
    pub neg_hessian: DMatrix<f64>,
    /// Expected information of the location submodel (n_loc × n_loc).
    pub fim_loc: DMatrix<f64>,
    /// Summed log-likelihood.
    pub ll: f64,
}

impl FeatureDerivatives {
    fn zeros(n_loc: usize, n_scale: usize) -> Self {
        let p = n_loc + n_scale;
        Self {
            n_loc,
            n_scale,
            neg_jac: DVector::zeros(p),
            neg_hessian: DMatrix::zeros(p, p),
            fim_loc: DMatrix::zeros(n_loc, n_loc),
            ll: 0.0,
        }
    }

    /// Add another batch contribution (commutative, associative up to
    /// floating-point reordering).
    fn add_assign(&mut self, other: &FeatureDerivatives) {
        self.neg_jac += &other.neg_jac;
        self.neg_hessian += &other.neg_hessian;
        self.fim_loc += &other.fim_loc;
        self.ll += other.ll;
    }

    /// Negative Jacobian of the location block.
    pub fn neg_jac_loc(&self) -> DVector<f64> {
        DVector::from_iterator(self.n_loc, self.neg_jac.iter().take(self.n_loc).copied())
    }

    /// Negative Jacobian of the scale block.
    pub fn neg_jac_scale(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_scale,
            self.neg_jac.iter().skip(self.n_loc).copied(),
        )
    }

    /// Negative Hessian of the scale block. Used as the left-hand side of
    /// the IRLS dispersion solve; unlike `fim_loc` it carries no
    /// positive-definiteness guarantee.
    pub fn neg_hessian_scale(&self) -> DMatrix<f64> {
        self.neg_hessian.view((self.n_loc, self.n_loc), (self.n_scale, self.n_scale)).into()
    }
}

/// Streams observation batches through a noise model and reduces the
/// per-batch derivative contributions feature by feature.
pub struct Aggregator<'a, M: NoiseModel> {
    data: &'a InputData,
    model: &'a M,
    blocks: ModelBlocks,
    batch_size: usize,
}

impl<'a, M: NoiseModel> Aggregator<'a, M> {
    /// New aggregator over `data` with the given block selection; batches of
    /// `batch_size` observations are reduced one at a time.
    pub fn new(data: &'a InputData, model: &'a M, blocks: ModelBlocks, batch_size: usize) -> Self {
        Self { data, model, blocks, batch_size }
    }

    fn eta_loc(&self, i: usize, a: &[f64]) -> f64 {
        let mut eta = 0.0;
        for (k, &ak) in a.iter().enumerate() {
            eta += self.data.design_loc[(i, k)] * ak;
        }
        if let Some(lsf) = &self.data.log_size_factors {
            eta += lsf[i];
        }
        eta
    }

    fn eta_scale(&self, i: usize, b: &[f64]) -> f64 {
        let mut eta = 0.0;
        for (k, &bk) in b.iter().enumerate() {
            eta += self.data.design_scale[(i, k)] * bk;
        }
        eta
    }

    /// One batch contribution: observations `batch` (indices into `rows`,
    /// or directly into the data when `rows` is `None`).
    fn batch_contribution(
        &self,
        x_col: &[f64],
        a: &[f64],
        b: &[f64],
        rows: Option<&[usize]>,
        batch: std::ops::Range<usize>,
    ) -> FeatureDerivatives {
        let nl = if self.blocks.has_location() { a.len() } else { 0 };
        let ns = if self.blocks.has_scale() { b.len() } else { 0 };
        let mut out = FeatureDerivatives::zeros(nl, ns);

        for k in batch {
            let i = rows.map_or(k, |r| r[k]);
            let w = self.model.weights(x_col[i], self.eta_loc(i, a), self.eta_scale(i, b));
            out.ll += w.ll;

            if self.blocks.has_location() {
                for p in 0..nl {
                    let dp = self.data.design_loc[(i, p)];
                    out.neg_jac[p] -= w.jac_loc * dp;
                    for q in 0..nl {
                        let dq = self.data.design_loc[(i, q)];
                        out.neg_hessian[(p, q)] -= w.hess_aa * dp * dq;
                        out.fim_loc[(p, q)] -= w.fim_loc * dp * dq;
                    }
                }
            }
            if self.blocks.has_scale() {
                for p in 0..ns {
                    let sp = self.data.design_scale[(i, p)];
                    out.neg_jac[nl + p] -= w.jac_scale * sp;
                    for q in 0..ns {
                        let sq = self.data.design_scale[(i, q)];
                        out.neg_hessian[(nl + p, nl + q)] -= w.hess_bb * sp * sq;
                    }
                }
            }
            if self.blocks.has_location() && self.blocks.has_scale() {
                for p in 0..nl {
                    let dp = self.data.design_loc[(i, p)];
                    for q in 0..ns {
                        let sq = self.data.design_scale[(i, q)];
                        let v = w.hess_ab * dp * sq;
                        out.neg_hessian[(p, nl + q)] -= v;
                        out.neg_hessian[(nl + q, p)] -= v;
                    }
                }
            }
        }
        out
    }

    /// Full reduction for one feature: fold all batch contributions over the
    /// selected rows (all observations when `rows` is `None`).
    pub fn feature_derivatives(
        &self,
        feature: usize,
        a: &[f64],
        b: &[f64],
        rows: Option<&[usize]>,
    ) -> FeatureDerivatives {
        let mut x_col = vec![0.0; self.data.num_observations()];
        self.data.x.column_into(feature, &mut x_col);

        let len = rows.map_or(self.data.num_observations(), |r| r.len());
        let nl = if self.blocks.has_location() { a.len() } else { 0 };
        let ns = if self.blocks.has_scale() { b.len() } else { 0 };
        let mut acc = FeatureDerivatives::zeros(nl, ns);
        for batch in BatchRanges::new(len, self.batch_size).ranges() {
            let part = self.batch_contribution(&x_col, a, b, rows, batch);
            acc.add_assign(&part);
        }
        acc
    }

    /// Derivatives for the listed features (parallel over features),
    /// returned in the same order.
    pub fn derivatives(
        &self,
        a_var: &DMatrix<f64>,
        b_var: &DMatrix<f64>,
        features: &[usize],
        rows: Option<&[usize]>,
    ) -> Vec<FeatureDerivatives> {
        features
            .par_iter()
            .map(|&f| {
                let a = a_var.column(f).into_owned();
                let b = b_var.column(f).into_owned();
                self.feature_derivatives(f, a.as_slice(), b.as_slice(), rows)
            })
            .collect()
    }

    /// Log-likelihood of one feature over the selected rows (all
    /// observations when `rows` is `None`).
    pub fn feature_log_likelihood(
        &self,
        feature: usize,
        a: &[f64],
        b: &[f64],
        rows: Option<&[usize]>,
    ) -> f64 {
        let mut x_col = vec![0.0; self.data.num_observations()];
        self.data.x.column_into(feature, &mut x_col);
        let len = rows.map_or(self.data.num_observations(), |r| r.len());
        let mut ll = 0.0;
        for k in 0..len {
            let i = rows.map_or(k, |r| r[k]);
            ll += self.model.log_likelihood(x_col[i], self.eta_loc(i, a), self.eta_scale(i, b));
        }
        ll
    }

    /// Full-data log-likelihood vector over all features (parallel).
    pub fn log_likelihoods(&self, a_var: &DMatrix<f64>, b_var: &DMatrix<f64>) -> DVector<f64> {
        let lls: Vec<f64> = (0..self.data.num_features())
            .into_par_iter()
            .map(|f| {
                let a = a_var.column(f).into_owned();
                let b = b_var.column(f).into_owned();
                self.feature_log_likelihood(f, a.as_slice(), b.as_slice(), None)
            })
            .collect();
        DVector::from_vec(lls)
    }
}
