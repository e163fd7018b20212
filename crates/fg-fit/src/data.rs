//! Input data: observation matrix, design matrices, batching.
//!
//! The observation matrix `x` (observations × features) may be dense or
//! sparse (CSC). The engine only ever touches one feature column at a time,
//! extracted into a caller-owned dense scratch buffer, so the sparse path
//! never densifies the full matrix and produces results identical to the
//! dense path.

use fg_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CscMatrix;

/// Observation matrix, observations × features, immutable during a fit.
#[derive(Debug, Clone)]
pub enum ObsMatrix {
    /// Dense storage.
    Dense(DMatrix<f64>),
    /// Compressed sparse column storage; zeros are implicit.
    Sparse(CscMatrix<f64>),
}

impl ObsMatrix {
    /// Number of observations (rows).
    pub fn nrows(&self) -> usize {
        match self {
            ObsMatrix::Dense(m) => m.nrows(),
            ObsMatrix::Sparse(m) => m.nrows(),
        }
    }

    /// Number of features (columns).
    pub fn ncols(&self) -> usize {
        match self {
            ObsMatrix::Dense(m) => m.ncols(),
            ObsMatrix::Sparse(m) => m.ncols(),
        }
    }

    /// Copy feature column `j` into `out` (length = nrows), including
    /// implicit zeros of the sparse representation.
    pub fn column_into(&self, j: usize, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.nrows());
        match self {
            ObsMatrix::Dense(m) => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = m[(i, j)];
                }
            }
            ObsMatrix::Sparse(m) => {
                out.fill(0.0);
                let col = m.col(j);
                for (&i, &v) in col.row_indices().iter().zip(col.values()) {
                    out[i] = v;
                }
            }
        }
    }

    /// Whether feature column `j` contains only zeros.
    pub fn column_is_zero(&self, j: usize) -> bool {
        match self {
            ObsMatrix::Dense(m) => m.column(j).iter().all(|&v| v == 0.0),
            ObsMatrix::Sparse(m) => m.col(j).values().iter().all(|&v| v == 0.0),
        }
    }
}

/// Restartable iterator over contiguous observation ranges.
///
/// One range is materialized, reduced into the running aggregate and
/// discarded before the next is requested; memory stays bounded by the
/// batch size regardless of the number of observations.
#[derive(Debug, Clone, Copy)]
pub struct BatchRanges {
    n: usize,
    batch_size: usize,
}

impl BatchRanges {
    /// Ranges of `batch_size` over `n` items (last range may be short).
    pub fn new(n: usize, batch_size: usize) -> Self {
        Self { n, batch_size: batch_size.max(1) }
    }

    /// Fresh pass over all ranges.
    pub fn ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> {
        let (n, b) = (self.n, self.batch_size);
        (0..n.div_ceil(b)).map(move |k| (k * b)..((k + 1) * b).min(n))
    }
}

/// Validated input to a fit: observations, effective design matrices,
/// optional log size factors.
///
/// Constraint matrices (independent → dependent parameter maps, e.g.
/// sum-to-zero identifiability constraints) are folded into the design
/// matrices once at construction: with `all = C · independent`, the
/// effective design is `design · C` and every downstream derivative lives
/// in the independent parameter space. An absent constraint matrix is the
/// identity.
#[derive(Debug, Clone)]
pub struct InputData {
    /// Observation matrix, observations × features.
    pub x: ObsMatrix,
    /// Effective location design matrix, observations × num_loc_params.
    pub design_loc: DMatrix<f64>,
    /// Effective scale design matrix, observations × num_scale_params.
    pub design_scale: DMatrix<f64>,
    /// Log size factors added to the location linear predictor.
    pub log_size_factors: Option<DVector<f64>>,
}

impl InputData {
    /// Validate shapes and fold constraints into the design matrices.
    ///
    /// Shape mismatches are fatal configuration errors, surfaced here and
    /// never mid-iteration.
    pub fn new(
        x: ObsMatrix,
        design_loc: DMatrix<f64>,
        design_scale: DMatrix<f64>,
        constraints_loc: Option<DMatrix<f64>>,
        constraints_scale: Option<DMatrix<f64>>,
        size_factors: Option<DVector<f64>>,
    ) -> Result<Self> {
        let n = x.nrows();
        if n == 0 || x.ncols() == 0 {
            return Err(Error::Validation("x must be non-empty".to_string()));
        }
        if design_loc.nrows() != n {
            return Err(Error::Validation(format!(
                "design_loc has {} rows, expected {} observations",
                design_loc.nrows(),
                n
            )));
        }
        if design_scale.nrows() != n {
            return Err(Error::Validation(format!(
                "design_scale has {} rows, expected {} observations",
                design_scale.nrows(),
                n
            )));
        }
        if design_loc.ncols() == 0 || design_scale.ncols() == 0 {
            return Err(Error::Validation(
                "design matrices must have at least one parameter column".to_string(),
            ));
        }

        let design_loc = Self::apply_constraints(design_loc, constraints_loc, "loc")?;
        let design_scale = Self::apply_constraints(design_scale, constraints_scale, "scale")?;

        let log_size_factors = match size_factors {
            None => None,
            Some(sf) => {
                if sf.len() != n {
                    return Err(Error::Validation(format!(
                        "size_factors has length {}, expected {}",
                        sf.len(),
                        n
                    )));
                }
                if sf.iter().any(|&v| !v.is_finite() || v <= 0.0) {
                    return Err(Error::Validation(
                        "size_factors must be finite and > 0".to_string(),
                    ));
                }
                Some(sf.map(|v| v.ln()))
            }
        };

        Ok(Self { x, design_loc, design_scale, log_size_factors })
    }

    fn apply_constraints(
        design: DMatrix<f64>,
        constraints: Option<DMatrix<f64>>,
        which: &str,
    ) -> Result<DMatrix<f64>> {
        match constraints {
            None => Ok(design),
            Some(c) => {
                if c.nrows() != design.ncols() {
                    return Err(Error::Validation(format!(
                        "constraints_{} has {} rows, expected {} design parameters",
                        which,
                        c.nrows(),
                        design.ncols()
                    )));
                }
                if c.ncols() == 0 || c.ncols() > c.nrows() {
                    return Err(Error::Validation(format!(
                        "constraints_{} must map to 1..={} independent parameters, got {}",
                        which,
                        c.nrows(),
                        c.ncols()
                    )));
                }
                Ok(&design * &c)
            }
        }
    }

    /// Number of observations.
    pub fn num_observations(&self) -> usize {
        self.x.nrows()
    }

    /// Number of features.
    pub fn num_features(&self) -> usize {
        self.x.ncols()
    }

    /// Number of independent location parameters per feature.
    pub fn num_loc_params(&self) -> usize {
        self.design_loc.ncols()
    }

    /// Number of independent scale parameters per feature.
    pub fn num_scale_params(&self) -> usize {
        self.design_scale.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn intercept_design(n: usize) -> DMatrix<f64> {
        DMatrix::from_element(n, 1, 1.0)
    }

    #[test]
    fn test_batch_ranges_cover_everything_restartably() {
        let b = BatchRanges::new(10, 3);
        for _ in 0..2 {
            let got: Vec<_> = b.ranges().collect();
            assert_eq!(got, vec![0..3, 3..6, 6..9, 9..10]);
        }
        // batch larger than n collapses to one range
        assert_eq!(BatchRanges::new(4, 100).ranges().count(), 1);
    }

    #[test]
    fn test_sparse_column_matches_dense() {
        let mut coo = CooMatrix::new(4, 3);
        coo.push(0, 1, 5.0);
        coo.push(2, 1, 7.0);
        coo.push(3, 2, 1.0);
        let sparse = ObsMatrix::Sparse(CscMatrix::from(&coo));
        let dense = ObsMatrix::Dense(DMatrix::from_row_slice(
            4,
            3,
            &[0., 5., 0., 0., 0., 0., 0., 7., 0., 0., 0., 1.],
        ));

        let mut a = vec![f64::NAN; 4];
        let mut b = vec![f64::NAN; 4];
        for j in 0..3 {
            sparse.column_into(j, &mut a);
            dense.column_into(j, &mut b);
            assert_eq!(a, b, "column {}", j);
            assert_eq!(sparse.column_is_zero(j), dense.column_is_zero(j));
        }
        assert!(sparse.column_is_zero(0));
        assert!(!sparse.column_is_zero(1));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let x = ObsMatrix::Dense(DMatrix::from_element(5, 2, 1.0));
        let bad = InputData::new(
            x.clone(),
            intercept_design(4),
            intercept_design(5),
            None,
            None,
            None,
        );
        assert!(bad.is_err());

        let bad_sf = InputData::new(
            x,
            intercept_design(5),
            intercept_design(5),
            None,
            None,
            Some(DVector::from_element(3, 1.0)),
        );
        assert!(bad_sf.is_err());
    }

    #[test]
    fn test_constraints_fold_into_design() {
        let x = ObsMatrix::Dense(DMatrix::from_element(3, 1, 1.0));
        // Two design params constrained to one independent param: both
        // columns collapse onto their sum.
        let design = DMatrix::from_row_slice(3, 2, &[1., 2., 1., 0., 0., 1.]);
        let c = DMatrix::from_row_slice(2, 1, &[1., 1.]);
        let data =
            InputData::new(x, design, intercept_design(3), Some(c), None, None).unwrap();
        assert_eq!(data.num_loc_params(), 1);
        assert_eq!(data.design_loc[(0, 0)], 3.0);
    }

    #[test]
    fn test_constraint_dimension_mismatch_is_fatal() {
        let x = ObsMatrix::Dense(DMatrix::from_element(3, 1, 1.0));
        let c = DMatrix::from_element(4, 2, 1.0);
        let r = InputData::new(
            x,
            intercept_design(3),
            intercept_design(3),
            Some(c),
            None,
            None,
        );
        assert!(r.is_err());
    }
}
