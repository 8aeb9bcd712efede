//! A module for metrics to evaluate fitted Gaussian process models.
//!
//! Leave-one-out residuals are computed in closed form (Dubrule, 1983) from the
//! cached factor: with `Q = C^-1 - C^-1.F.(F^T.C^-1.F)^-1.F^T.C^-1`, removing the `i`th
//! observation, re-estimating the trend and predicting it back gives the residual
//! `rho_i / Q_ii` with variance `1 / Q_ii`.

use crate::covariance_models::CovarianceModel;
use crate::errors::{GpError, Result};
use crate::regression::{GaussianProcessRegression, RegressionResult};
use crate::trend_models::TrendBasis;
use crate::utils::unflatten_output;
use linfa::dataset::Dataset;
use linfa::traits::Fit;
use linfa::Float;
use log::warn;
use ndarray::{s, Array1, Array2, Axis, Zip};

/// Number of unit vectors solved at once for leave-one-out diagonals
const LOO_CHUNK_SIZE: usize = 256;

/// Leave-one-out cross validation residuals, one per scalar observation
#[derive(Clone, Debug)]
pub struct LeaveOneOut<F: Float> {
    residuals: Array2<F>,
    variances: Array2<F>,
}

impl<F: Float> LeaveOneOut<F> {
    /// Observed minus predicted value when leaving the observation out (n, output_dim)
    pub fn residuals(&self) -> &Array2<F> {
        &self.residuals
    }

    /// Predictive variances when leaving the observation out (n, output_dim)
    pub fn variances(&self) -> &Array2<F> {
        &self.variances
    }

    /// Residuals divided by their predictive standard deviations (n, output_dim)
    pub fn standardized_residuals(&self) -> Array2<F> {
        &self.residuals / &self.variances.mapv(|v| v.sqrt())
    }
}

/// A trait for Q2 predictive coefficient cross validation score
pub trait PredictScore<F: Float> {
    /// Closed form leave-one-out residuals.
    ///
    /// Needs the diagonal of `C^-1`, obtained by triangular solves against every unit
    /// vector: `O(m^3)` operations for `m = n * output_dim` scalar observations whatever
    /// the factorization, with memory bounded by `O(m * 256)`.
    fn loo_residuals(&self) -> Result<LeaveOneOut<F>>;

    /// Q2 predictive coefficient with closed form leave-one-out cross validation
    fn loo_q2_score(&self) -> Result<F>;

    /// Compute quality metric Q2 with kfold cross validation, refitting the model
    /// with the same parameters on each training fold
    fn q2_score(&self, kfold: usize) -> Result<F>;
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> PredictScore<F> for RegressionResult<F, C, T> {
    fn loo_residuals(&self) -> Result<LeaveOneOut<F>> {
        let d = self.covariance().output_dim();
        let m = self.factor.dim();
        let q = self.trend_estimate.q();
        let mut q_diag = Array1::zeros(m);
        // columns of L^-1 and their projection on the whitened design space, by chunks
        for start in (0..m).step_by(LOO_CHUNK_SIZE) {
            let end = (start + LOO_CHUNK_SIZE).min(m);
            let mut unit = Array2::<F>::zeros((m, end - start));
            for j in start..end {
                unit[[j, j - start]] = F::one();
            }
            let w = self.factor.solve_lower(&unit)?;
            let proj = q.t().dot(&w);
            Zip::from(q_diag.slice_mut(s![start..end]))
                .and(w.columns())
                .and(proj.columns())
                .par_for_each(|qd, w, p| *qd = w.dot(&w) - p.dot(&p));
        }
        if let Some((i, v)) = q_diag.iter().enumerate().find(|(_, v)| !(**v > F::zero())) {
            warn!("Leave-one-out: scalar observation {i} has no residual variance");
            return Err(GpError::DegenerateCovariance {
                eigenvalue: v.to_f64().unwrap_or(f64::NAN),
                tolerance: 0.,
            });
        }
        let residuals = &self.rho / &q_diag;
        let variances = q_diag.mapv(|v| F::one() / v);
        Ok(LeaveOneOut {
            residuals: unflatten_output(&residuals, d),
            variances: unflatten_output(&variances, d),
        })
    }

    fn loo_q2_score(&self) -> Result<F> {
        let loo = self.loo_residuals()?;
        let press = loo.residuals.mapv(|v| v * v).sum();
        Ok(F::one() - press / total_sum_of_squares(&self.output))
    }

    fn q2_score(&self, kfold: usize) -> Result<F> {
        let n = self.input.nrows();
        if kfold < 2 || kfold > n {
            return Err(GpError::InvalidValueError(format!(
                "Number of folds should be in [2, {n}], got {kfold}"
            )));
        }
        let dataset = Dataset::new(self.input.to_owned(), self.output.to_owned());
        let mean = self.output.mean_axis(Axis(0)).ok_or_else(|| {
            GpError::EmptySample("Cannot compute Q2 without observations".to_string())
        })?;
        // Predictive Residual Sum of Squares
        let mut press = F::zero();
        // Total Sum of Squares
        let mut tss = F::zero();
        for (train, valid) in dataset.fold(kfold).into_iter() {
            let fitted = self.params.fit(&train)?;
            let model = GaussianProcessRegression::new(fitted).run()?;
            let pred = model.conditional().conditional_mean(valid.records())?;
            press += (valid.targets() - &pred).mapv(|v| v * v).sum();
            tss += (valid.targets() - &mean).mapv(|v| v * v).sum();
        }
        Ok(F::one() - press / tss)
    }
}

/// Sum over output components of squared deviations from the component mean
fn total_sum_of_squares<F: Float>(y: &Array2<F>) -> F {
    match y.mean_axis(Axis(0)) {
        Some(mean) => (y - &mean).mapv(|v| v * v).sum(),
        None => F::zero(),
    }
}
