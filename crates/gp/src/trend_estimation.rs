//! Generalized least squares estimation of the trend coefficients.
//!
//! Given the design matrix `F` (m, p), the factor `L` of the covariance matrix and the
//! observations `Y` (m,), the coefficients minimize `|L^-1.(Y - F.beta)|^2`.
//! With `Phi = L^-1.F = Q.G` (thin QR), `beta = G^-1.Q^T.L^-1.Y`, which never forms
//! the normal equations `F^T.C^-1.F`.

use crate::errors::{GpError, Result};
use crate::factorization::CovarianceFactor;
use linfa::Float;
use linfa_linalg::{qr::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Result of the trend coefficients estimation
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct TrendEstimate<F: Float> {
    beta: Array1<F>,
    phi: Array2<F>,
    q: Array2<F>,
    g: Array2<F>,
    whitened_residual: Array1<F>,
}

impl<F: Float> TrendEstimate<F> {
    /// Trend coefficients (p,)
    pub fn beta(&self) -> &Array1<F> {
        &self.beta
    }

    /// Whitened design matrix `Phi = L^-1.F` (m, p)
    pub fn phi(&self) -> &Array2<F> {
        &self.phi
    }

    /// Orthonormal factor of `Phi` (m, p)
    pub fn q(&self) -> &Array2<F> {
        &self.q
    }

    /// Upper triangular factor of `Phi` (p, p)
    pub fn g(&self) -> &Array2<F> {
        &self.g
    }

    /// Whitened residual `L^-1.(Y - F.beta)` (m,)
    pub fn whitened_residual(&self) -> &Array1<F> {
        &self.whitened_residual
    }

    /// `G^-T.b` for `b` (p, k)
    pub fn solve_g_transpose(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        if self.g.is_empty() {
            return Ok(Array2::zeros((0, b.ncols())));
        }
        Ok(self.g.t().solve_triangular(b, UPLO::Lower)?)
    }
}

/// Estimate trend coefficients given the design matrix `design` (m, p), the covariance
/// `factor` and the observations `y` (m,).
///
/// A diagonal entry of `G` not greater than `rank_tolerance` times the largest one
/// raises [`GpError::RankDeficientTrend`].
pub fn estimate_trend<F: Float>(
    design: &ArrayBase<impl Data<Elem = F>, Ix2>,
    factor: &CovarianceFactor<F>,
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    rank_tolerance: F,
) -> Result<TrendEstimate<F>> {
    let (m, p) = design.dim();
    if y.len() != m {
        return Err(GpError::DimensionMismatch(format!(
            "Design matrix has {m} rows while {} observations are given",
            y.len()
        )));
    }
    let y_tilde = factor.solve_lower_vec(y)?;
    if p == 0 {
        return Ok(TrendEstimate {
            beta: Array1::zeros(0),
            phi: Array2::zeros((m, 0)),
            q: Array2::zeros((m, 0)),
            g: Array2::zeros((0, 0)),
            whitened_residual: y_tilde,
        });
    }
    if m < p {
        return Err(GpError::RankDeficientTrend {
            column: m,
            value: 0.,
        });
    }

    let phi = factor.solve_lower(design)?;
    let (q, g) = phi.qr()?.into_decomp();
    let gmax = g
        .diag()
        .iter()
        .fold(F::zero(), |acc, v| acc.max(v.abs()));
    if let Some((column, value)) = g
        .diag()
        .iter()
        .enumerate()
        .find(|(_, v)| !(v.abs() > rank_tolerance * gmax) || gmax == F::zero())
    {
        return Err(GpError::RankDeficientTrend {
            column,
            value: value.abs().to_f64().unwrap_or(f64::NAN),
        });
    }

    let qty = q.t().dot(&y_tilde).insert_axis(Axis(1));
    let beta = g
        .solve_triangular_into(qty, UPLO::Upper)?
        .index_axis_move(Axis(1), 0);
    let whitened_residual = &y_tilde - &phi.dot(&beta);
    Ok(TrendEstimate {
        beta,
        phi,
        q,
        g,
        whitened_residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factorization::factorize;
    use crate::parameters::FactorizationParams;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn identity_factor(m: usize) -> CovarianceFactor<f64> {
        factorize(
            Array2::eye(m),
            &Array2::<f64>::zeros((m, 1)),
            1,
            &FactorizationParams::default(),
        )
        .expect("identity")
    }

    #[test]
    fn test_ordinary_least_squares() {
        // with C = I, GLS is OLS: fit y = 1 + 2x
        let x: Array1<f64> = array![0., 1., 2., 3.];
        let design = Array2::from_shape_fn((4, 2), |(i, j)| if j == 0 { 1. } else { x[i] });
        let y = x.mapv(|v| 1. + 2. * v);
        let est = estimate_trend(&design, &identity_factor(4), &y, 1e-10).expect("full rank");
        assert_abs_diff_eq!(array![1., 2.], est.beta().view(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            Array1::<f64>::zeros(4),
            est.whitened_residual().view(),
            epsilon = 1e-12
        );
        assert_eq!((4, 2), est.q().dim());
        assert_eq!((2, 2), est.g().dim());
    }

    #[test]
    fn test_weighted_mean() {
        // constant trend with a diagonal covariance gives the inverse variance weighted mean
        let c = Array2::from_diag(&array![1., 4.]);
        let factor = factorize(
            c,
            &Array2::<f64>::zeros((2, 1)),
            1,
            &FactorizationParams::default(),
        )
        .expect("spd");
        let design = Array2::ones((2, 1));
        let est = estimate_trend(&design, &factor, &array![1., 6.], 1e-10).expect("full rank");
        assert_abs_diff_eq!(2., est.beta()[0], epsilon = 1e-12);
    }

    #[test]
    fn test_rank_deficient_design() {
        let design = array![[1., 2.], [1., 2.], [1., 2.]];
        let res = estimate_trend(&design, &identity_factor(3), &array![1., 2., 3.], 1e-10);
        assert!(matches!(
            res,
            Err(GpError::RankDeficientTrend { column: 1, .. })
        ));
        let design = Array2::ones((2, 3));
        let res = estimate_trend(&design, &identity_factor(2), &array![1., 2.], 1e-10);
        assert!(matches!(res, Err(GpError::RankDeficientTrend { .. })));
    }

    #[test]
    fn test_empty_basis() {
        let design = Array2::<f64>::zeros((3, 0));
        let est = estimate_trend(&design, &identity_factor(3), &array![1., 2., 3.], 1e-10)
            .expect("no trend");
        assert_eq!(0, est.beta().len());
        assert_abs_diff_eq!(array![1., 2., 3.], est.whitened_residual().view());
        assert_eq!((0, 2), est.solve_g_transpose(&Array2::zeros((0, 2))).expect("empty").dim());
    }
}
