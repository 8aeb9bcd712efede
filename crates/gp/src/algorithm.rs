use crate::covariance_models::{CovarianceModel, SquaredExponentialKernel, StationaryCovariance};
use crate::errors::{GpError, Result};
use crate::factorization::{factorize, CovarianceFactor, FactorizationKind};
use crate::parameters::{GpParams, GpValidParams};
use crate::trend_estimation::{estimate_trend, TrendEstimate};
use crate::trend_models::{ConstantTrend, TrendBasis};
use crate::utils::{block_design, flatten_output};

use linfa::prelude::{DatasetBase, Fit, Float};
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::sync::Arc;
use std::time::Instant;

/// The fitter of a Gaussian process for a given covariance model and trend basis.
///
/// It is the checked set of [`GpParams`]: fitting evaluates one candidate covariance model,
/// it does not tune hyperparameters. An external optimizer is expected to rank candidates
/// with [`FitterResult::log_likelihood`] or [`FitterResult::reduced_log_likelihood`].
pub type GaussianProcessFitter<F, C, T> = GpValidParams<F, C, T>;

/// Kriging as GP special case when using constant trend and squared exponential covariance
pub type Kriging<F> = GpParams<F, StationaryCovariance<F, SquaredExponentialKernel>, ConstantTrend>;

impl<F: Float> Kriging<F> {
    /// Kriging parameters constructor for inputs of dimension `input_dim`
    pub fn params(
        input_dim: usize,
    ) -> GpParams<F, StationaryCovariance<F, SquaredExponentialKernel>, ConstantTrend> {
        GpParams::new(
            StationaryCovariance::new(SquaredExponentialKernel(), input_dim),
            ConstantTrend(),
        )
    }
}

/// Result of fitting a GP for a given covariance model.
///
/// The process `Y(x) = F(x).beta + Z(x)` is modeled with
/// * `F(x)` the trend basis replicated for each output component,
/// * `beta` the generalized least squares trend coefficients,
/// * `Z(x)` a centered gaussian process with the given covariance model.
///
/// The covariance matrix of the observations is factorized once and shared
/// by every object derived from this result.
#[derive(Clone, Debug)]
pub struct FitterResult<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    /// Parameters used to fit
    pub(crate) params: GpValidParams<F, C, T>,
    /// Training inputs (n, nx)
    pub(crate) input: Array2<F>,
    /// Training outputs (n, output_dim)
    pub(crate) output: Array2<F>,
    /// Block design matrix (n * output_dim, p * output_dim)
    pub(crate) design: Array2<F>,
    /// Generalized least squares estimation
    pub(crate) trend_estimate: TrendEstimate<F>,
    /// Factor of the covariance matrix
    pub(crate) factor: Arc<CovarianceFactor<F>>,
    /// Log-likelihood of the observations
    pub(crate) log_likelihood: F,
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> GaussianProcessFitter<F, C, T> {
    /// Fit the GP on `x` (n, nx) inputs and `y` (n, output_dim) outputs.
    ///
    /// Discretizes the covariance model, factorizes the covariance matrix,
    /// estimates trend coefficients and computes the log-likelihood.
    /// Factorization or estimation failures are returned unchanged.
    pub fn fit_samples(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<FitterResult<F, C, T>> {
        let d = self.covariance.output_dim();
        check_samples(x, y, self.covariance.input_dim(), d)?;
        let basis = self.trend.value(x);
        let p = self.trend.size(x.ncols());
        if basis.dim() != (x.nrows(), p) {
            return Err(GpError::DimensionMismatch(format!(
                "Trend basis should give ({}, {p}) values, got {:?}",
                x.nrows(),
                basis.dim()
            )));
        }

        let now = Instant::now();
        let covariance_matrix = self.covariance.discretize(x);
        debug!(
            "Covariance matrix ({}, {}) discretized in {:?}",
            covariance_matrix.nrows(),
            covariance_matrix.ncols(),
            now.elapsed()
        );
        let factor = factorize(covariance_matrix, x, d, &self.factorization)?;

        let design = block_design(&basis, d);
        let yv = flatten_output(y);
        let trend_estimate = estimate_trend(&design, &factor, &yv, self.rank_tolerance)?;

        let m = F::cast(yv.len());
        let residual_norm2 = trend_estimate
            .whitened_residual()
            .fold(F::zero(), |acc, v| acc + *v * *v);
        let log_likelihood = -F::cast(0.5)
            * (residual_norm2
                + factor.log_determinant()
                + m * F::cast(2. * std::f64::consts::PI).ln());
        debug!(
            "GP fitted with {} factor in {:?}, log-likelihood = {}",
            factor.kind(),
            now.elapsed(),
            log_likelihood
        );

        Ok(FitterResult {
            params: self.clone(),
            input: x.to_owned(),
            output: y.to_owned(),
            design,
            trend_estimate,
            factor: Arc::new(factor),
            log_likelihood,
        })
    }
}

/// Check sample sizes and dimensions against the covariance model ones
pub(crate) fn check_samples<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    input_dim: usize,
    output_dim: usize,
) -> Result<()> {
    if x.nrows() == 0 {
        return Err(GpError::EmptySample(
            "Input sample should hold at least one point".to_string(),
        ));
    }
    if x.nrows() != y.nrows() {
        return Err(GpError::DimensionMismatch(format!(
            "Input sample size {} differs from output sample size {}",
            x.nrows(),
            y.nrows()
        )));
    }
    if x.ncols() != input_dim {
        return Err(GpError::DimensionMismatch(format!(
            "Input dimension {} differs from covariance model input dimension {input_dim}",
            x.ncols()
        )));
    }
    if y.ncols() != output_dim {
        return Err(GpError::DimensionMismatch(format!(
            "Output dimension {} differs from covariance model output dimension {output_dim}",
            y.ncols()
        )));
    }
    Ok(())
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> FitterResult<F, C, T> {
    /// Covariance model
    pub fn covariance(&self) -> &C {
        &self.params.covariance
    }

    /// Trend basis
    pub fn trend(&self) -> &T {
        &self.params.trend
    }

    /// Parameters used to fit
    pub fn params(&self) -> &GpValidParams<F, C, T> {
        &self.params
    }

    /// Training inputs (n, nx)
    pub fn input(&self) -> &Array2<F> {
        &self.input
    }

    /// Training outputs (n, output_dim)
    pub fn output(&self) -> &Array2<F> {
        &self.output
    }

    /// Block design matrix (n * output_dim, p * output_dim)
    pub fn design(&self) -> &Array2<F> {
        &self.design
    }

    /// Trend coefficients (p * output_dim,)
    pub fn beta(&self) -> &Array1<F> {
        self.trend_estimate.beta()
    }

    /// Generalized least squares estimation details
    pub fn trend_estimate(&self) -> &TrendEstimate<F> {
        &self.trend_estimate
    }

    /// Shared covariance factor
    pub fn factor(&self) -> &Arc<CovarianceFactor<F>> {
        &self.factor
    }

    /// Kind of covariance factorization used
    pub fn kind(&self) -> FactorizationKind {
        self.factor.kind()
    }

    /// Log-likelihood `-1/2 (|L^-1.(Y - F.beta)|^2 + log(det(C)) + m log(2 pi))`
    pub fn log_likelihood(&self) -> F {
        self.log_likelihood
    }

    /// Amplitude factor estimate `|L^-1.(Y - F.beta)|^2 / m`
    ///
    /// It is the maximum likelihood estimate of a factor scaling the whole covariance matrix.
    pub fn amplitude_estimate(&self) -> F {
        let r = self.trend_estimate.whitened_residual();
        r.fold(F::zero(), |acc, v| acc + *v * *v) / F::cast(r.len())
    }

    /// Log-likelihood where the covariance scaling factor is profiled out:
    /// `-1/2 (m log(sigma2) + log(det(C)) + m (1 + log(2 pi)))`
    pub fn reduced_log_likelihood(&self) -> F {
        let m = F::cast(self.trend_estimate.whitened_residual().len());
        let sigma2 = self.amplitude_estimate();
        -F::cast(0.5)
            * (m * sigma2.ln()
                + self.factor.log_determinant()
                + m * (F::one() + F::cast(2. * std::f64::consts::PI).ln()))
    }
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>, GpError> for GpValidParams<F, C, T>
{
    type Object = FitterResult<F, C, T>;

    /// Fit GP for the given covariance model on a dataset with
    /// (n, nx) records and (n, output_dim) targets
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    ) -> Result<Self::Object> {
        self.fit_samples(dataset.records(), dataset.targets())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use crate::parameters::{FactorizationMethod, FactorizationParams, GpParams, HMatrixParams};
    use crate::trend_models::*;
    use approx::assert_abs_diff_eq;
    use linfa::prelude::{Dataset, ParamGuard};
    use ndarray::{array, Array, Axis};
    use paste::paste;

    fn quadratic_data() -> (Array2<f64>, Array2<f64>) {
        let x = array![[0.], [1.], [2.], [3.], [4.]];
        let y = x.mapv(|v| v * v);
        (x, y)
    }

    #[test]
    fn test_fit_quadratic_trend() {
        let (x, y) = quadratic_data();
        let cov = StationaryCovariance::new(SquaredExponentialKernel(), 1).with_nugget(1e-8);
        let fitted = GpParams::new(cov, QuadraticTrend())
            .fit(&Dataset::new(x, y))
            .expect("GP fitted");
        assert_abs_diff_eq!(array![0., 0., 1.], fitted.beta().view(), epsilon = 1e-6);
        assert_eq!(FactorizationKind::Cholesky, fitted.kind());
        assert_abs_diff_eq!(0., fitted.amplitude_estimate(), epsilon = 1e-6);
    }

    #[test]
    fn test_log_likelihood_formula() {
        // with zero trend and unit amplitude white noise, C = I
        let x: Array2<f64> = array![[0.], [1.], [2.]];
        let y: Array2<f64> = array![[1.], [-1.], [2.]];
        let fitted = GpParams::new(DiracCovariance::new(1, array![1.]), ZeroTrend())
            .check()
            .expect("valid")
            .fit_samples(&x, &y)
            .expect("GP fitted");
        let expected = -0.5 * (6. + 3. * (2. * std::f64::consts::PI).ln());
        assert_abs_diff_eq!(expected, fitted.log_likelihood(), epsilon = 1e-12);
        assert_abs_diff_eq!(2., fitted.amplitude_estimate(), epsilon = 1e-12);
        let reduced = -0.5 * (3. * 2f64.ln() + 3. * (1. + (2. * std::f64::consts::PI).ln()));
        assert_abs_diff_eq!(reduced, fitted.reduced_log_likelihood(), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_samples() {
        let fitter = Kriging::<f64>::params(1).check().expect("valid");
        let res = fitter.fit_samples(&Array2::<f64>::zeros((0, 1)), &Array2::<f64>::zeros((0, 1)));
        assert!(matches!(res, Err(GpError::EmptySample(_))));
        let res = fitter.fit_samples(&array![[0.], [1.]], &array![[0.]]);
        assert!(matches!(res, Err(GpError::DimensionMismatch(_))));
        let res = fitter.fit_samples(&array![[0., 1.]], &array![[0.]]);
        assert!(matches!(res, Err(GpError::DimensionMismatch(_))));
        let res = fitter.fit_samples(&array![[0.]], &array![[0., 1.]]);
        assert!(matches!(res, Err(GpError::DimensionMismatch(_))));
    }

    /// Basis announcing two functions but evaluating only one
    #[derive(Clone)]
    struct MisreportedBasis();

    impl std::fmt::Display for MisreportedBasis {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "MisreportedBasis")
        }
    }

    impl TrendBasis<f64> for MisreportedBasis {
        fn size(&self, _input_dim: usize) -> usize {
            2
        }

        fn value(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
            Array2::ones((x.nrows(), 1))
        }
    }

    #[test]
    fn test_trend_basis_checked_before_factorization() {
        // duplicate points without nugget would fail the factorization
        let x: Array2<f64> = array![[0.], [1.], [1.], [2.]];
        let y: Array2<f64> = array![[0.], [1.], [1.], [4.]];
        let res = GpParams::new(
            StationaryCovariance::<f64, _>::new(SquaredExponentialKernel(), 1),
            MisreportedBasis(),
        )
        .check()
        .expect("valid")
        .fit_samples(&x, &y);
        assert!(matches!(res, Err(GpError::DimensionMismatch(_))));
    }

    #[test]
    fn test_duplicate_points_fail() {
        let x = array![[0.], [1.], [1.], [2.]];
        let y = array![[0.], [1.], [1.], [4.]];
        let res = Kriging::<f64>::params(1).fit(&Dataset::new(x, y));
        match res {
            Err(GpError::NonPositiveDefinite { pivot, .. }) => assert_eq!(2, pivot),
            _ => panic!("expected non positive definite covariance"),
        }
    }

    #[test]
    fn test_multi_output_fit() {
        let x: Array2<f64> = Array::linspace(0., 4., 6).insert_axis(Axis(1));
        let y = ndarray::concatenate![Axis(1), x.mapv(f64::sin), x.mapv(|v| 2. + v.cos())];
        let cov = StationaryCovariance::new(Matern52Kernel(), 1)
            .with_amplitude(array![1., 0.5])
            .with_output_correlation(array![[1., 0.2], [0.2, 1.]])
            .with_nugget(1e-10);
        let fitted = GpParams::new(cov, ConstantTrend())
            .fit(&Dataset::new(x, y))
            .expect("GP fitted");
        assert_eq!(2, fitted.beta().len());
        assert_eq!((12, 2), fitted.design().dim());
        assert!(fitted.log_likelihood().is_finite());
    }

    macro_rules! test_fit_kernel {
        ($kernel:ident, $method:ident) => {
            paste! {
                #[test]
                fn [<test_fit_ $kernel:snake _ $method:snake>]() {
                    let x: Array2<f64> = Array::linspace(0., 10., 40).insert_axis(Axis(1));
                    let y = x.mapv(|v| v.sin() + 0.1 * v);
                    let cov = StationaryCovariance::new([<$kernel Kernel>](), 1)
                        .with_scale(array![1.5])
                        .with_nugget(1e-4);
                    let params = GpParams::new(cov, LinearTrend());
                    let exact = params
                        .clone()
                        .fit(&Dataset::new(x.clone(), y.clone()))
                        .expect("GP fitted");
                    let factorization = FactorizationParams::default()
                        .method(FactorizationMethod::$method)
                        .hmat(
                            HMatrixParams::default()
                                .leaf_size(8)
                                .assembly_epsilon(1e-12)
                                .recompression_epsilon(1e-12),
                        );
                    let other = params
                        .factorization(factorization)
                        .fit(&Dataset::new(x, y))
                        .expect("GP fitted");
                    assert_abs_diff_eq!(exact.beta(), other.beta(), epsilon = 1e-4);
                    assert_abs_diff_eq!(
                        exact.log_likelihood(),
                        other.log_likelihood(),
                        epsilon = 1e-3
                    );
                }
            }
        };
    }

    test_fit_kernel!(SquaredExponential, Cholesky);
    test_fit_kernel!(SquaredExponential, Hierarchical);
    test_fit_kernel!(AbsoluteExponential, Hierarchical);
    test_fit_kernel!(Matern32, Hierarchical);
    test_fit_kernel!(Matern52, Hierarchical);
}
