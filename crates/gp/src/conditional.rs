//! Posterior queries on a fitted Gaussian process.
//!
//! Given the cross covariance `K*` between query points and observations, the posterior
//! mean is `T* + K*.rho` and the posterior covariance is `K** - V^T.V` where
//! `V = L^-1.K*^T` is obtained by triangular solves against the cached factor.
//! Neither `C^-1` nor a new factorization is ever computed.

use crate::covariance_models::CovarianceModel;
use crate::errors::{GpError, Result};
use crate::parameters::ConditionalParams;
use crate::regression::RegressionResult;
use crate::trend_models::TrendBasis;
use crate::utils::{block_design, symmetrize, unflatten_output};
use linfa::Float;
use linfa_linalg::eigh::*;
use log::{debug, warn};
use ndarray::{s, Array1, Array2, Array3, ArrayBase, Axis, Data, Ix2, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Answers posterior queries at new points given a [`RegressionResult`].
///
/// The engine only borrows the result, so any number of engines can query the same
/// result concurrently.
#[derive(Clone, Debug)]
pub struct ConditionalCovarianceEngine<'a, F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    regression: &'a RegressionResult<F, C, T>,
    params: ConditionalParams<F>,
}

/// Whitened quantities shared by covariance queries
struct Reduction<F: Float> {
    /// `L^-1.K*^T` (m, k * d)
    v: Array2<F>,
    /// `G^-T.(Phi^T.V - F*^T)` (p * d, k * d) when the trend uncertainty is requested
    u: Option<Array2<F>>,
}

impl<'a, F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> ConditionalCovarianceEngine<'a, F, C, T> {
    /// Engine using the conditional parameters the result was fitted with
    pub fn new(regression: &'a RegressionResult<F, C, T>) -> Self {
        ConditionalCovarianceEngine {
            regression,
            params: regression.params().conditional().clone(),
        }
    }

    /// Override conditional parameters
    pub fn with_params(mut self, params: ConditionalParams<F>) -> Result<Self> {
        params.validate()?;
        self.params = params;
        Ok(self)
    }

    /// Queried regression result
    pub fn regression(&self) -> &RegressionResult<F, C, T> {
        self.regression
    }

    /// Conditional parameters in use
    pub fn params(&self) -> &ConditionalParams<F> {
        &self.params
    }

    /// Conditional mean (k, output_dim) at `x` (k, input_dim) points
    pub fn conditional_mean(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_points(x)?;
        let kstar = self.cross_covariance(x);
        Ok(self.mean_from_cross(x, &kstar))
    }

    /// Conditional covariance matrix (k * output_dim, k * output_dim) at `x` (k, input_dim)
    /// points where row `i * output_dim + j` is the `j`th output at the `i`th point.
    ///
    /// The result is symmetric and its negative diagonal entries coming from rounding
    /// are clamped to zero.
    pub fn conditional_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        self.check_points(x)?;
        let kstar = self.cross_covariance(x);
        let reduction = self.reduction(x, &kstar)?;
        let mut cov = self.regression.covariance().discretize(x) - reduction.v.t().dot(&reduction.v);
        if let Some(u) = &reduction.u {
            cov += &u.t().dot(u);
        }
        symmetrize(&mut cov);
        let clamped = clamp_diagonal(cov.diag_mut());
        if clamped > 0 {
            warn!("Conditional covariance: {clamped} negative diagonal entries clamped to zero");
        }
        Ok(cov)
    }

    /// Conditional variances (k, output_dim) at `x` (k, input_dim) points.
    ///
    /// Only diagonal entries are computed: no (k, k) block is ever assembled.
    pub fn conditional_variance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        self.check_points(x)?;
        let kstar = self.cross_covariance(x);
        self.variance_from_cross(x, &kstar)
    }

    /// Conditional covariance blocks (k, output_dim, output_dim) of the output components
    /// at each of the `x` (k, input_dim) points, ignoring covariances between points.
    pub fn conditional_marginal_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array3<F>> {
        self.check_points(x)?;
        let d = self.regression.covariance().output_dim();
        let kstar = self.cross_covariance(x);
        let reduction = self.reduction(x, &kstar)?;
        let mut blocks = Array3::zeros((x.nrows(), d, d));
        let mut clamped = 0;
        for (i, mut block) in blocks.outer_iter_mut().enumerate() {
            let vi = reduction.v.slice(s![.., i * d..(i + 1) * d]);
            let mut b = self.regression.covariance().point_covariance(&x.row(i)) - vi.t().dot(&vi);
            if let Some(u) = &reduction.u {
                let ui = u.slice(s![.., i * d..(i + 1) * d]);
                b += &ui.t().dot(&ui);
            }
            symmetrize(&mut b);
            clamped += clamp_diagonal(b.diag_mut());
            block.assign(&b);
        }
        if clamped > 0 {
            warn!("Conditional marginal covariance: {clamped} negative variances clamped to zero");
        }
        Ok(blocks)
    }

    /// Conditional mean and variances, both (k, output_dim), at `x` (k, input_dim) points
    /// sharing a single cross covariance evaluation.
    pub fn conditional_mean_and_variance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array2<F>, Array2<F>)> {
        self.check_points(x)?;
        let kstar = self.cross_covariance(x);
        let mean = self.mean_from_cross(x, &kstar);
        let variance = self.variance_from_cross(x, &kstar)?;
        Ok((mean, variance))
    }

    /// Joint normal distribution of the process values at `x` (k, input_dim) points.
    ///
    /// Fails with [`GpError::DegenerateCovariance`] when an eigenvalue of the conditional
    /// covariance is below `-psd_tolerance * max(1, max|eigenvalue|)`.
    pub fn conditional_distribution(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<MultivariateNormal<F>> {
        let mean = self.conditional_mean(x)?;
        let covariance = self.conditional_covariance(x)?;
        MultivariateNormal::new(
            mean.iter().cloned().collect(),
            covariance,
            self.params.psd_tolerance,
        )
    }

    fn check_points(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        let nx = self.regression.covariance().input_dim();
        if x.ncols() != nx {
            return Err(GpError::DimensionMismatch(format!(
                "Query points have dimension {}, process input dimension is {nx}",
                x.ncols()
            )));
        }
        Ok(())
    }

    /// `K*` (k * d, n * d)
    fn cross_covariance(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        self.regression
            .covariance()
            .cross_covariance(x, self.regression.input())
    }

    /// Block design `F*` (k * d, p * d) at query points
    fn design(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let d = self.regression.covariance().output_dim();
        block_design(&self.regression.trend().value(x), d)
    }

    fn mean_from_cross(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>, kstar: &Array2<F>) -> Array2<F> {
        let d = self.regression.covariance().output_dim();
        let mean = self.design(x).dot(self.regression.beta()) + kstar.dot(self.regression.rho());
        unflatten_output(&mean, d)
    }

    fn reduction(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        kstar: &Array2<F>,
    ) -> Result<Reduction<F>> {
        let v = self.regression.factor().solve_lower(&kstar.t())?;
        let u = if self.params.trend_uncertainty && !self.regression.beta().is_empty() {
            let estimate = self.regression.trend_estimate();
            let w = estimate.phi().t().dot(&v) - self.design(x).t();
            Some(estimate.solve_g_transpose(&w)?)
        } else {
            None
        };
        debug!(
            "Conditional reduction on {} query rows with trend uncertainty {}",
            v.ncols(),
            u.is_some()
        );
        Ok(Reduction { v, u })
    }

    fn variance_from_cross(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        kstar: &Array2<F>,
    ) -> Result<Array2<F>> {
        let d = self.regression.covariance().output_dim();
        let reduction = self.reduction(x, kstar)?;
        let mut variance = Array1::zeros(x.nrows() * d);
        Zip::from(&mut variance)
            .and(reduction.v.columns())
            .for_each(|var, v| *var = -v.dot(&v));
        if let Some(u) = &reduction.u {
            Zip::from(&mut variance)
                .and(u.columns())
                .for_each(|var, u| *var += u.dot(&u));
        }
        let covariance = self.regression.covariance();
        for (i, xi) in x.rows().into_iter().enumerate() {
            let prior = covariance.point_covariance(&xi);
            for k in 0..d {
                variance[i * d + k] += prior[[k, k]];
            }
        }
        let clamped = clamp_diagonal(variance.view_mut());
        if clamped > 0 {
            warn!("Conditional variance: {clamped} negative values clamped to zero");
        }
        Ok(unflatten_output(&variance, d))
    }
}

/// Replace negative entries by zero, returning how many were replaced
fn clamp_diagonal<F: Float>(mut diag: ndarray::ArrayViewMut1<F>) -> usize {
    let mut count = 0;
    diag.iter_mut().filter(|v| **v < F::zero()).for_each(|v| {
        *v = F::zero();
        count += 1;
    });
    count
}

/// Multivariate normal distribution of the process values at a set of points
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct MultivariateNormal<F: Float> {
    mean: Array1<F>,
    covariance: Array2<F>,
    /// `W.diag(sqrt(lambda))` from the eigen decomposition of the covariance
    root: Array2<F>,
}

impl<F: Float> MultivariateNormal<F> {
    /// Build the distribution, checking `covariance` is positive semi-definite: eigenvalues
    /// below `-tolerance * max(1, max|eigenvalue|)` are rejected, remaining negative ones
    /// are treated as zero.
    pub fn new(mean: Array1<F>, covariance: Array2<F>, tolerance: F) -> Result<Self> {
        if covariance.dim() != (mean.len(), mean.len()) {
            return Err(GpError::DimensionMismatch(format!(
                "Covariance of shape {:?} given for a mean of size {}",
                covariance.dim(),
                mean.len()
            )));
        }
        if mean.is_empty() {
            return Ok(MultivariateNormal {
                mean,
                covariance,
                root: Array2::zeros((0, 0)),
            });
        }
        let (values, vectors) = covariance.to_owned().eigh_into()?;
        let largest = values.iter().fold(F::one(), |acc, v| acc.max(v.abs()));
        let threshold = tolerance * largest;
        if let Some(lowest) = values
            .iter()
            .cloned()
            .reduce(|acc, v| if v < acc { v } else { acc })
        {
            if lowest < -threshold {
                return Err(GpError::DegenerateCovariance {
                    eigenvalue: lowest.to_f64().unwrap_or(f64::NAN),
                    tolerance: threshold.to_f64().unwrap_or(f64::NAN),
                });
            }
        }
        let sqrt_values = values.mapv(|v| if v > F::zero() { v.sqrt() } else { F::zero() });
        let root = &vectors * &sqrt_values.insert_axis(Axis(0));
        Ok(MultivariateNormal {
            mean,
            covariance,
            root,
        })
    }

    /// Mean vector (k * output_dim,)
    pub fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    /// Covariance matrix (k * output_dim, k * output_dim)
    pub fn covariance(&self) -> &Array2<F> {
        &self.covariance
    }

    /// Dimension of the distribution
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Draw `n` realizations (n, dim) using `rng`
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<F> {
        let z = Array2::<f64>::random_using((self.dim(), n), StandardNormal, rng).mapv(|v| F::cast(v));
        let trajectories = self.root.dot(&z).t().to_owned();
        trajectories + &self.mean.view().insert_axis(Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::*;
    use crate::parameters::GpParams;
    use crate::regression::GaussianProcessRegression;
    use crate::trend_models::*;
    use approx::assert_abs_diff_eq;
    use linfa::ParamGuard;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;

    type Se = StationaryCovariance<f64, SquaredExponentialKernel>;

    fn sin_regression(trend_uncertainty: bool) -> RegressionResult<f64, Se, LinearTrend> {
        let xt = array![[0.0], [1.0], [2.0], [3.5], [5.0], [6.0]];
        let yt = xt.mapv(|v: f64| v.sin() + 0.5 * v);
        let params = GpParams::new(
            StationaryCovariance::new(SquaredExponentialKernel(), 1)
                .with_scale(array![1.5])
                .with_amplitude(array![2.])
                .with_nugget(1e-10),
            LinearTrend(),
        )
        .conditional(ConditionalParams::default().trend_uncertainty(trend_uncertainty))
        .check()
        .expect("valid params");
        GaussianProcessRegression::from_samples(&params, &xt, &yt)
            .expect("fitted")
            .run()
            .expect("regression")
    }

    #[test]
    fn test_interpolation() {
        let res = sin_regression(false);
        let engine = res.conditional();
        let mean = engine.conditional_mean(res.input()).expect("mean");
        assert_abs_diff_eq!(res.output(), &mean, epsilon = 1e-6);
        let var = engine.conditional_variance(res.input()).expect("variance");
        assert_abs_diff_eq!(Array2::<f64>::zeros((6, 1)), var, epsilon = 1e-6);
    }

    #[test]
    fn test_variance_is_covariance_diagonal() {
        for trend_uncertainty in [false, true] {
            let res = sin_regression(trend_uncertainty);
            let engine = res.conditional();
            let x = Array::linspace(-1., 7., 17).insert_axis(Axis(1));
            let cov = engine.conditional_covariance(&x).expect("covariance");
            let var = engine.conditional_variance(&x).expect("variance");
            assert_abs_diff_eq!(cov.diag(), var.column(0), epsilon = 1e-10);
            let marginal = engine.conditional_marginal_covariance(&x).expect("marginal");
            let first_column = marginal.index_axis(Axis(2), 0);
            assert_abs_diff_eq!(first_column.column(0), var.column(0), epsilon = 1e-10);
            let (mean, var2) = engine.conditional_mean_and_variance(&x).expect("both");
            assert_eq!(var, var2);
            assert_eq!(engine.conditional_mean(&x).expect("mean"), mean);
        }
    }

    #[test]
    fn test_trend_uncertainty_increases_variance() {
        let x = Array::linspace(-3., 9., 25).insert_axis(Axis(1));
        let var = sin_regression(false)
            .conditional()
            .conditional_variance(&x)
            .expect("variance");
        let var_trend = sin_regression(true)
            .conditional()
            .conditional_variance(&x)
            .expect("variance");
        Zip::from(&var).and(&var_trend).for_each(|v, vt| assert!(*vt >= *v - 1e-12));
        // far from data the extrapolated trend is uncertain
        assert!(var_trend[[0, 0]] > var[[0, 0]]);
    }

    #[test]
    fn test_symmetric_covariance() {
        let res = sin_regression(false);
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((30, 1), Uniform::new(-2., 8.), &mut rng);
        let cov = res.conditional().conditional_covariance(&x).expect("covariance");
        assert_eq!(cov, cov.t());
        assert!(cov.diag().iter().all(|v| *v >= 0.));
    }

    #[test]
    fn test_bad_query() {
        let res = sin_regression(false);
        let engine = res.conditional();
        assert!(matches!(
            engine.conditional_mean(&Array2::zeros((3, 2))),
            Err(GpError::DimensionMismatch(_))
        ));
        assert!(matches!(
            engine.conditional_covariance(&Array2::zeros((3, 2))),
            Err(GpError::DimensionMismatch(_))
        ));
        let empty = Array2::<f64>::zeros((0, 1));
        assert_eq!((0, 1), engine.conditional_mean(&empty).expect("empty").dim());
        assert_eq!((0, 0), engine.conditional_covariance(&empty).expect("empty").dim());
        assert_eq!(0, engine.conditional_distribution(&empty).expect("empty").dim());
    }

    #[test]
    fn test_distribution_and_sampling() {
        let res = sin_regression(false);
        let x = Array::linspace(0., 6., 7).insert_axis(Axis(1));
        let mvn = res
            .conditional()
            .conditional_distribution(&x)
            .expect("distribution");
        assert_eq!(7, mvn.dim());
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let samples = mvn.sample(2000, &mut rng);
        assert_eq!((2000, 7), samples.dim());
        let mean = samples.mean_axis(Axis(0)).expect("mean");
        assert_abs_diff_eq!(mvn.mean(), &mean, epsilon = 0.1);
        // x = 0, 1, 2, 5, 6 are training points
        assert_abs_diff_eq!(samples[[0, 0]], mvn.mean()[0], epsilon = 1e-3);
    }

    #[test]
    fn test_clamp_diagonal() {
        let mut cov = array![[-1e-14, 0.3, 0.], [0.3, 2., 0.1], [0., 0.1, -0.5]];
        assert_eq!(2, clamp_diagonal(cov.diag_mut()));
        assert_eq!(array![0., 2., 0.], cov.diag());
        // off diagonal entries are left untouched
        assert_eq!(0.3, cov[[0, 1]]);
        assert_eq!(0, clamp_diagonal(cov.diag_mut()));
    }

    #[test]
    fn test_variances_at_training_points_never_negative() {
        let xt: Array2<f64> = array![[0.0], [0.4], [1.0], [1.3], [2.0], [2.2], [3.0]];
        let yt = xt.mapv(|v| (2. * v).cos());
        let params = GpParams::new(
            StationaryCovariance::new(SquaredExponentialKernel(), 1).with_scale(array![0.5]),
            ConstantTrend(),
        )
        .conditional(ConditionalParams::default().trend_uncertainty(true))
        .check()
        .expect("valid params");
        let res = GaussianProcessRegression::from_samples(&params, &xt, &yt)
            .expect("fitted")
            .run()
            .expect("regression");
        let engine = res.conditional();
        let indices: Vec<usize> = (0..70).map(|i| i % 7).collect();
        let x = xt.select(Axis(0), &indices);

        let var = engine.conditional_variance(&x).expect("variance");
        assert!(var.iter().all(|v| *v >= 0. && *v < 1e-6), "{var}");
        let cov = engine.conditional_covariance(&x).expect("covariance");
        assert!(cov.diag().iter().all(|v| *v >= 0. && *v < 1e-6));
        let blocks = engine.conditional_marginal_covariance(&x).expect("marginal");
        assert!(blocks.iter().all(|v| *v >= 0. && *v < 1e-6));
    }

    #[test]
    fn test_degenerate_covariance() {
        let cov: Array2<f64> = array![[1., 0.], [0., -0.5]];
        let res = MultivariateNormal::new(Array1::zeros(2), cov, 1e-8);
        assert!(matches!(res, Err(GpError::DegenerateCovariance { .. })));
        let cov: Array2<f64> = array![[1., 1.], [1., 1.]];
        let mvn = MultivariateNormal::new(array![1., 2.], cov, 1e-8).expect("psd");
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let s = mvn.sample(5, &mut rng);
        // fully correlated components
        assert_abs_diff_eq!(&s.column(0) + 1., s.column(1), epsilon = 1e-10);
    }
}
