use crate::covariance_models::CovarianceModel;
use crate::errors::{GpError, Result};
use crate::trend_models::TrendBasis;
use linfa::{Float, ParamGuard};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Selection of the covariance factorization algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FactorizationMethod {
    /// Exact dense Cholesky factorization
    Cholesky,
    /// Approximate hierarchical (block low-rank) factorization
    Hierarchical,
    /// Hierarchical when the matrix size `n * output_dim` exceeds `threshold`, Cholesky otherwise
    Auto {
        /// Matrix size above which hierarchical factorization is used
        threshold: usize,
    },
}

impl Default for FactorizationMethod {
    fn default() -> Self {
        FactorizationMethod::Cholesky
    }
}

/// Admissibility condition deciding which off-diagonal blocks are compressed
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Admissibility<F: Float> {
    /// Every off-diagonal block is a compression candidate
    Weak,
    /// Block of clusters `a` and `b` is a candidate when `min(diam(a), diam(b)) <= eta * dist(a, b)`
    Strong {
        /// Admissibility factor
        eta: F,
    },
}

impl<F: Float> Default for Admissibility<F> {
    fn default() -> Self {
        Admissibility::Weak
    }
}

/// Hierarchical factorization parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct HMatrixParams<F: Float> {
    /// Max number of points in a leaf cluster
    pub leaf_size: usize,
    /// Relative stopping tolerance of the adaptive cross approximation
    pub assembly_epsilon: F,
    /// Relative truncation tolerance on singular values when recompressing
    pub recompression_epsilon: F,
    /// Max rank of a compressed block
    pub max_rank: usize,
    /// Admissibility condition
    pub admissibility: Admissibility<F>,
}

impl<F: Float> Default for HMatrixParams<F> {
    fn default() -> Self {
        HMatrixParams {
            leaf_size: 64,
            assembly_epsilon: F::cast(1e-8),
            recompression_epsilon: F::cast(1e-8),
            max_rank: 100,
            admissibility: Admissibility::Weak,
        }
    }
}

impl<F: Float> HMatrixParams<F> {
    /// Set leaf size
    pub fn leaf_size(mut self, leaf_size: usize) -> Self {
        self.leaf_size = leaf_size;
        self
    }

    /// Set assembly (ACA) tolerance
    pub fn assembly_epsilon(mut self, epsilon: F) -> Self {
        self.assembly_epsilon = epsilon;
        self
    }

    /// Set recompression tolerance
    pub fn recompression_epsilon(mut self, epsilon: F) -> Self {
        self.recompression_epsilon = epsilon;
        self
    }

    /// Set max rank of compressed blocks
    pub fn max_rank(mut self, max_rank: usize) -> Self {
        self.max_rank = max_rank;
        self
    }

    /// Set admissibility condition
    pub fn admissibility(mut self, admissibility: Admissibility<F>) -> Self {
        self.admissibility = admissibility;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.leaf_size == 0 {
            return Err(GpError::InvalidValueError(
                "`leaf_size` should be positive".to_string(),
            ));
        }
        if self.max_rank == 0 {
            return Err(GpError::InvalidValueError(
                "`max_rank` should be positive".to_string(),
            ));
        }
        check_tolerance("assembly_epsilon", self.assembly_epsilon)?;
        check_tolerance("recompression_epsilon", self.recompression_epsilon)?;
        if let Admissibility::Strong { eta } = self.admissibility {
            if !(eta > F::zero()) || !eta.is_finite() {
                return Err(GpError::InvalidValueError(format!(
                    "Admissibility factor should be positive, got {eta}"
                )));
            }
        }
        Ok(())
    }
}

/// Covariance factorization parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FactorizationParams<F: Float> {
    /// Factorization algorithm
    pub method: FactorizationMethod,
    /// Value added to the diagonal before factorizing
    pub jitter: F,
    /// A pivot not greater than `pivot_tolerance * max(diag)` is a failure
    pub pivot_tolerance: F,
    /// Hierarchical factorization parameters
    pub hmat: HMatrixParams<F>,
}

impl<F: Float> Default for FactorizationParams<F> {
    fn default() -> Self {
        FactorizationParams {
            method: FactorizationMethod::default(),
            jitter: F::zero(),
            pivot_tolerance: F::cast(100.) * F::epsilon(),
            hmat: HMatrixParams::default(),
        }
    }
}

impl<F: Float> FactorizationParams<F> {
    /// Set factorization method
    pub fn method(mut self, method: FactorizationMethod) -> Self {
        self.method = method;
        self
    }

    /// Set diagonal jitter
    pub fn jitter(mut self, jitter: F) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set pivot tolerance
    pub fn pivot_tolerance(mut self, pivot_tolerance: F) -> Self {
        self.pivot_tolerance = pivot_tolerance;
        self
    }

    /// Set hierarchical factorization parameters
    pub fn hmat(mut self, hmat: HMatrixParams<F>) -> Self {
        self.hmat = hmat;
        self
    }

    /// Check parameters consistency
    pub fn validate(&self) -> Result<()> {
        check_tolerance("jitter", self.jitter)?;
        check_tolerance("pivot_tolerance", self.pivot_tolerance)?;
        self.hmat.validate()
    }
}

/// Conditional queries parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ConditionalParams<F: Float> {
    /// Eigenvalues of a conditional covariance below
    /// `-psd_tolerance * max(1, max |eigenvalue|)` make it degenerate
    pub psd_tolerance: F,
    /// Whether conditional covariances account for the trend coefficients estimation
    pub trend_uncertainty: bool,
}

impl<F: Float> Default for ConditionalParams<F> {
    fn default() -> Self {
        ConditionalParams {
            psd_tolerance: F::cast(1e-8),
            trend_uncertainty: false,
        }
    }
}

impl<F: Float> ConditionalParams<F> {
    /// Set degeneracy tolerance
    pub fn psd_tolerance(mut self, psd_tolerance: F) -> Self {
        self.psd_tolerance = psd_tolerance;
        self
    }

    /// Enable or disable the trend estimation term of conditional covariances
    pub fn trend_uncertainty(mut self, trend_uncertainty: bool) -> Self {
        self.trend_uncertainty = trend_uncertainty;
        self
    }

    /// Check parameters consistency
    pub fn validate(&self) -> Result<()> {
        check_tolerance("psd_tolerance", self.psd_tolerance)
    }
}

fn check_tolerance<F: Float>(name: &str, value: F) -> Result<()> {
    if !(value >= F::zero()) || !value.is_finite() {
        return Err(GpError::InvalidValueError(format!(
            "`{name}` should be finite and non negative, got {value}"
        )));
    }
    Ok(())
}

/// A set of validated GP parameters.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, C: Serialize, T: Serialize",
        deserialize = "F: Deserialize<'de>, C: Deserialize<'de>, T: Deserialize<'de>"
    ))
)]
pub struct GpValidParams<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    /// Covariance model of the stochastic part
    pub(crate) covariance: C,
    /// Trend basis of the deterministic part
    pub(crate) trend: T,
    /// Covariance factorization parameters
    pub(crate) factorization: FactorizationParams<F>,
    /// Relative tolerance on the diagonal of the whitened design QR factor
    pub(crate) rank_tolerance: F,
    /// Parameters handed to conditional queries
    pub(crate) conditional: ConditionalParams<F>,
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> GpValidParams<F, C, T> {
    /// Default relative tolerance for trend rank deficiency
    pub const DEFAULT_RANK_TOLERANCE: f64 = 1e-10;

    /// Get covariance model
    pub fn covariance(&self) -> &C {
        &self.covariance
    }

    /// Get trend basis
    pub fn trend(&self) -> &T {
        &self.trend
    }

    /// Get factorization parameters
    pub fn factorization(&self) -> &FactorizationParams<F> {
        &self.factorization
    }

    /// Get trend rank tolerance
    pub fn rank_tolerance(&self) -> F {
        self.rank_tolerance
    }

    /// Get conditional queries parameters
    pub fn conditional(&self) -> &ConditionalParams<F> {
        &self.conditional
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified for fitting a
/// [Gaussian process](crate::GaussianProcessFitter).
pub struct GpParams<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>>(GpValidParams<F, C, T>);

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> GpParams<F, C, T> {
    /// A constructor for GP parameters given covariance model and trend basis
    pub fn new(covariance: C, trend: T) -> GpParams<F, C, T> {
        Self(GpValidParams {
            covariance,
            trend,
            factorization: FactorizationParams::default(),
            rank_tolerance: F::cast(GpValidParams::<F, C, T>::DEFAULT_RANK_TOLERANCE),
            conditional: ConditionalParams::default(),
        })
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams<F, C, T>) -> Self {
        Self(params.clone())
    }

    /// Set covariance model.
    pub fn covariance(mut self, covariance: C) -> Self {
        self.0.covariance = covariance;
        self
    }

    /// Set trend basis.
    pub fn trend(mut self, trend: T) -> Self {
        self.0.trend = trend;
        self
    }

    /// Set factorization parameters.
    pub fn factorization(mut self, factorization: FactorizationParams<F>) -> Self {
        self.0.factorization = factorization;
        self
    }

    /// Set factorization method, a shortcut to update factorization parameters.
    pub fn factorization_method(mut self, method: FactorizationMethod) -> Self {
        self.0.factorization.method = method;
        self
    }

    /// Set relative tolerance used to detect a rank deficient trend design
    pub fn rank_tolerance(mut self, rank_tolerance: F) -> Self {
        self.0.rank_tolerance = rank_tolerance;
        self
    }

    /// Set parameters of conditional queries
    pub fn conditional(mut self, conditional: ConditionalParams<F>) -> Self {
        self.0.conditional = conditional;
        self
    }
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> From<GpValidParams<F, C, T>>
    for GpParams<F, C, T>
{
    fn from(valid: GpValidParams<F, C, T>) -> Self {
        GpParams(valid)
    }
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> ParamGuard for GpParams<F, C, T> {
    type Checked = GpValidParams<F, C, T>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.covariance.validate()?;
        self.0.factorization.validate()?;
        self.0.conditional.validate()?;
        check_tolerance("rank_tolerance", self.0.rank_tolerance)?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance_models::{SquaredExponentialKernel, StationaryCovariance};
    use crate::trend_models::ConstantTrend;
    use ndarray::array;

    #[test]
    fn test_default_params() {
        let params = GpParams::<f64, _, _>::new(
            StationaryCovariance::new(SquaredExponentialKernel(), 2),
            ConstantTrend(),
        )
        .check()
        .expect("valid params");
        assert_eq!(FactorizationMethod::Cholesky, params.factorization().method);
        assert_eq!(0., params.factorization().jitter);
        assert_eq!(1e-10, params.rank_tolerance());
        assert!(!params.conditional().trend_uncertainty);
    }

    #[test]
    fn test_invalid_params() {
        let cov = StationaryCovariance::<f64, _>::new(SquaredExponentialKernel(), 1);
        let res = GpParams::new(cov.clone(), ConstantTrend())
            .factorization(FactorizationParams::default().hmat(HMatrixParams::default().leaf_size(0)))
            .check();
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));

        let res = GpParams::new(cov.clone(), ConstantTrend())
            .rank_tolerance(-1.)
            .check();
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));

        let res = GpParams::new(cov.clone(), ConstantTrend())
            .factorization(FactorizationParams::default().hmat(
                HMatrixParams::default().admissibility(Admissibility::Strong { eta: 0. }),
            ))
            .check();
        assert!(res.is_err());

        let res = GpParams::new(cov.with_scale(array![0.]), ConstantTrend()).check();
        assert!(res.is_err());
    }
}
