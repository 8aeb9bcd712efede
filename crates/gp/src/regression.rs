use crate::algorithm::FitterResult;
use crate::conditional::ConditionalCovarianceEngine;
use crate::covariance_models::CovarianceModel;
use crate::errors::Result;
use crate::factorization::{CovarianceFactor, FactorizationKind};
use crate::parameters::{GpParams, GpValidParams};
use crate::trend_estimation::TrendEstimate;
use crate::trend_models::TrendBasis;
use linfa::Float;
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::sync::Arc;

#[cfg(feature = "persistent")]
use crate::errors::GpError;
#[cfg(feature = "persistent")]
use crate::factorization::factorize;
#[cfg(feature = "persistent")]
use linfa::ParamGuard;
#[cfg(feature = "persistent")]
use crate::trend_estimation::estimate_trend;
#[cfg(feature = "persistent")]
use crate::utils::{block_design, flatten_output};
#[cfg(feature = "persistent")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "persistent")]
use std::{fs, io::Write};

/// Gaussian process regression: turns a [`FitterResult`] into a [`RegressionResult`]
/// by computing the process coefficients `rho = C^-1.(Y - F.beta)`.
pub struct GaussianProcessRegression<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    fitter_result: FitterResult<F, C, T>,
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> GaussianProcessRegression<F, C, T> {
    /// Gaussian process parameters constructor
    pub fn params(covariance: C, trend: T) -> GpParams<F, C, T> {
        GpParams::new(covariance, trend)
    }

    /// Constructor from a fit result
    pub fn new(fitter_result: FitterResult<F, C, T>) -> Self {
        GaussianProcessRegression { fitter_result }
    }

    /// Constructor fitting the GP on `x` (n, nx) inputs and `y` (n, output_dim) outputs
    pub fn from_samples(
        params: &GpValidParams<F, C, T>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Self> {
        Ok(Self::new(params.fit_samples(x, y)?))
    }

    /// Compute the process coefficients and build the regression result
    pub fn run(self) -> Result<RegressionResult<F, C, T>> {
        let fitted = self.fitter_result;
        // L^-1.(Y - F.beta) is already known from the trend estimation
        let rho = fitted
            .factor
            .solve_lower_transpose_vec(fitted.trend_estimate.whitened_residual())?;
        debug!("GP regression with {} process coefficients", rho.len());
        Ok(RegressionResult {
            params: fitted.params,
            input: fitted.input,
            output: fitted.output,
            beta: fitted.trend_estimate.beta().to_owned(),
            rho,
            trend_estimate: fitted.trend_estimate,
            factor: fitted.factor,
            log_likelihood: fitted.log_likelihood,
        })
    }
}

/// Posterior description of a Gaussian process given observations.
///
/// Immutable once built: conditional queries only read it, the covariance factor is shared
/// behind an [`Arc`] so clones and concurrent queries never copy nor mutate it.
#[derive(Clone, Debug)]
pub struct RegressionResult<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    pub(crate) params: GpValidParams<F, C, T>,
    pub(crate) input: Array2<F>,
    pub(crate) output: Array2<F>,
    pub(crate) beta: Array1<F>,
    pub(crate) rho: Array1<F>,
    pub(crate) trend_estimate: TrendEstimate<F>,
    pub(crate) factor: Arc<CovarianceFactor<F>>,
    pub(crate) log_likelihood: F,
}

impl<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> RegressionResult<F, C, T> {
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

    /// Trend coefficients (p * output_dim,)
    pub fn beta(&self) -> &Array1<F> {
        &self.beta
    }

    /// Process coefficients `C^-1.(Y - F.beta)` (n * output_dim,)
    pub fn rho(&self) -> &Array1<F> {
        &self.rho
    }

    /// Generalized least squares estimation details
    pub fn trend_estimate(&self) -> &TrendEstimate<F> {
        &self.trend_estimate
    }

    /// Shared covariance factor
    pub fn factor(&self) -> &Arc<CovarianceFactor<F>> {
        &self.factor
    }

    /// Kind of covariance factorization
    pub fn kind(&self) -> FactorizationKind {
        self.factor.kind()
    }

    /// Log-likelihood of the observations
    pub fn log_likelihood(&self) -> F {
        self.log_likelihood
    }

    /// Engine answering posterior queries
    pub fn conditional(&self) -> ConditionalCovarianceEngine<'_, F, C, T> {
        ConditionalCovarianceEngine::new(self)
    }
}

/// What a saved [`RegressionResult`] keeps to restore its covariance factor
#[cfg(feature = "persistent")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactorStorage {
    /// The factor itself, loading is cheap
    Factor,
    /// The covariance matrix, loading factorizes it
    Matrix,
    /// Nothing, loading discretizes the covariance model and factorizes it
    None,
}

#[cfg(feature = "persistent")]
#[derive(Serialize, Deserialize)]
#[serde(bound(
    serialize = "F: Serialize, C: Serialize, T: Serialize",
    deserialize = "F: Deserialize<'de>, C: Deserialize<'de>, T: Deserialize<'de>"
))]
struct RegressionSnapshot<F: Float, C: CovarianceModel<F>, T: TrendBasis<F>> {
    params: GpValidParams<F, C, T>,
    input: Array2<F>,
    output: Array2<F>,
    beta: Array1<F>,
    rho: Array1<F>,
    log_likelihood: F,
    factor: Option<CovarianceFactor<F>>,
    matrix: Option<Array2<F>>,
}

#[cfg(feature = "persistent")]
impl<F, C, T> RegressionResult<F, C, T>
where
    F: Float + Serialize + for<'de> Deserialize<'de>,
    C: CovarianceModel<F> + Serialize + for<'de> Deserialize<'de>,
    T: TrendBasis<F> + Serialize + for<'de> Deserialize<'de>,
{
    /// Save the result in a json file.
    ///
    /// Trend and process coefficients are stored as is, `storage` tells what is kept
    /// to restore the covariance factor. A stored matrix is the one actually factorized,
    /// jitter included.
    pub fn save(&self, path: &str, storage: FactorStorage) -> Result<()> {
        let (factor, matrix) = match storage {
            FactorStorage::Factor => (Some(self.factor.as_ref().clone()), None),
            FactorStorage::Matrix => {
                let mut matrix = self.params.covariance.discretize(&self.input);
                let jitter = self.params.factorization.jitter;
                if jitter > F::zero() {
                    matrix.diag_mut().mapv_inplace(|v| v + jitter);
                }
                (None, Some(matrix))
            }
            FactorStorage::None => (None, None),
        };
        let snapshot = RegressionSnapshot {
            params: self.params.clone(),
            input: self.input.to_owned(),
            output: self.output.to_owned(),
            beta: self.beta.to_owned(),
            rho: self.rho.to_owned(),
            log_likelihood: self.log_likelihood,
            factor,
            matrix,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let mut file = fs::File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a result saved with [`RegressionResult::save`].
    ///
    /// When no factor was stored, the covariance matrix is factorized again with the saved
    /// factorization parameters before returning, so the loaded result always holds the
    /// factor its process coefficients were computed with.
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read(path)?;
        let snapshot: RegressionSnapshot<F, C, T> = serde_json::from_slice(&data)?;
        let RegressionSnapshot {
            params,
            input,
            output,
            beta,
            rho,
            log_likelihood,
            factor,
            matrix,
        } = snapshot;
        let params = GpParams::from(params)
            .check()
            .map_err(|err| GpError::LoadError(format!("Invalid saved parameters: {err}")))?;
        let d = params.covariance.output_dim();
        if input.nrows() != output.nrows()
            || input.ncols() != params.covariance.input_dim()
            || output.ncols() != d
            || input.nrows() * d != rho.len()
        {
            return Err(GpError::LoadError(format!(
                "Inconsistent saved result: input {:?}, output {:?}, {} process coefficients",
                input.dim(),
                output.dim(),
                rho.len()
            )));
        }
        let factor = match (factor, matrix) {
            (Some(factor), _) => factor,
            (None, Some(matrix)) => {
                // jitter is already on the stored diagonal
                let factorization = params.factorization.clone().jitter(F::zero());
                factorize(matrix, &input, d, &factorization)?
            }
            (None, None) => {
                let matrix = params.covariance.discretize(&input);
                factorize(matrix, &input, d, &params.factorization)?
            }
        };
        if factor.dim() != rho.len() {
            return Err(GpError::LoadError(format!(
                "Inconsistent saved result: factor size {} for {} process coefficients",
                factor.dim(),
                rho.len()
            )));
        }
        let design = block_design(&params.trend.value(&input), d);
        let trend_estimate =
            estimate_trend(&design, &factor, &flatten_output(&output), params.rank_tolerance)?;
        Ok(RegressionResult {
            params,
            input,
            output,
            beta,
            rho,
            trend_estimate,
            factor: Arc::new(factor),
            log_likelihood,
        })
    }
}
