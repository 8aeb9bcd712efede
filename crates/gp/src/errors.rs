use thiserror::Error;

/// A result type for GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when fitting a [`GaussianProcessFitter`](crate::GaussianProcessFitter) or
/// querying a [`ConditionalCovarianceEngine`](crate::ConditionalCovarianceEngine)
#[derive(Error, Debug)]
pub enum GpError {
    /// When input and output samples or query points have incompatible shapes
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    /// When a sample holds no point
    #[error("Empty sample: {0}")]
    EmptySample(String),
    /// When a Cholesky pivot of the covariance matrix is not strictly positive.
    /// `pivot` is the row index in the original (unpermuted) covariance matrix.
    #[error("Covariance matrix is not positive definite: pivot {pivot} has value {value:e}")]
    NonPositiveDefinite {
        /// Row of the failing pivot
        pivot: usize,
        /// Value of the pivot before taking its square root
        value: f64,
    },
    /// When the whitened trend design has a near-zero diagonal in its QR factor
    #[error("Trend design is rank deficient: column {column} has |G_ii| = {value:e}")]
    RankDeficientTrend {
        /// Column of the whitened design matrix
        column: usize,
        /// Magnitude of the corresponding diagonal entry of G
        value: f64,
    },
    /// When a conditional covariance is not positive semi-definite after clamping
    #[error("Conditional covariance is degenerate: eigenvalue {eigenvalue:e} below -{tolerance:e}")]
    DegenerateCovariance {
        /// Smallest eigenvalue found
        eigenvalue: f64,
        /// Tolerance it was compared to
        tolerance: f64,
    },
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When saving fails
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[cfg(feature = "persistent")]
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
    /// When error during loading
    #[cfg(feature = "persistent")]
    #[error("Load error: {0}")]
    LoadError(String),
}
