//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! also known as [Kriging](https://en.wikipedia.org/wiki/Kriging), together with the conditional
//! covariance queries needed by uncertainty quantification studies.
//!
//! A model is a trend, linear combination of basis functions ([trend_models]), plus a centered
//! process described by a covariance model ([covariance_models]). Fitting estimates the trend
//! coefficients by generalized least squares and factorizes the covariance matrix of the
//! observations, either exactly (dense Cholesky) or approximately with a hierarchical
//! block low-rank factorization when the number of observations gets large.
//!
//! The fit is done in two steps:
//! * [GaussianProcessFitter] (alias of [GpValidParams]) produces a [FitterResult]
//!   holding trend coefficients, covariance factor and log-likelihood,
//! * [GaussianProcessRegression] adds the process coefficients and produces an immutable
//!   [RegressionResult] which is queried through a [ConditionalCovarianceEngine].
//!
//! ```
//! use uqbox_gp::{Kriging, GaussianProcessRegression};
//! use linfa::prelude::*;
//! use ndarray::{array, Array, Axis};
//!
//! let xt = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
//! let yt = xt.mapv(|v: f64| v * v);
//!
//! let fitted = Kriging::params(1)
//!     .fit(&Dataset::new(xt, yt))
//!     .expect("GP fitted");
//! let result = GaussianProcessRegression::new(fitted)
//!     .run()
//!     .expect("GP regression");
//!
//! let x = Array::linspace(0., 4., 9).insert_axis(Axis(1));
//! let engine = result.conditional();
//! let mean = engine.conditional_mean(&x).expect("mean");
//! let variance = engine.conditional_variance(&x).expect("variance");
//! assert!((mean[[4, 0]] - 4.).abs() < 1e-6);
//! assert!(variance[[4, 0]] < 1e-6);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod clustering;
mod conditional;
pub mod covariance_models;
mod errors;
pub mod factorization;
pub mod metrics;
mod parameters;
mod regression;
mod trend_estimation;
pub mod trend_models;
mod utils;

pub use algorithm::*;
pub use conditional::*;
pub use errors::*;
pub use factorization::{factorize, CovarianceFactor, FactorizationKind};
pub use parameters::*;
pub use regression::*;
pub use trend_estimation::*;
pub use utils::{block_design, flatten_output, unflatten_output};
