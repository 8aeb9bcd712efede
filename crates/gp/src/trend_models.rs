//! A module for trend bases used to model the deterministic part of the GP model.
//! In practice small degree (<= 2) polynomial bases are used,
//! as the gaussian process is then fitted using the correlated error term.
//!
//! The following bases are implemented:
//! * zero (no trend, simple kriging),
//! * constant (ordinary kriging),
//! * linear,
//! * quadratic,
//! * user given functions.

use linfa::Float;
use ndarray::{concatenate, s, Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Ix2};
use paste::paste;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

/// A trait for trend bases used in GP regression.
///
/// A basis of `p` scalar functions is applied to each output component,
/// hence a `output_dim`-dimensional output gets `p * output_dim` trend coefficients.
pub trait TrendBasis<F: Float>: Clone + fmt::Display + Send + Sync {
    /// Number of basis functions `p` for inputs of dimension `input_dim`
    fn size(&self, input_dim: usize) -> usize;

    /// Basis functions values for the given `x` data points specified as (n, nx) matrix.
    /// Returns a (n, p) matrix.
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F>;
}

/// No trend: the GP is centered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ZeroTrend();

impl<F: Float> TrendBasis<F> for ZeroTrend {
    fn size(&self, _input_dim: usize) -> usize {
        0
    }

    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        Array2::<F>::zeros((x.nrows(), 0))
    }
}

/// A constant function as trend of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct ConstantTrend();

impl<F: Float> TrendBasis<F> for ConstantTrend {
    fn size(&self, _input_dim: usize) -> usize {
        1
    }

    /// Zero order polynomial (constant) basis.
    /// f(x) = [1, ..., 1].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        Array2::<F>::ones((x.nrows(), 1))
    }
}

/// An affine function as trend of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct LinearTrend();

impl<F: Float> TrendBasis<F> for LinearTrend {
    fn size(&self, input_dim: usize) -> usize {
        1 + input_dim
    }

    /// First order polynomial (linear) basis.
    /// f(x) = [ 1, x_1, ..., x_n ].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        concatenate![Axis(1), Array2::ones((x.nrows(), 1)), x.to_owned()]
    }
}

/// A 2-degree polynomial as trend of the GP
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct QuadraticTrend();

impl<F: Float> TrendBasis<F> for QuadraticTrend {
    fn size(&self, input_dim: usize) -> usize {
        1 + input_dim + input_dim * (input_dim + 1) / 2
    }

    /// Second order polynomial (quadratic) basis.
    /// f(x) = [ 1, { x_i, i = 1,...,n }, { x_i * x_j,  (i,j) = 1,...,n  , j >= i } ].T
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let mut res = concatenate![Axis(1), Array2::ones((x.nrows(), 1)), x.to_owned()];
        for k in 0..x.ncols() {
            let part = x.slice(s![.., k..]).to_owned() * x.slice(s![.., k..k + 1]);
            res = concatenate![Axis(1), res, part]
        }
        res
    }
}

macro_rules! declare_trend_util_impls {
    ($trend:ident) => {
        paste! {
            impl fmt::Display for [<$trend Trend>] {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}Trend", stringify!($trend))
                }
            }

            impl From<[<$trend Trend>]> for String {
                fn from(_item: [<$trend Trend>]) -> Self {
                    [<$trend Trend>]().to_string()
                }
            }

            impl TryFrom<String> for [<$trend Trend>] {
                type Error = &'static str;
                fn try_from(s: String) -> Result<Self, Self::Error> {
                    if s == stringify!([<$trend Trend>]) {
                        Ok(Self::default())
                    } else {
                        Err(concat!(
                            "Bad string value for ",
                            stringify!([<$trend Trend>]),
                            ", should be '",
                            stringify!([<$trend Trend>]),
                            "'"
                        ))
                    }
                }
            }
        }
    };
}

declare_trend_util_impls!(Zero);
declare_trend_util_impls!(Constant);
declare_trend_util_impls!(Linear);
declare_trend_util_impls!(Quadratic);

/// A scalar basis function of an input point
pub type BasisFunction<F> = Arc<dyn Fn(&ArrayView1<F>) -> F + Send + Sync>;

/// A trend basis made of user given scalar functions of the input point
#[derive(Clone)]
pub struct FunctionalBasis<F: Float> {
    functions: Vec<BasisFunction<F>>,
}

impl<F: Float> FunctionalBasis<F> {
    /// Constructor from a list of basis functions
    pub fn new(functions: Vec<BasisFunction<F>>) -> Self {
        FunctionalBasis { functions }
    }

    /// Append a basis function
    pub fn with_function(
        mut self,
        function: impl Fn(&ArrayView1<F>) -> F + Send + Sync + 'static,
    ) -> Self {
        self.functions.push(Arc::new(function));
        self
    }

    /// Evaluate basis functions at a single point (p,)
    pub fn eval_point(&self, x: &ArrayView1<F>) -> Array1<F> {
        self.functions.iter().map(|f| f(x)).collect()
    }
}

impl<F: Float> Default for FunctionalBasis<F> {
    fn default() -> Self {
        FunctionalBasis { functions: vec![] }
    }
}

impl<F: Float> fmt::Debug for FunctionalBasis<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FunctionalBasis")
            .field("size", &self.functions.len())
            .finish()
    }
}

impl<F: Float> fmt::Display for FunctionalBasis<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FunctionalBasis({} functions)", self.functions.len())
    }
}

impl<F: Float> TrendBasis<F> for FunctionalBasis<F> {
    fn size(&self, _input_dim: usize) -> usize {
        self.functions.len()
    }

    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let p = self.functions.len();
        Array2::from_shape_fn((x.nrows(), p), |(i, j)| (self.functions[j])(&x.row(i)))
    }
}
