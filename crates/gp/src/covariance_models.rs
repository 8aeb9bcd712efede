//! A module for covariance models of the stochastic part of the GP model.
//!
//! The regression engine only consumes the [`CovarianceModel`] capability: evaluating
//! the covariance between two points and discretizing it over a sample.
//! Stationary models are built from a scalar correlation [`Kernel`] evaluated on the
//! componentwise lag divided by the scale:
//! * squared exponential,
//! * absolute exponential,
//! * generalized exponential,
//! * matern 3/2,
//! * matern 5/2.
//!
//! [`DiracCovariance`] models a white noise.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2, Zip};
use paste::paste;
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// A trait for stationary scalar correlation functions `rho(h)` with `rho(0) = 1`
pub trait Kernel<F: Float>: Clone + Copy + Default + fmt::Display + Send + Sync {
    /// Correlation value given the scaled lag `h = (x - y) / scale` (nx,)
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F;

    /// Check kernel own parameters if any
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// A trait for covariance models used in GP regression.
///
/// A model maps two input points of dimension `input_dim` to a symmetric
/// `(output_dim, output_dim)` covariance matrix. Discretizing over a sample of `n` points
/// gives a `(n * output_dim, n * output_dim)` matrix where row `i * output_dim + k` is
/// the `k`th output component at the `i`th point.
pub trait CovarianceModel<F: Float>: Clone + fmt::Display + Send + Sync {
    /// Dimension of input points
    fn input_dim(&self) -> usize;

    /// Dimension of the output, i.e. size of covariance blocks
    fn output_dim(&self) -> usize;

    /// Scale hyperparameters (input_dim,)
    fn scale(&self) -> Array1<F>;

    /// Amplitude hyperparameters, i.e. standard deviations (output_dim,)
    fn amplitude(&self) -> Array1<F>;

    /// Nugget factor added on the diagonal of discretized matrices, relative to amplitude^2
    fn nugget(&self) -> F;

    /// Covariance matrix `C(a, b)` (output_dim, output_dim) between two points.
    /// The nugget is never part of it.
    fn evaluate(&self, a: &ArrayView1<F>, b: &ArrayView1<F>) -> Array2<F>;

    /// Check hyperparameters consistency
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Covariance block found on the diagonal of a discretized matrix at `x`,
    /// that is `C(x, x)` plus the nugget contribution.
    fn point_covariance(&self, x: &ArrayView1<F>) -> Array2<F> {
        let mut c = self.evaluate(x, x);
        let nugget = self.nugget();
        if nugget != F::zero() {
            let amplitude = self.amplitude();
            for (k, a) in amplitude.iter().enumerate() {
                c[[k, k]] += nugget * *a * *a;
            }
        }
        c
    }

    /// Cross covariance matrix (nx * output_dim, ny * output_dim) between `x` (nx, input_dim)
    /// and `y` (ny, input_dim) points. No nugget is added.
    fn cross_covariance(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Array2<F> {
        let d = self.output_dim();
        let (x, y) = (x.view(), y.view());
        let ny = y.nrows();
        let blocks: Vec<Array2<F>> = (0..x.nrows())
            .into_par_iter()
            .map(|i| {
                let xi = x.row(i);
                let mut row = Array2::zeros((d, ny * d));
                for (j, yj) in y.rows().into_iter().enumerate() {
                    row.slice_mut(s![.., j * d..(j + 1) * d])
                        .assign(&self.evaluate(&xi, &yj));
                }
                row
            })
            .collect();
        let mut cross = Array2::zeros((x.nrows() * d, ny * d));
        for (i, row) in blocks.iter().enumerate() {
            cross.slice_mut(s![i * d..(i + 1) * d, ..]).assign(row);
        }
        cross
    }

    /// Covariance matrix (n * output_dim, n * output_dim) of `x` (n, input_dim) points
    /// with the nugget added on the diagonal.
    fn discretize(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        let d = self.output_dim();
        let x = x.view();
        let n = x.nrows();
        // upper block triangle only, mirrored afterwards
        let blocks: Vec<Vec<Array2<F>>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let xi = x.row(i);
                let mut row = Vec::with_capacity(n - i);
                row.push(self.point_covariance(&xi));
                for j in (i + 1)..n {
                    row.push(self.evaluate(&xi, &x.row(j)));
                }
                row
            })
            .collect();
        let mut c = Array2::zeros((n * d, n * d));
        for (i, row) in blocks.iter().enumerate() {
            for (offset, block) in row.iter().enumerate() {
                let j = i + offset;
                c.slice_mut(s![i * d..(i + 1) * d, j * d..(j + 1) * d])
                    .assign(block);
                if j != i {
                    c.slice_mut(s![j * d..(j + 1) * d, i * d..(i + 1) * d])
                        .assign(&block.t());
                }
            }
        }
        c
    }
}

/// Squared exponential kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct SquaredExponentialKernel();

impl<F: Float> Kernel<F> for SquaredExponentialKernel {
    /// exp( - |h|^2 / 2 )
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let r2 = h.fold(F::zero(), |acc, v| acc + *v * *v);
        F::exp(F::cast(-0.5) * r2)
    }
}

/// Absolute exponential kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct AbsoluteExponentialKernel();

impl<F: Float> Kernel<F> for AbsoluteExponentialKernel {
    ///   d
    /// prod exp( - |h_j| )
    ///  j=1
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let r1 = h.fold(F::zero(), |acc, v| acc + v.abs());
        F::exp(-r1)
    }
}

/// Matern 3/2 kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern32Kernel();

impl<F: Float> Kernel<F> for Matern32Kernel {
    ///   d
    /// prod (1 + sqrt(3) * |h_j|) exp( - sqrt(3) * |h_j| )
    ///  j=1
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let sqrt3 = F::cast(3.).sqrt();
        h.fold(F::one(), |acc, v| {
            let a = sqrt3 * v.abs();
            acc * (F::one() + a) * F::exp(-a)
        })
    }
}

/// Matern 5/2 kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(into = "String"),
    serde(try_from = "String")
)]
pub struct Matern52Kernel();

impl<F: Float> Kernel<F> for Matern52Kernel {
    ///   d
    /// prod (1 + sqrt(5) * |h_j| + (5./3.) * |h_j|^2) exp( - sqrt(5) * |h_j| )
    ///  j=1
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let sqrt5 = F::cast(5.).sqrt();
        let div5_3 = F::cast(5. / 3.);
        h.fold(F::one(), |acc, v| {
            let a = sqrt5 * v.abs();
            acc * (F::one() + a + div5_3 * *v * *v) * F::exp(-a)
        })
    }
}

macro_rules! declare_kernel_util_impls {
    ($kernel:ident) => {
        paste! {
            impl fmt::Display for [<$kernel Kernel>] {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", stringify!($kernel))
                }
            }

            impl From<[<$kernel Kernel>]> for String {
                fn from(_item: [<$kernel Kernel>]) -> Self {
                    stringify!($kernel).to_string()
                }
            }

            impl TryFrom<String> for [<$kernel Kernel>] {
                type Error = &'static str;
                fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
                    if s == stringify!($kernel) {
                        Ok(Self::default())
                    } else {
                        Err(concat!(
                            "Bad string value for ",
                            stringify!([<$kernel Kernel>]),
                            ", should be '",
                            stringify!($kernel),
                            "'"
                        ))
                    }
                }
            }
        }
    };
}

declare_kernel_util_impls!(SquaredExponential);
declare_kernel_util_impls!(AbsoluteExponential);
declare_kernel_util_impls!(Matern32);
declare_kernel_util_impls!(Matern52);

/// Generalized exponential kernel `exp( - sum_j |h_j|^p )` with `0 < p <= 2`
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct GeneralizedExponentialKernel {
    p: f64,
}

impl GeneralizedExponentialKernel {
    /// Constructor given the exponent `p`.
    /// Valid values are `0 < p <= 2`, checked when the owning model is validated.
    pub fn new(p: f64) -> Self {
        GeneralizedExponentialKernel { p }
    }

    /// Exponent of the kernel
    pub fn p(&self) -> f64 {
        self.p
    }
}

impl Default for GeneralizedExponentialKernel {
    fn default() -> Self {
        GeneralizedExponentialKernel { p: 1. }
    }
}

impl fmt::Display for GeneralizedExponentialKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GeneralizedExponential(p={})", self.p)
    }
}

impl<F: Float> Kernel<F> for GeneralizedExponentialKernel {
    fn value(&self, h: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
        let p = F::cast(self.p);
        let r = h.fold(F::zero(), |acc, v| acc + v.abs().powf(p));
        F::exp(-r)
    }

    fn validate(&self) -> Result<()> {
        if !(self.p > 0. && self.p <= 2.) {
            return Err(GpError::InvalidValueError(format!(
                "Generalized exponential exponent should be in ]0, 2], got {}",
                self.p
            )));
        }
        Ok(())
    }
}

/// A stationary covariance model
///
/// `C(x, y) = diag(amplitude) . R . diag(amplitude) * rho((x - y) / scale)`
///
/// where `R` is the (output_dim, output_dim) output correlation matrix
/// and `rho` the scalar [`Kernel`]. Discretized matrices get
/// `nugget * amplitude_k^2` added on their diagonal.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct StationaryCovariance<F: Float, K: Kernel<F>> {
    kernel: K,
    scale: Array1<F>,
    amplitude: Array1<F>,
    output_correlation: Array2<F>,
    nugget: F,
}

impl<F: Float, K: Kernel<F>> StationaryCovariance<F, K> {
    /// Scalar output model with unit scales, unit amplitude and no nugget
    pub fn new(kernel: K, input_dim: usize) -> Self {
        StationaryCovariance {
            kernel,
            scale: Array1::ones(input_dim),
            amplitude: Array1::ones(1),
            output_correlation: Array2::eye(1),
            nugget: F::zero(),
        }
    }

    /// Set scale (input_dim,).
    pub fn with_scale(mut self, scale: Array1<F>) -> Self {
        self.scale = scale;
        self
    }

    /// Set amplitude (output_dim,).
    ///
    /// Output correlation is reset to identity when output dimension changes.
    pub fn with_amplitude(mut self, amplitude: Array1<F>) -> Self {
        if amplitude.len() != self.amplitude.len() {
            self.output_correlation = Array2::eye(amplitude.len());
        }
        self.amplitude = amplitude;
        self
    }

    /// Set output correlation matrix (output_dim, output_dim).
    pub fn with_output_correlation(mut self, output_correlation: Array2<F>) -> Self {
        self.output_correlation = output_correlation;
        self
    }

    /// Set nugget factor.
    pub fn with_nugget(mut self, nugget: F) -> Self {
        self.nugget = nugget;
        self
    }

    /// Scalar correlation kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Output correlation matrix
    pub fn output_correlation(&self) -> &Array2<F> {
        &self.output_correlation
    }
}

impl<F: Float, K: Kernel<F>> fmt::Display for StationaryCovariance<F, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "StationaryCovariance(kernel={}, scale={}, amplitude={}, nugget={})",
            self.kernel, self.scale, self.amplitude, self.nugget
        )
    }
}

impl<F: Float, K: Kernel<F>> CovarianceModel<F> for StationaryCovariance<F, K> {
    fn input_dim(&self) -> usize {
        self.scale.len()
    }

    fn output_dim(&self) -> usize {
        self.amplitude.len()
    }

    fn scale(&self) -> Array1<F> {
        self.scale.to_owned()
    }

    fn amplitude(&self) -> Array1<F> {
        self.amplitude.to_owned()
    }

    fn nugget(&self) -> F {
        self.nugget
    }

    fn evaluate(&self, a: &ArrayView1<F>, b: &ArrayView1<F>) -> Array2<F> {
        let h = Zip::from(a)
            .and(b)
            .and(&self.scale)
            .map_collect(|ai, bi, s| (*ai - *bi) / *s);
        let rho = self.kernel.value(&h);
        let d = self.output_dim();
        Array2::from_shape_fn((d, d), |(k, l)| {
            self.amplitude[k] * self.amplitude[l] * self.output_correlation[[k, l]] * rho
        })
    }

    fn validate(&self) -> Result<()> {
        self.kernel.validate()?;
        if self.scale.is_empty() {
            return Err(GpError::InvalidValueError(
                "Covariance model scale should not be empty".to_string(),
            ));
        }
        if self.scale.iter().any(|v| !(*v > F::zero()) || !v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "Covariance model scale should be positive, got {}",
                self.scale
            )));
        }
        if self.amplitude.is_empty()
            || self
                .amplitude
                .iter()
                .any(|v| !(*v > F::zero()) || !v.is_finite())
        {
            return Err(GpError::InvalidValueError(format!(
                "Covariance model amplitude should be positive, got {}",
                self.amplitude
            )));
        }
        let d = self.amplitude.len();
        if self.output_correlation.dim() != (d, d) {
            return Err(GpError::DimensionMismatch(format!(
                "Output correlation should be ({d}, {d}), got {:?}",
                self.output_correlation.dim()
            )));
        }
        let asymmetric = (0..d).any(|k| {
            self.output_correlation[[k, k]] != F::one()
                || (0..k).any(|l| self.output_correlation[[k, l]] != self.output_correlation[[l, k]])
        });
        if asymmetric {
            return Err(GpError::InvalidValueError(
                "Output correlation should be symmetric with unit diagonal".to_string(),
            ));
        }
        if !(self.nugget >= F::zero()) {
            return Err(GpError::InvalidValueError(format!(
                "Nugget should be non negative, got {}",
                self.nugget
            )));
        }
        Ok(())
    }
}

/// White noise covariance: `C(x, y) = diag(amplitude^2)` when `x == y`, zero otherwise
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct DiracCovariance<F: Float> {
    input_dim: usize,
    amplitude: Array1<F>,
}

impl<F: Float> DiracCovariance<F> {
    /// Constructor given input dimension and amplitude (output_dim,)
    pub fn new(input_dim: usize, amplitude: Array1<F>) -> Self {
        DiracCovariance {
            input_dim,
            amplitude,
        }
    }
}

impl<F: Float> fmt::Display for DiracCovariance<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DiracCovariance(amplitude={})", self.amplitude)
    }
}

impl<F: Float> CovarianceModel<F> for DiracCovariance<F> {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn output_dim(&self) -> usize {
        self.amplitude.len()
    }

    fn scale(&self) -> Array1<F> {
        Array1::ones(self.input_dim)
    }

    fn amplitude(&self) -> Array1<F> {
        self.amplitude.to_owned()
    }

    fn nugget(&self) -> F {
        F::zero()
    }

    fn evaluate(&self, a: &ArrayView1<F>, b: &ArrayView1<F>) -> Array2<F> {
        if a == b {
            Array2::from_diag(&self.amplitude.mapv(|v| v * v))
        } else {
            let d = self.output_dim();
            Array2::zeros((d, d))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.amplitude.is_empty() || self.amplitude.iter().any(|v| !(*v > F::zero())) {
            return Err(GpError::InvalidValueError(format!(
                "Covariance model amplitude should be positive, got {}",
                self.amplitude
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};

    #[test]
    fn test_kernels_at_zero_lag() {
        let h = Array1::<f64>::zeros(3);
        assert_abs_diff_eq!(1., SquaredExponentialKernel().value(&h));
        assert_abs_diff_eq!(1., AbsoluteExponentialKernel().value(&h));
        assert_abs_diff_eq!(1., Matern32Kernel().value(&h));
        assert_abs_diff_eq!(1., Matern52Kernel().value(&h));
        assert_abs_diff_eq!(1., GeneralizedExponentialKernel::new(1.5).value(&h));
    }

    #[test]
    fn test_kernel_values() {
        let h = array![1.0, -2.0];
        assert_abs_diff_eq!(
            f64::exp(-2.5),
            SquaredExponentialKernel().value(&h),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            f64::exp(-3.),
            AbsoluteExponentialKernel().value(&h),
            epsilon = 1e-12
        );
        let s3 = f64::sqrt(3.);
        let expected = (1. + s3) * f64::exp(-s3) * (1. + 2. * s3) * f64::exp(-2. * s3);
        assert_abs_diff_eq!(expected, Matern32Kernel().value(&h), epsilon = 1e-12);
        let s5 = f64::sqrt(5.);
        let expected = (1. + s5 + 5. / 3.) * f64::exp(-s5);
        assert_abs_diff_eq!(
            expected,
            Matern52Kernel().value(&array![1.0]),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            f64::exp(-(1. + 4.)),
            GeneralizedExponentialKernel::new(2.).value(&h),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_stationary_evaluate() {
        let cov = StationaryCovariance::new(SquaredExponentialKernel(), 1)
            .with_scale(array![2.0])
            .with_amplitude(array![3.0]);
        let a = array![1.0];
        let b = array![3.0];
        let c = cov.evaluate(&a.view(), &b.view());
        assert_eq!(c.dim(), (1, 1));
        assert_abs_diff_eq!(9. * f64::exp(-0.5), c[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn test_discretize_symmetric_with_nugget() {
        let cov = StationaryCovariance::new(Matern52Kernel(), 2)
            .with_scale(array![0.5, 1.5])
            .with_amplitude(array![1.0, 2.0])
            .with_output_correlation(array![[1.0, 0.3], [0.3, 1.0]])
            .with_nugget(1e-3);
        cov.validate().expect("valid model");
        let x = array![[0., 0.], [1., 0.5], [0.2, 2.], [1.5, 1.5]];
        let c = cov.discretize(&x);
        assert_eq!(c.dim(), (8, 8));
        assert_abs_diff_eq!(c, c.t(), epsilon = 1e-15);
        // diagonal carries amplitude^2 * (1 + nugget)
        assert_abs_diff_eq!(c[[0, 0]], 1. + 1e-3, epsilon = 1e-12);
        assert_abs_diff_eq!(c[[1, 1]], 4. * (1. + 1e-3), epsilon = 1e-12);
        assert_abs_diff_eq!(c[[0, 1]], 0.3 * 2., epsilon = 1e-12);

        let cross = cov.cross_covariance(&x, &x);
        let nugget_part = &c - &cross;
        assert_abs_diff_eq!(
            nugget_part,
            Array2::from_diag(&array![1e-3, 4e-3, 1e-3, 4e-3, 1e-3, 4e-3, 1e-3, 4e-3]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_cross_covariance_shape() {
        let cov = StationaryCovariance::new(AbsoluteExponentialKernel(), 1);
        let x = Array::linspace(0., 1., 3).insert_axis(ndarray::Axis(1));
        let y = Array::linspace(0., 1., 5).insert_axis(ndarray::Axis(1));
        let cross = cov.cross_covariance(&x, &y);
        assert_eq!(cross.dim(), (3, 5));
        assert_abs_diff_eq!(cross[[2, 4]], 1.);
        assert_abs_diff_eq!(cross[[0, 4]], f64::exp(-1.), epsilon = 1e-12);
    }

    #[test]
    fn test_validate() {
        let cov = StationaryCovariance::<f64, _>::new(SquaredExponentialKernel(), 2)
            .with_scale(array![1.0, -1.0]);
        assert!(matches!(
            cov.validate(),
            Err(GpError::InvalidValueError(_))
        ));
        let cov = StationaryCovariance::<f64, _>::new(SquaredExponentialKernel(), 1)
            .with_amplitude(array![1.0, 1.0])
            .with_output_correlation(array![[1.0, 0.5], [0.4, 1.0]]);
        assert!(cov.validate().is_err());
        let cov = StationaryCovariance::<f64, _>::new(GeneralizedExponentialKernel::new(3.), 1);
        assert!(cov.validate().is_err());
    }

    #[test]
    fn test_dirac() {
        let cov = DiracCovariance::new(1, array![2.0]);
        let x = array![[0.], [1.], [1.]];
        let c = cov.discretize(&x);
        assert_eq!(
            c,
            array![[4., 0., 0.], [0., 4., 4.], [0., 4., 4.]]
        );
    }

    #[test]
    fn test_kernel_names() {
        assert_eq!("Matern32", Matern32Kernel().to_string());
        assert_eq!(
            Ok(SquaredExponentialKernel()),
            SquaredExponentialKernel::try_from("SquaredExponential".to_string())
        );
        assert!(AbsoluteExponentialKernel::try_from("Matern52".to_string()).is_err());
    }
}
