use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};

/// Expand a (n, p) basis matrix into the (n * d, p * d) block design matrix
/// where row `i * d + k` holds the basis values at point `i` in columns `k * p..(k + 1) * p`.
pub fn block_design<F: Float>(f: &ArrayBase<impl Data<Elem = F>, Ix2>, d: usize) -> Array2<F> {
    let (n, p) = f.dim();
    Array2::from_shape_fn((n * d, p * d), |(r, c)| {
        let (i, k) = (r / d, r % d);
        if c / p == k {
            f[[i, c % p]]
        } else {
            F::zero()
        }
    })
}

/// Flatten (n, d) output values into the (n * d,) vector ordered point by point
pub fn flatten_output<F: Float>(y: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
    y.iter().cloned().collect()
}

/// Reshape a (n * d,) vector ordered point by point into (n, d) values
pub fn unflatten_output<F: Float>(v: &ArrayBase<impl Data<Elem = F>, Ix1>, d: usize) -> Array2<F> {
    let n = if d == 0 { 0 } else { v.len() / d };
    Array2::from_shape_fn((n, d), |(i, k)| v[i * d + k])
}

/// Replace a square matrix by its symmetric part `(A + A^T) / 2`
pub fn symmetrize<F: Float>(a: &mut Array2<F>) {
    let n = a.nrows();
    let half = F::cast(0.5);
    for i in 0..n {
        for j in (i + 1)..n {
            let v = (a[[i, j]] + a[[j, i]]) * half;
            a[[i, j]] = v;
            a[[j, i]] = v;
        }
    }
}

/// Largest absolute value of the diagonal of a square matrix
pub fn max_abs_diag<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> F {
    a.diag()
        .iter()
        .fold(F::zero(), |acc, v| if v.abs() > acc { v.abs() } else { acc })
}
