//! Covariance matrix factorizations.
//!
//! A symmetric positive definite matrix `C` is factorized as `C = L.L^T` either exactly
//! with a dense Cholesky decomposition or approximately with a hierarchical (block low-rank)
//! decomposition built over a [`ClusterTree`] of the observation points.
//! Both are exposed through [`CovarianceFactor`] providing `L^-1.b`, `L^-T.b` and `log(det(C))`,
//! so that callers do not depend on the chosen algorithm.
//!
//! For the hierarchical case `L = P^T.H` where `P` is the permutation induced by the cluster tree
//! and `H` is lower triangular in the permuted ordering. `L` is not triangular in the original
//! ordering but `L^-T.L^-1 = C^-1` holds, which is all the regression relies on.

use crate::clustering::{ClusterNode, ClusterTree};
use crate::errors::{GpError, Result};
use crate::parameters::{FactorizationMethod, FactorizationParams, HMatrixParams};
use crate::utils::max_abs_diag;
use linfa::Float;
use linfa_linalg::{qr::*, svd::*, triangular::*};
use log::debug;
use ndarray::{
    s, Array1, Array2, ArrayBase, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis, Data, Ix1, Ix2,
    Zip,
};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Number of remaining rows above which a Cholesky column update runs in parallel
const PARALLEL_ROWS_THRESHOLD: usize = 128;
/// Number of right hand side columns solved per rayon task
const COLUMN_CHUNK: usize = 64;

/// Kind of covariance factorization
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FactorizationKind {
    /// Dense lower triangular Cholesky factor
    Cholesky,
    /// Hierarchical block low-rank factor
    Hierarchical,
}

impl fmt::Display for FactorizationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FactorizationKind::Cholesky => write!(f, "Cholesky"),
            FactorizationKind::Hierarchical => write!(f, "Hierarchical"),
        }
    }
}

impl FactorizationMethod {
    /// Factorization kind used for a matrix of size `size`
    pub fn kind_for(&self, size: usize) -> FactorizationKind {
        match self {
            FactorizationMethod::Cholesky => FactorizationKind::Cholesky,
            FactorizationMethod::Hierarchical => FactorizationKind::Hierarchical,
            FactorizationMethod::Auto { threshold } => {
                if size > *threshold {
                    FactorizationKind::Hierarchical
                } else {
                    FactorizationKind::Cholesky
                }
            }
        }
    }
}

/// Factor `L` of a covariance matrix `C = L.L^T`
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub enum CovarianceFactor<F: Float> {
    /// Exact dense factor
    Cholesky(CholeskyFactor<F>),
    /// Approximate hierarchical factor
    Hierarchical(HierarchicalFactor<F>),
}

/// Factorize the symmetric positive definite `matrix` (m, m) discretized over `points` (n, nx)
/// with `m = n * output_dim`.
///
/// `params.jitter` is added to the diagonal first. A pivot not greater than
/// `params.pivot_tolerance` times the largest diagonal entry raises
/// [`GpError::NonPositiveDefinite`] reporting the failing row of `matrix`.
pub fn factorize<F: Float>(
    mut matrix: Array2<F>,
    points: &ArrayBase<impl Data<Elem = F>, Ix2>,
    output_dim: usize,
    params: &FactorizationParams<F>,
) -> Result<CovarianceFactor<F>> {
    let m = matrix.nrows();
    if matrix.ncols() != m {
        return Err(GpError::DimensionMismatch(format!(
            "Covariance matrix should be square, got {:?}",
            matrix.dim()
        )));
    }
    if points.nrows() * output_dim != m {
        return Err(GpError::DimensionMismatch(format!(
            "Covariance matrix size {m} does not match {} points of output dimension {output_dim}",
            points.nrows()
        )));
    }
    if params.jitter > F::zero() {
        matrix.diag_mut().mapv_inplace(|v| v + params.jitter);
    }
    let threshold = params.pivot_tolerance * max_abs_diag(&matrix);
    let kind = params.method.kind_for(m);
    let now = Instant::now();
    let factor = match kind {
        FactorizationKind::Cholesky => {
            CovarianceFactor::Cholesky(CholeskyFactor::new(matrix, threshold)?)
        }
        FactorizationKind::Hierarchical => CovarianceFactor::Hierarchical(HierarchicalFactor::new(
            matrix,
            points,
            output_dim,
            &params.hmat,
            threshold,
        )?),
    };
    debug!("{} factorization of size {} in {:?}", kind, m, now.elapsed());
    Ok(factor)
}

impl<F: Float> CovarianceFactor<F> {
    /// Kind of factorization
    pub fn kind(&self) -> FactorizationKind {
        match self {
            CovarianceFactor::Cholesky(_) => FactorizationKind::Cholesky,
            CovarianceFactor::Hierarchical(_) => FactorizationKind::Hierarchical,
        }
    }

    /// Size `m` of the factorized matrix
    pub fn dim(&self) -> usize {
        match self {
            CovarianceFactor::Cholesky(chol) => chol.lower.nrows(),
            CovarianceFactor::Hierarchical(hmat) => hmat.rows.len(),
        }
    }

    /// `L^-1.b` for `b` (m, k)
    pub fn solve_lower(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_rows(b.nrows())?;
        match self {
            CovarianceFactor::Cholesky(chol) => chol.solve_lower(b),
            CovarianceFactor::Hierarchical(hmat) => hmat.solve_lower(b),
        }
    }

    /// `L^-T.b` for `b` (m, k)
    pub fn solve_lower_transpose(
        &self,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Array2<F>> {
        self.check_rows(b.nrows())?;
        match self {
            CovarianceFactor::Cholesky(chol) => chol.solve_lower_transpose(b),
            CovarianceFactor::Hierarchical(hmat) => hmat.solve_lower_transpose(b),
        }
    }

    /// `L^-1.b` for `b` (m,)
    pub fn solve_lower_vec(&self, b: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array1<F>> {
        let x = self.solve_lower(&b.to_owned().insert_axis(Axis(1)))?;
        Ok(x.column(0).to_owned())
    }

    /// `L^-T.b` for `b` (m,)
    pub fn solve_lower_transpose_vec(
        &self,
        b: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<Array1<F>> {
        let x = self.solve_lower_transpose(&b.to_owned().insert_axis(Axis(1)))?;
        Ok(x.column(0).to_owned())
    }

    /// `C^-1.b` through two triangular solves
    pub fn solve(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let y = self.solve_lower(b)?;
        self.solve_lower_transpose(&y)
    }

    /// `log(det(C))` as twice the sum of logarithms of the factor diagonal
    pub fn log_determinant(&self) -> F {
        match self {
            CovarianceFactor::Cholesky(chol) => chol.log_determinant(),
            CovarianceFactor::Hierarchical(hmat) => hmat.root.log_determinant(),
        }
    }

    /// Dense (m, m) matrix `L` such that `C = L.L^T`
    pub fn to_dense(&self) -> Array2<F> {
        match self {
            CovarianceFactor::Cholesky(chol) => chol.lower.to_owned(),
            CovarianceFactor::Hierarchical(hmat) => {
                let h = hmat.root.to_dense();
                let mut l = Array2::zeros(h.dim());
                for (i, &r) in hmat.rows.iter().enumerate() {
                    l.row_mut(r).assign(&h.row(i));
                }
                l
            }
        }
    }

    /// Number of scalars stored by the factor
    pub fn storage(&self) -> usize {
        match self {
            CovarianceFactor::Cholesky(chol) => {
                let m = chol.lower.nrows();
                m * (m + 1) / 2
            }
            CovarianceFactor::Hierarchical(hmat) => hmat.root.storage(),
        }
    }

    fn check_rows(&self, nrows: usize) -> Result<()> {
        if nrows != self.dim() {
            return Err(GpError::DimensionMismatch(format!(
                "Right hand side has {nrows} rows, factor size is {}",
                self.dim()
            )));
        }
        Ok(())
    }
}

/// Dense Cholesky factor
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct CholeskyFactor<F: Float> {
    lower: Array2<F>,
}

impl<F: Float> CholeskyFactor<F> {
    fn new(mut matrix: Array2<F>, threshold: F) -> Result<Self> {
        cholesky_in_place(&mut matrix, threshold).map_err(|(pivot, value)| {
            GpError::NonPositiveDefinite {
                pivot,
                value: value.to_f64().unwrap_or(f64::NAN),
            }
        })?;
        Ok(CholeskyFactor { lower: matrix })
    }

    /// Lower triangular factor
    pub fn lower(&self) -> &Array2<F> {
        &self.lower
    }

    fn solve_lower(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        par_columns(b, |chunk| {
            Ok(self.lower.solve_triangular(&chunk, UPLO::Lower)?)
        })
    }

    fn solve_lower_transpose(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        par_columns(b, |chunk| {
            Ok(self.lower.t().solve_triangular(&chunk, UPLO::Upper)?)
        })
    }

    fn log_determinant(&self) -> F {
        F::cast(2.) * self.lower.diag().mapv(|v| v.ln()).sum()
    }
}

/// Solve independent column chunks of `b` in parallel
fn par_columns<F: Float>(
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    solve: impl Fn(ArrayView2<F>) -> Result<Array2<F>> + Sync,
) -> Result<Array2<F>> {
    let ncols = b.ncols();
    if ncols < 2 * COLUMN_CHUNK {
        return solve(b.view());
    }
    let b = b.view();
    let starts: Vec<usize> = (0..ncols).step_by(COLUMN_CHUNK).collect();
    let parts = starts
        .par_iter()
        .map(|&start| {
            let end = (start + COLUMN_CHUNK).min(ncols);
            solve(b.slice(s![.., start..end]))
        })
        .collect::<Result<Vec<_>>>()?;
    let mut res = Array2::zeros((b.nrows(), ncols));
    for (start, part) in starts.iter().zip(parts.iter()) {
        res.slice_mut(s![.., *start..*start + part.ncols()])
            .assign(part);
    }
    Ok(res)
}

/// Left-looking Cholesky decomposition overwriting the lower triangle of `a`,
/// the strict upper triangle is zeroed.
///
/// Fails with the index and value of the first pivot not greater than `threshold`.
fn cholesky_in_place<F: Float>(
    a: &mut Array2<F>,
    threshold: F,
) -> std::result::Result<(), (usize, F)> {
    let n = a.nrows();
    for j in 0..n {
        let d = {
            let row = a.row(j);
            let lj = row.slice(s![..j]);
            row[j] - lj.dot(&lj)
        };
        if !(d > threshold) {
            return Err((j, d));
        }
        let ljj = d.sqrt();
        a[[j, j]] = ljj;

        let (top, mut bottom) = a.view_mut().split_at(Axis(0), j + 1);
        let lj = top.slice(s![j, ..j]);
        let update = |mut row: ArrayViewMut1<F>| {
            let dot = row.slice(s![..j]).dot(&lj);
            row[j] = (row[j] - dot) / ljj;
        };
        if n - j > PARALLEL_ROWS_THRESHOLD {
            Zip::from(bottom.rows_mut()).par_for_each(update);
        } else {
            Zip::from(bottom.rows_mut()).for_each(update);
        }
    }
    for i in 0..n {
        a.slice_mut(s![i, i + 1..]).fill(F::zero());
    }
    Ok(())
}

/// Off-diagonal block `H21` of a hierarchical node
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
enum Coupling<F: Float> {
    /// Full (n2, n1) block
    Dense(Array2<F>),
    /// `u.v^T` with u (n2, k) and v (n1, k)
    LowRank { u: Array2<F>, v: Array2<F> },
}

/// Lower triangular hierarchical matrix `H = [[H11, 0], [H21, H22]]`
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
enum HNode<F: Float> {
    Leaf {
        lower: Array2<F>,
    },
    Split {
        split: usize,
        first: Box<HNode<F>>,
        second: Box<HNode<F>>,
        coupling: Coupling<F>,
    },
}

impl<F: Float> HNode<F> {
    fn size(&self) -> usize {
        match self {
            HNode::Leaf { lower } => lower.nrows(),
            HNode::Split { split, second, .. } => split + second.size(),
        }
    }

    fn solve_lower(&self, mut b: ArrayViewMut2<F>) -> Result<()> {
        match self {
            HNode::Leaf { lower } => {
                let x = lower.solve_triangular(&b, UPLO::Lower)?;
                b.assign(&x);
            }
            HNode::Split {
                split,
                first,
                second,
                coupling,
            } => {
                let (mut b1, mut b2) = b.view_mut().split_at(Axis(0), *split);
                first.solve_lower(b1.view_mut())?;
                match coupling {
                    Coupling::Dense(h21) => b2 -= &h21.dot(&b1),
                    Coupling::LowRank { u, v } => b2 -= &u.dot(&v.t().dot(&b1)),
                }
                second.solve_lower(b2)?;
            }
        }
        Ok(())
    }

    fn solve_lower_transpose(&self, mut b: ArrayViewMut2<F>) -> Result<()> {
        match self {
            HNode::Leaf { lower } => {
                let x = lower.t().solve_triangular(&b, UPLO::Upper)?;
                b.assign(&x);
            }
            HNode::Split {
                split,
                first,
                second,
                coupling,
            } => {
                let (mut b1, mut b2) = b.view_mut().split_at(Axis(0), *split);
                second.solve_lower_transpose(b2.view_mut())?;
                match coupling {
                    Coupling::Dense(h21) => b1 -= &h21.t().dot(&b2),
                    Coupling::LowRank { u, v } => b1 -= &v.dot(&u.t().dot(&b2)),
                }
                first.solve_lower_transpose(b1)?;
            }
        }
        Ok(())
    }

    fn log_determinant(&self) -> F {
        match self {
            HNode::Leaf { lower } => F::cast(2.) * lower.diag().mapv(|v| v.ln()).sum(),
            HNode::Split { first, second, .. } => first.log_determinant() + second.log_determinant(),
        }
    }

    fn to_dense(&self) -> Array2<F> {
        match self {
            HNode::Leaf { lower } => lower.to_owned(),
            HNode::Split {
                split,
                first,
                second,
                coupling,
            } => {
                let n = self.size();
                let mut h = Array2::zeros((n, n));
                h.slice_mut(s![..*split, ..*split])
                    .assign(&first.to_dense());
                h.slice_mut(s![*split.., *split..])
                    .assign(&second.to_dense());
                let h21 = match coupling {
                    Coupling::Dense(h21) => h21.to_owned(),
                    Coupling::LowRank { u, v } => u.dot(&v.t()),
                };
                h.slice_mut(s![*split.., ..*split]).assign(&h21);
                h
            }
        }
    }

    fn storage(&self) -> usize {
        match self {
            HNode::Leaf { lower } => lower.nrows() * (lower.nrows() + 1) / 2,
            HNode::Split {
                first,
                second,
                coupling,
                ..
            } => {
                let coupling_size = match coupling {
                    Coupling::Dense(h21) => h21.len(),
                    Coupling::LowRank { u, v } => u.len() + v.len(),
                };
                first.storage() + second.storage() + coupling_size
            }
        }
    }
}

/// Hierarchical factor `L = P^T.H`
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct HierarchicalFactor<F: Float> {
    /// `rows[i]` is the row of the original matrix at permuted position `i`
    rows: Vec<usize>,
    root: HNode<F>,
}

#[derive(Default)]
struct CompressionStats {
    low_rank: usize,
    dense: usize,
    max_rank: usize,
}

struct Assembly<'a, F: Float> {
    params: &'a HMatrixParams<F>,
    output_dim: usize,
    threshold: F,
    rows: &'a [usize],
}

impl<F: Float> HierarchicalFactor<F> {
    fn new(
        matrix: Array2<F>,
        points: &ArrayBase<impl Data<Elem = F>, Ix2>,
        output_dim: usize,
        params: &HMatrixParams<F>,
        threshold: F,
    ) -> Result<Self> {
        let tree = ClusterTree::new(points, params.leaf_size);
        let d = output_dim;
        let rows: Vec<usize> = tree
            .permutation()
            .iter()
            .flat_map(|&p| (0..d).map(move |k| p * d + k))
            .collect();
        let permuted = Array2::from_shape_fn(matrix.dim(), |(i, j)| matrix[[rows[i], rows[j]]]);
        drop(matrix);

        let assembly = Assembly {
            params,
            output_dim,
            threshold,
            rows: &rows,
        };
        let mut stats = CompressionStats::default();
        let root = factor_node(permuted, tree.root(), &assembly, 0, &mut stats)?;
        debug!(
            "Hierarchical factor: {} low-rank blocks (max rank {}), {} dense blocks, storage {}",
            stats.low_rank,
            stats.max_rank,
            stats.dense,
            root.storage()
        );
        Ok(HierarchicalFactor { rows, root })
    }

    fn solve_lower(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        par_columns(b, |chunk| {
            let mut x = chunk.select(Axis(0), &self.rows);
            self.root.solve_lower(x.view_mut())?;
            Ok(x)
        })
    }

    fn solve_lower_transpose(&self, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        par_columns(b, |chunk| {
            let mut y = chunk.to_owned();
            self.root.solve_lower_transpose(y.view_mut())?;
            let mut x = Array2::zeros(y.dim());
            for (i, &r) in self.rows.iter().enumerate() {
                x.row_mut(r).assign(&y.row(i));
            }
            Ok(x)
        })
    }
}

/// Factorize the permuted block `a` owned by `node`, starting at permuted row `offset`
fn factor_node<F: Float>(
    mut a: Array2<F>,
    node: &ClusterNode<F>,
    assembly: &Assembly<F>,
    offset: usize,
    stats: &mut CompressionStats,
) -> Result<HNode<F>> {
    let (c1, c2) = match node.children() {
        Some(children) => children,
        None => {
            cholesky_in_place(&mut a, assembly.threshold).map_err(|(pivot, value)| {
                GpError::NonPositiveDefinite {
                    pivot: assembly.rows[offset + pivot],
                    value: value.to_f64().unwrap_or(f64::NAN),
                }
            })?;
            return Ok(HNode::Leaf { lower: a });
        }
    };
    let n1 = c1.size() * assembly.output_dim;
    let first = factor_node(
        a.slice(s![..n1, ..n1]).to_owned(),
        c1,
        assembly,
        offset,
        stats,
    )?;

    let a21 = a.slice(s![n1.., ..n1]);
    let (n2, _) = a21.dim();
    let low_rank = if c1.is_admissible(c2, &assembly.params.admissibility) {
        aca(&a21, assembly.params.assembly_epsilon, assembly.params.max_rank)
            .map(|(u, v)| recompress(u, v, assembly.params.recompression_epsilon))
            .filter(|(u, _)| u.ncols() * (n1 + n2) < n1 * n2)
    } else {
        None
    };

    let (coupling, schur) = match low_rank {
        Some((u, v)) => {
            // H21 = U.(H11^-1.V)^T
            let mut w = v;
            first.solve_lower(w.view_mut())?;
            let gram = w.t().dot(&w);
            let schur = &a.slice(s![n1.., n1..]) - &u.dot(&gram).dot(&u.t());
            stats.low_rank += 1;
            stats.max_rank = stats.max_rank.max(u.ncols());
            (Coupling::LowRank { u, v: w }, schur)
        }
        None => {
            let mut t = a21.t().to_owned();
            first.solve_lower(t.view_mut())?;
            let h21 = t.reversed_axes();
            let schur = &a.slice(s![n1.., n1..]) - &h21.dot(&h21.t());
            stats.dense += 1;
            (Coupling::Dense(h21), schur)
        }
    };
    drop(a);
    let second = factor_node(schur, c2, assembly, offset + n1, stats)?;
    Ok(HNode::Split {
        split: n1,
        first: Box::new(first),
        second: Box::new(second),
        coupling,
    })
}

/// Adaptive cross approximation with partial pivoting of `b` (r, c) as `u.v^T`,
/// u (r, k) and v (c, k).
///
/// Stops when the last cross `|u_k|.|v_k|` falls below `epsilon` times the estimated
/// Frobenius norm of the approximation. Returns `None` when `max_rank` is reached first.
fn aca<F: Float>(
    b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    epsilon: F,
    max_rank: usize,
) -> Option<(Array2<F>, Array2<F>)> {
    let (r, c) = b.dim();
    let amax = b.fold(F::zero(), |acc, v| acc.max(v.abs()));
    let mut us: Vec<Array1<F>> = vec![];
    let mut vs: Vec<Array1<F>> = vec![];
    if amax == F::zero() || r == 0 || c == 0 {
        return Some((Array2::zeros((r, 0)), Array2::zeros((c, 0))));
    }
    let tiny = F::epsilon() * amax;
    let full_rank = r.min(c);
    let mut used = vec![false; r];
    let mut norm2 = F::zero();
    let mut i = 0;
    let mut converged = false;
    while us.len() < max_rank.min(full_rank) {
        used[i] = true;
        let mut row = b.row(i).to_owned();
        for (u, v) in us.iter().zip(vs.iter()) {
            row.scaled_add(-u[i], v);
        }
        let (j, pivot) = row
            .iter()
            .enumerate()
            .fold((0, F::zero()), |(bj, bp), (j, val)| {
                if val.abs() > bp.abs() {
                    (j, *val)
                } else {
                    (bj, bp)
                }
            });
        if pivot.abs() <= tiny {
            // residual row vanishes, try another one
            match used.iter().position(|u| !*u) {
                Some(next) => {
                    i = next;
                    continue;
                }
                None => {
                    converged = true;
                    break;
                }
            }
        }
        let v = row.mapv(|val| val / pivot);
        let mut u = b.column(j).to_owned();
        for (ul, vl) in us.iter().zip(vs.iter()) {
            u.scaled_add(-vl[j], ul);
        }
        let unorm2 = u.dot(&u);
        let vnorm2 = v.dot(&v);
        let cross = us
            .iter()
            .zip(vs.iter())
            .fold(F::zero(), |acc, (ul, vl)| acc + ul.dot(&u) * vl.dot(&v));
        norm2 += F::cast(2.) * cross + unorm2 * vnorm2;
        let next = u
            .iter()
            .enumerate()
            .filter(|(k, _)| !used[*k])
            .fold(None, |best: Option<(usize, F)>, (k, val)| match best {
                Some((_, bv)) if bv >= val.abs() => best,
                _ => Some((k, val.abs())),
            });
        us.push(u);
        vs.push(v);
        if (unorm2 * vnorm2).sqrt() <= epsilon * norm2.abs().sqrt() {
            converged = true;
            break;
        }
        match next {
            Some((k, _)) => i = k,
            None => {
                converged = true;
                break;
            }
        }
    }
    if !converged && us.len() < full_rank {
        return None;
    }
    let k = us.len();
    let u = Array2::from_shape_fn((r, k), |(p, l)| us[l][p]);
    let v = Array2::from_shape_fn((c, k), |(q, l)| vs[l][q]);
    Some((u, v))
}

/// Truncate `u.v^T` to the singular values greater than `epsilon` times the largest one
fn recompress<F: Float>(u: Array2<F>, v: Array2<F>, epsilon: F) -> (Array2<F>, Array2<F>) {
    let k = u.ncols();
    if k == 0 || epsilon == F::zero() || k > u.nrows() || k > v.nrows() {
        return (u, v);
    }
    let qr_factors = match (u.qr(), v.qr()) {
        (Ok(qu), Ok(qv)) => (qu.into_decomp(), qv.into_decomp()),
        _ => return (u, v),
    };
    let ((qu, ru), (qv, rv)) = qr_factors;
    let core = ru.dot(&rv.t());
    let (w, sigma, zt) = match core.svd(true, true) {
        Ok((Some(w), sigma, Some(zt))) => (w, sigma, zt),
        _ => return (u, v),
    };
    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|a, b| {
        sigma[*b]
            .partial_cmp(&sigma[*a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let smax = sigma[order[0]];
    let kept: Vec<usize> = order
        .into_iter()
        .filter(|l| sigma[*l] > epsilon * smax)
        .collect();
    let w_kept = w.select(Axis(1), &kept);
    let z_kept = zt.select(Axis(0), &kept).reversed_axes();
    let sigma_kept = sigma.select(Axis(0), &kept);
    let u_new = qu.dot(&w_kept) * &sigma_kept;
    let v_new = qv.dot(&z_kept);
    (u_new, v_new)
}
