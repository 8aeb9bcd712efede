//! Geometric cluster tree over input points.
//!
//! Points are recursively bisected at the median of the widest dimension of their
//! bounding box. The tree stores a permutation such that every node owns a contiguous
//! range of the permuted points, which makes matrix blocks of a node pair contiguous.

use crate::parameters::Admissibility;
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix2};
use ndarray_stats::QuantileExt;
use std::cmp::Ordering;

/// A node of the cluster tree owning permuted points `start..end`
#[derive(Clone, Debug)]
pub struct ClusterNode<F: Float> {
    start: usize,
    end: usize,
    lower: Array1<F>,
    upper: Array1<F>,
    children: Option<Box<(ClusterNode<F>, ClusterNode<F>)>>,
}

impl<F: Float> ClusterNode<F> {
    /// First permuted point index
    pub fn start(&self) -> usize {
        self.start
    }

    /// Past-the-end permuted point index
    pub fn end(&self) -> usize {
        self.end
    }

    /// Number of points
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Sub-clusters, `None` for a leaf
    pub fn children(&self) -> Option<(&ClusterNode<F>, &ClusterNode<F>)> {
        self.children.as_deref().map(|(a, b)| (a, b))
    }

    /// Diagonal length of the bounding box
    pub fn diameter(&self) -> F {
        (&self.upper - &self.lower)
            .iter()
            .fold(F::zero(), |acc, v| acc + *v * *v)
            .sqrt()
    }

    /// Euclidean distance between two bounding boxes, zero when they intersect
    pub fn distance(&self, other: &ClusterNode<F>) -> F {
        let mut d2 = F::zero();
        for k in 0..self.lower.len() {
            let gap = (other.lower[k] - self.upper[k])
                .max(self.lower[k] - other.upper[k])
                .max(F::zero());
            d2 += gap * gap;
        }
        d2.sqrt()
    }

    /// Whether the interaction block between two clusters may be compressed
    pub fn is_admissible(&self, other: &ClusterNode<F>, admissibility: &Admissibility<F>) -> bool {
        match admissibility {
            Admissibility::Weak => true,
            Admissibility::Strong { eta } => {
                let dist = self.distance(other);
                dist > F::zero() && self.diameter().min(other.diameter()) <= *eta * dist
            }
        }
    }

    /// Number of nodes in the subtree
    pub fn count_nodes(&self) -> usize {
        match self.children() {
            Some((a, b)) => 1 + a.count_nodes() + b.count_nodes(),
            None => 1,
        }
    }

    /// Depth of the subtree, a leaf has depth 1
    pub fn depth(&self) -> usize {
        match self.children() {
            Some((a, b)) => 1 + a.depth().max(b.depth()),
            None => 1,
        }
    }
}

/// Binary space partition tree of a point sample
#[derive(Clone, Debug)]
pub struct ClusterTree<F: Float> {
    permutation: Vec<usize>,
    root: ClusterNode<F>,
}

impl<F: Float> ClusterTree<F> {
    /// Build the tree of `x` (n, nx) points, leaves holding at most `leaf_size` points.
    /// Clusters of identical points are never split.
    pub fn new(x: &ArrayBase<impl Data<Elem = F>, Ix2>, leaf_size: usize) -> Self {
        let mut permutation: Vec<usize> = (0..x.nrows()).collect();
        let root = build_node(x, &mut permutation, 0, x.nrows(), leaf_size.max(1));
        ClusterTree { permutation, root }
    }

    /// `permutation[i]` is the original index of the `i`th permuted point
    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    /// Root cluster
    pub fn root(&self) -> &ClusterNode<F> {
        &self.root
    }
}

fn bounding_box<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    indices: &[usize],
) -> (Array1<F>, Array1<F>) {
    let nx = x.ncols();
    let mut lower = Array1::from_elem(nx, F::infinity());
    let mut upper = Array1::from_elem(nx, F::neg_infinity());
    for &i in indices {
        for k in 0..nx {
            lower[k] = lower[k].min(x[[i, k]]);
            upper[k] = upper[k].max(x[[i, k]]);
        }
    }
    if indices.is_empty() {
        lower.fill(F::zero());
        upper.fill(F::zero());
    }
    (lower, upper)
}

fn build_node<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    permutation: &mut [usize],
    start: usize,
    end: usize,
    leaf_size: usize,
) -> ClusterNode<F> {
    let (lower, upper) = bounding_box(x, &permutation[start..end]);
    let widths = &upper - &lower;
    let dim = widths.argmax().unwrap_or(0);
    let width = widths.get(dim).cloned().unwrap_or_else(F::zero);
    let children = if end - start > leaf_size && width > F::zero() {
        permutation[start..end].sort_by(|a, b| {
            x[[*a, dim]]
                .partial_cmp(&x[[*b, dim]])
                .unwrap_or(Ordering::Equal)
        });
        let mid = start + (end - start) / 2;
        let first = build_node(x, permutation, start, mid, leaf_size);
        let second = build_node(x, permutation, mid, end, leaf_size);
        Some(Box::new((first, second)))
    } else {
        None
    };
    ClusterNode {
        start,
        end,
        lower,
        upper,
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn check_leaves(node: &ClusterNode<f64>, leaf_size: usize) {
        match node.children() {
            Some((a, b)) => {
                assert_eq!(node.start(), a.start());
                assert_eq!(a.end(), b.start());
                assert_eq!(b.end(), node.end());
                check_leaves(a, leaf_size);
                check_leaves(b, leaf_size);
            }
            None => assert!(node.size() <= leaf_size),
        }
    }

    #[test]
    fn test_cluster_tree_partition() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array2::random_using((100, 3), Uniform::new(0., 1.), &mut rng);
        let tree = ClusterTree::new(&x, 8);
        let mut perm = tree.permutation().to_vec();
        perm.sort_unstable();
        assert_eq!((0..100).collect::<Vec<_>>(), perm);
        assert_eq!(100, tree.root().size());
        check_leaves(tree.root(), 8);
        assert!(tree.root().depth() >= 4);
    }

    #[test]
    fn test_split_along_widest_dimension() {
        let x = array![[0., 0.], [10., 0.1], [1., 0.2], [9., 0.3]];
        let tree = ClusterTree::new(&x, 2);
        let (a, b) = tree.root().children().expect("root is split");
        let left: Vec<usize> = tree.permutation()[a.start()..a.end()].to_vec();
        let right: Vec<usize> = tree.permutation()[b.start()..b.end()].to_vec();
        assert!(left.contains(&0) && left.contains(&2));
        assert!(right.contains(&1) && right.contains(&3));
        assert_abs_diff_eq!(8., a.distance(b), epsilon = 1e-12);
        assert!(a.is_admissible(b, &Admissibility::Strong { eta: 1. }));
        assert!(!a.is_admissible(b, &Admissibility::Strong { eta: 0.1 }));
    }

    #[test]
    fn test_duplicates_are_not_split() {
        let x = array![[1.], [1.], [1.], [1.]];
        let tree = ClusterTree::new(&x, 1);
        assert!(tree.root().children().is_none());
        assert_eq!(1, tree.root().count_nodes());
    }
}
