//! Hierarchical allocators: HRP and HERC.
//!
//! Both allocators walk the quasi-diagonal leaf order produced by the
//! clusterer and split risk budgets top-down in inverse proportion to cluster
//! variance. A cluster's variance is the quadratic form `wᵀΣw` over its
//! diagonal block, with inverse-variance weights `w` built from the per-asset
//! variances; off-diagonal covariance inside the block enters through that
//! quadratic form. No matrix is inverted.

use crate::cluster::ClusterTree;
use crate::error::{AllocationError, Result};
use crate::stats::{inverse_variance_weights, quadratic_form, VARIANCE_FLOOR};
use crate::types::{Algorithm, ClusterCount, WEIGHT_TOLERANCE};
use tracing::debug;

/// Everything an allocator needs for one rebalancing date.
#[derive(Debug, Clone, Copy)]
pub struct AllocationInput<'a> {
    pub tree: &'a ClusterTree,
    /// Quasi-diagonal leaf order of `tree`.
    pub order: &'a [usize],
    /// Covariance of the risk assets; per-asset variances are its diagonal.
    pub covariance: &'a [Vec<f64>],
}

impl<'a> AllocationInput<'a> {
    pub fn new(tree: &'a ClusterTree, order: &'a [usize], covariance: &'a [Vec<f64>]) -> Self {
        Self {
            tree,
            order,
            covariance,
        }
    }

    fn validate(&self) -> Result<usize> {
        let n = self.tree.n_leaves();
        if self.covariance.len() != n || self.covariance.iter().any(|row| row.len() != n) {
            return Err(AllocationError::InputError(format!(
                "Covariance matrix is {}x{} but the tree has {} leaves",
                self.covariance.len(),
                self.covariance.first().map(|r| r.len()).unwrap_or(0),
                n
            )));
        }

        let mut seen = vec![false; n];
        for &leaf in self.order {
            if leaf >= n || seen[leaf] {
                return Err(AllocationError::InputError(format!(
                    "Leaf order is not a permutation of 0..{}",
                    n
                )));
            }
            seen[leaf] = true;
        }
        if self.order.len() != n {
            return Err(AllocationError::InputError(format!(
                "Leaf order has {} entries, expected {}",
                self.order.len(),
                n
            )));
        }
        Ok(n)
    }
}

/// An allocation rule producing risk-asset weights that sum to one.
pub trait Allocator: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Weights indexed by asset column (leaf id), summing to one.
    fn allocate(&self, input: &AllocationInput<'_>) -> Result<Vec<f64>>;
}

/// Hierarchical Risk Parity via recursive bisection of the leaf order.
#[derive(Debug, Clone, Copy, Default)]
pub struct HrpAllocator;

impl HrpAllocator {
    pub fn new() -> Self {
        Self
    }
}

impl Allocator for HrpAllocator {
    fn name(&self) -> &str {
        "HRP"
    }

    fn allocate(&self, input: &AllocationInput<'_>) -> Result<Vec<f64>> {
        let n = input.validate()?;
        let mut weights = vec![0.0; n];
        bisect(input.order, 1.0, input.covariance, &mut weights);
        check_weights(self.name(), weights)
    }
}

/// Hierarchical Equal Risk Contribution: an equal budget per top-level
/// cluster, then HRP bisection inside each cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct HercAllocator {
    cluster_count: ClusterCount,
}

impl HercAllocator {
    pub fn new(cluster_count: ClusterCount) -> Self {
        Self { cluster_count }
    }

    /// Number of clusters this allocator will use for `tree`.
    pub fn resolve_cluster_count(&self, tree: &ClusterTree) -> usize {
        match self.cluster_count {
            ClusterCount::Fixed(k) => k,
            ClusterCount::MaxGap => tree.max_gap_cluster_count(),
        }
    }
}

impl Allocator for HercAllocator {
    fn name(&self) -> &str {
        "HERC"
    }

    fn allocate(&self, input: &AllocationInput<'_>) -> Result<Vec<f64>> {
        let n = input.validate()?;
        let k = self.resolve_cluster_count(input.tree);
        let clusters = input.tree.cut(k)?;

        let mut position = vec![0; n];
        for (pos, &leaf) in input.order.iter().enumerate() {
            position[leaf] = pos;
        }

        let budget = 1.0 / k as f64;
        let mut weights = vec![0.0; n];
        for mut members in clusters {
            members.sort_by_key(|&leaf| position[leaf]);
            debug!("HERC cluster {:?} receives {:.6}", members, budget);
            bisect(&members, budget, input.covariance, &mut weights);
        }

        check_weights(self.name(), weights)
    }
}

/// Boxed allocator for a configured algorithm.
pub fn allocator_for(algorithm: Algorithm, cluster_count: ClusterCount) -> Box<dyn Allocator> {
    match algorithm {
        Algorithm::Hrp => Box::new(HrpAllocator::new()),
        Algorithm::Herc => Box::new(HercAllocator::new(cluster_count)),
    }
}

/// Variance of a segment under inverse-variance weights within the segment.
fn segment_variance(segment: &[usize], cov: &[Vec<f64>]) -> f64 {
    let variances: Vec<f64> = segment.iter().map(|&i| cov[i][i]).collect();
    let ivp = inverse_variance_weights(&variances);
    quadratic_form(&ivp, cov, segment).max(VARIANCE_FLOOR)
}

/// Split `budget` over `segment` top-down, writing leaf weights into `weights`.
fn bisect(segment: &[usize], budget: f64, cov: &[Vec<f64>], weights: &mut [f64]) {
    let mut stack: Vec<(&[usize], f64)> = vec![(segment, budget)];

    while let Some((items, w)) = stack.pop() {
        match items {
            [] => {}
            [leaf] => weights[*leaf] += w,
            _ => {
                let (left, right) = items.split_at(items.len() / 2);
                let var_left = segment_variance(left, cov);
                let var_right = segment_variance(right, cov);
                let w_left = w * var_right / (var_left + var_right);
                stack.push((right, w - w_left));
                stack.push((left, w_left));
            }
        }
    }
}

fn check_weights(name: &str, weights: Vec<f64>) -> Result<Vec<f64>> {
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(AllocationError::NumericalInstability(format!(
            "{} produced invalid weights {:?}",
            name, weights
        )));
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(AllocationError::NumericalInstability(format!(
            "{} weights sum to {:.10}",
            name, total
        )));
    }
    Ok(weights)
}
