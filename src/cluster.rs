//! Agglomerative hierarchical clustering and dendrogram ordering.
//!
//! The tree is stored as an arena following the usual linkage-matrix
//! convention: node ids `0..n` are the leaves (asset column indices) and node
//! `n + k` is the cluster created by the `k`-th merge. Traversals use an
//! explicit stack, so deep trees never recurse on the call stack.

use crate::error::{AllocationError, Result};
use crate::types::Linkage;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One merge of two clusters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Merge {
    /// Earlier-created child.
    pub left: usize,
    /// Later-created child.
    pub right: usize,
    /// Linkage distance at which the two children were joined.
    pub distance: f64,
    /// Number of leaves under the new node.
    pub size: usize,
}

/// Binary clustering tree over `n` leaves with exactly `n - 1` merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterTree {
    n_leaves: usize,
    merges: Vec<Merge>,
}

impl ClusterTree {
    /// Number of leaves (assets).
    pub fn n_leaves(&self) -> usize {
        self.n_leaves
    }

    /// Merges in the order they happened.
    pub fn merges(&self) -> &[Merge] {
        &self.merges
    }

    /// Id of the root node.
    pub fn root(&self) -> usize {
        2 * self.n_leaves - 2
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        node < self.n_leaves
    }

    /// Children of an internal node, `None` for leaves and unknown ids.
    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        node.checked_sub(self.n_leaves)
            .and_then(|k| self.merges.get(k))
            .map(|m| (m.left, m.right))
    }

    /// Merge distances in merge order (dendrogram heights).
    pub fn merge_distances(&self) -> Vec<f64> {
        self.merges.iter().map(|m| m.distance).collect()
    }

    /// Leaves under `node`, left subtree first.
    pub fn leaves(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            match self.children(current) {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => out.push(current),
            }
        }
        out
    }

    /// Quasi-diagonal order: every leaf once, left subtrees before right ones.
    pub fn leaf_order(&self) -> Vec<usize> {
        self.leaves(self.root())
    }

    /// Cut the tree into `k` clusters, the state after `n - k` merges.
    ///
    /// Each cluster lists its leaves in leaf order, and clusters are sorted by
    /// where they appear in the leaf order, so they form contiguous segments.
    pub fn cut(&self, k: usize) -> Result<Vec<Vec<usize>>> {
        let n = self.n_leaves;
        if k == 0 || k > n {
            return Err(AllocationError::InvalidClusterCount {
                requested: k,
                assets: n,
            });
        }

        // Undo the last k - 1 merges, always splitting the most recent one.
        let mut roots = vec![self.root()];
        for _ in 1..k {
            let (pos, &latest) = roots
                .iter()
                .enumerate()
                .max_by_key(|&(_, &id)| id)
                .ok_or(AllocationError::InvalidClusterCount {
                    requested: k,
                    assets: n,
                })?;
            let (left, right) = self.children(latest).ok_or(
                AllocationError::InvalidClusterCount {
                    requested: k,
                    assets: n,
                },
            )?;
            roots[pos] = left;
            roots.insert(pos + 1, right);
        }

        Ok(roots.into_iter().map(|r| self.leaves(r)).collect())
    }

    /// Number of clusters found by cutting at the largest jump in merge distance.
    ///
    /// The earliest of equal gaps wins. With a single merge there is no gap and
    /// everything stays in one cluster.
    pub fn max_gap_cluster_count(&self) -> usize {
        let heights = self.merge_distances();
        let best = heights
            .windows(2)
            .enumerate()
            .map(|(i, w)| (i, w[1] - w[0]))
            .fold(None, |best: Option<(usize, f64)>, (i, gap)| match best {
                Some((_, g)) if g >= gap => best,
                _ => Some((i, gap)),
            });

        match best {
            // Merges 0..=i are kept, leaving n - (i + 1) clusters.
            Some((i, _)) => self.n_leaves - (i + 1),
            None => 1,
        }
    }
}

/// Serializable view of one period's dendrogram, keyed by symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub symbols: Vec<String>,
    pub merges: Vec<Merge>,
    pub leaf_order: Vec<usize>,
}

impl ClusterSnapshot {
    pub fn new(tree: &ClusterTree, order: &[usize], symbols: &[String]) -> Self {
        Self {
            symbols: symbols.to_vec(),
            merges: tree.merges().to_vec(),
            leaf_order: order.to_vec(),
        }
    }

    /// Symbols in quasi-diagonal order.
    pub fn ordered_symbols(&self) -> Vec<&str> {
        self.leaf_order
            .iter()
            .filter_map(|&i| self.symbols.get(i).map(String::as_str))
            .collect()
    }
}

/// Build a hierarchical clustering tree from a distance matrix.
///
/// Ties in merge distance are broken by the lowest sum of the two node ids,
/// then by the lowest smaller id, so identical input always yields an
/// identical tree.
pub fn cluster(distance: &[Vec<f64>], linkage: Linkage) -> Result<ClusterTree> {
    let n = distance.len();
    if n < 2 {
        return Err(AllocationError::InsufficientAssets {
            required: 2,
            actual: n,
        });
    }
    if distance.iter().any(|row| row.len() != n) {
        return Err(AllocationError::InputError(
            "Distance matrix is not square".to_string(),
        ));
    }
    if distance.iter().flatten().any(|d| !d.is_finite()) {
        return Err(AllocationError::NumericalInstability(
            "Distance matrix has non-finite entries".to_string(),
        ));
    }

    // Active clusters: node id, leaf count. `dist` is indexed by slot.
    let mut active: Vec<(usize, usize)> = (0..n).map(|i| (i, 1)).collect();
    let mut dist: Vec<Vec<f64>> = distance.to_vec();
    let mut merges = Vec::with_capacity(n - 1);

    while active.len() > 1 {
        let mut best: Option<(f64, usize, usize, usize, usize)> = None;
        for a in 0..active.len() {
            for b in (a + 1)..active.len() {
                let d = dist[a][b];
                let (id_a, id_b) = (active[a].0, active[b].0);
                let sum = id_a + id_b;
                let low = id_a.min(id_b);
                let better = match best {
                    None => true,
                    Some((bd, bsum, blow, _, _)) => {
                        d < bd || (d == bd && (sum < bsum || (sum == bsum && low < blow)))
                    }
                };
                if better {
                    best = Some((d, sum, low, a, b));
                }
            }
        }

        let (d_ab, _, _, a, b) = best.ok_or(AllocationError::InsufficientAssets {
            required: 2,
            actual: active.len(),
        })?;
        let (id_a, size_a) = active[a];
        let (id_b, size_b) = active[b];
        let new_id = n + merges.len();
        let size = size_a + size_b;

        merges.push(Merge {
            left: id_a.min(id_b),
            right: id_a.max(id_b),
            distance: d_ab,
            size,
        });
        debug!(
            "Merged {} and {} into {} at distance {:.6}",
            id_a, id_b, new_id, d_ab
        );

        // Lance-Williams update of the new cluster's distances, stored in slot a.
        for m in 0..active.len() {
            if m == a || m == b {
                continue;
            }
            let size_m = active[m].1;
            let (d_am, d_bm) = (dist[a][m], dist[b][m]);
            let updated = match linkage {
                Linkage::Single => d_am.min(d_bm),
                Linkage::Complete => d_am.max(d_bm),
                Linkage::Average => {
                    (size_a as f64 * d_am + size_b as f64 * d_bm) / size as f64
                }
                Linkage::Ward => {
                    let (na, nb, nm) = (size_a as f64, size_b as f64, size_m as f64);
                    let total = na + nb + nm;
                    (((na + nm) * d_am * d_am + (nb + nm) * d_bm * d_bm - nm * d_ab * d_ab)
                        / total)
                        .max(0.0)
                        .sqrt()
                }
            };
            dist[a][m] = updated;
            dist[m][a] = updated;
        }

        active[a] = (new_id, size);
        active.remove(b);
        dist.remove(b);
        for row in dist.iter_mut() {
            row.remove(b);
        }
    }

    Ok(ClusterTree {
        n_leaves: n,
        merges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::distance_matrix;

    fn three_asset_tree(linkage: Linkage) -> ClusterTree {
        let corr = vec![
            vec![1.0, 0.9, 0.1],
            vec![0.9, 1.0, 0.1],
            vec![0.1, 0.1, 1.0],
        ];
        cluster(&distance_matrix(&corr).unwrap(), linkage).unwrap()
    }

    #[test]
    fn test_correlated_pair_merges_first() {
        for linkage in [Linkage::Single, Linkage::Average, Linkage::Complete, Linkage::Ward] {
            let tree = three_asset_tree(linkage);
            assert_eq!(tree.merges().len(), 2);
            assert_eq!(tree.merges()[0].left, 0);
            assert_eq!(tree.merges()[0].right, 1);
            assert_eq!(tree.children(tree.root()), Some((2, 3)));
            assert_eq!(tree.leaf_order(), vec![2, 0, 1]);
        }
    }

    #[test]
    fn test_needs_two_assets() {
        let result = cluster(&[vec![0.0]], Linkage::Single);
        assert!(matches!(
            result,
            Err(AllocationError::InsufficientAssets { actual: 1, .. })
        ));
    }

    #[test]
    fn test_ties_break_on_lowest_ids() {
        // All pairs equidistant: 0 and 1 merge first, then 2 joins, then 3.
        let d = vec![
            vec![0.0, 1.0, 1.0, 1.0],
            vec![1.0, 0.0, 1.0, 1.0],
            vec![1.0, 1.0, 0.0, 1.0],
            vec![1.0, 1.0, 1.0, 0.0],
        ];
        let tree = cluster(&d, Linkage::Average).unwrap();
        assert_eq!((tree.merges()[0].left, tree.merges()[0].right), (0, 1));
        assert_eq!((tree.merges()[1].left, tree.merges()[1].right), (2, 3));
        assert_eq!((tree.merges()[2].left, tree.merges()[2].right), (4, 5));
        assert_eq!(tree.leaf_order(), vec![0, 1, 2, 3]);

        let again = cluster(&d, Linkage::Average).unwrap();
        assert_eq!(tree, again);
    }

    #[test]
    fn test_linkage_rules_differ() {
        // Two tight pairs (0,1) and (2,3) at different spreads.
        let d = vec![
            vec![0.0, 0.1, 0.6, 0.9],
            vec![0.1, 0.0, 0.5, 0.8],
            vec![0.6, 0.5, 0.0, 0.2],
            vec![0.9, 0.8, 0.2, 0.0],
        ];
        let single = cluster(&d, Linkage::Single).unwrap();
        let complete = cluster(&d, Linkage::Complete).unwrap();
        let average = cluster(&d, Linkage::Average).unwrap();

        assert!((single.merges()[2].distance - 0.5).abs() < 1e-12);
        assert!((complete.merges()[2].distance - 0.9).abs() < 1e-12);
        assert!((average.merges()[2].distance - 0.7).abs() < 1e-12);
        for tree in [&single, &complete, &average] {
            assert_eq!(tree.merges()[2].size, 4);
        }
    }

    #[test]
    fn test_cut_into_clusters() {
        let d = vec![
            vec![0.0, 0.1, 0.6, 0.9],
            vec![0.1, 0.0, 0.5, 0.8],
            vec![0.6, 0.5, 0.0, 0.2],
            vec![0.9, 0.8, 0.2, 0.0],
        ];
        let tree = cluster(&d, Linkage::Single).unwrap();

        assert_eq!(tree.cut(1).unwrap(), vec![vec![0, 1, 2, 3]]);
        assert_eq!(tree.cut(2).unwrap(), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(tree.cut(3).unwrap(), vec![vec![0, 1], vec![2], vec![3]]);
        assert_eq!(tree.cut(4).unwrap().len(), 4);

        assert!(matches!(
            tree.cut(0),
            Err(AllocationError::InvalidClusterCount { requested: 0, assets: 4 })
        ));
        assert!(tree.cut(5).is_err());
    }

    #[test]
    fn test_max_gap_cluster_count() {
        let d = vec![
            vec![0.0, 0.1, 0.6, 0.9],
            vec![0.1, 0.0, 0.5, 0.8],
            vec![0.6, 0.5, 0.0, 0.2],
            vec![0.9, 0.8, 0.2, 0.0],
        ];
        // Heights 0.1, 0.2, 0.5: the largest jump is before the final merge.
        let tree = cluster(&d, Linkage::Single).unwrap();
        assert_eq!(tree.max_gap_cluster_count(), 2);

        let pair = cluster(&[vec![0.0, 0.3], vec![0.3, 0.0]], Linkage::Single).unwrap();
        assert_eq!(pair.max_gap_cluster_count(), 1);
    }

    #[test]
    fn test_leaf_order_is_permutation() {
        let n = 12;
        let d: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 0.0 } else { ((i * 7 + j * 7) % 11) as f64 / 10.0 + 0.05 })
                    .collect()
            })
            .collect();
        let tree = cluster(&d, Linkage::Average).unwrap();
        let mut order = tree.leaf_order();
        assert_eq!(tree.merges().len(), n - 1);
        order.sort_unstable();
        assert_eq!(order, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_snapshot_orders_symbols() {
        let tree = three_asset_tree(Linkage::Average);
        let symbols: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let snapshot = ClusterSnapshot::new(&tree, &tree.leaf_order(), &symbols);
        assert_eq!(snapshot.ordered_symbols(), vec!["C", "A", "B"]);
        assert_eq!(snapshot.merges.len(), 2);
    }
}
