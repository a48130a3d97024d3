//! Sharding strategies and the per-compilation strategy table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mesh::DeviceMesh;
use crate::types::TensorShape;
use crate::utils::traits::MapInsertNew;

pub mod catalog;
pub mod cost;
pub mod propagation;
pub mod redistribution;

/// How a tensor's dimensions are split across mesh devices: one split
/// factor per tensor dimension.
///
/// A strategy is feasible for a shape on a mesh when every factor divides
/// its dimension and the product of all factors divides the device count.
///
/// # Examples
/// ```
/// # use shardplan::{shape, strategy};
/// # use shardplan::mesh::DeviceMesh;
/// let mesh = DeviceMesh::linear(8, 0).unwrap();
/// let s = strategy![8, 1, 1, 1];
/// assert!(s.is_feasible_for(&shape![8, 8, 8, 8], &mesh));
/// assert!(!strategy![3, 1, 1, 1].is_feasible_for(&shape![8, 8, 8, 8], &mesh));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Strategy {
    splits: Vec<usize>,
}

impl Strategy {
    /// Constructs a strategy from per-dimension split factors.
    ///
    /// # Panics
    /// Panics if any factor is zero.
    #[must_use]
    pub fn new(splits: Vec<usize>) -> Self {
        assert!(
            splits.iter().all(|&s| s > 0),
            "split factors must be positive, got {splits:?}"
        );
        Self { splits }
    }

    /// The fully replicated strategy for a given rank (all factors 1).
    #[must_use]
    pub fn replicated(rank: usize) -> Self {
        Self {
            splits: vec![1; rank],
        }
    }

    /// Returns the per-dimension split factors.
    #[inline]
    #[must_use]
    pub fn splits(&self) -> &[usize] {
        &self.splits
    }

    /// Returns the number of dimensions this strategy covers.
    #[inline]
    #[must_use]
    pub fn rank(&self) -> usize {
        self.splits.len()
    }

    /// Returns the product of all split factors (number of shards).
    #[inline]
    #[must_use]
    pub fn total_splits(&self) -> usize {
        self.splits.iter().product()
    }

    /// Returns the number of dimensions actually split.
    #[must_use]
    pub fn non_unit_count(&self) -> usize {
        self.splits.iter().filter(|&&s| s > 1).count()
    }

    /// Checks feasibility against a shape and mesh.
    #[must_use]
    pub fn is_feasible_for(&self, shape: &TensorShape, mesh: &DeviceMesh) -> bool {
        self.rank() == shape.rank()
            && self
                .splits
                .iter()
                .zip(shape.dims())
                .all(|(&s, &d)| d % s == 0)
            && mesh.device_count() % self.total_splits() == 0
    }

    /// Returns the strategy with `axis` removed, mirroring a reduction's
    /// output layout.
    #[must_use]
    pub fn without_axis(&self, axis: usize) -> Self {
        let mut splits = self.splits.clone();
        splits.remove(axis);
        Self { splits }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.splits)
    }
}

/// Mapping from operator identity to the chosen per-input strategies.
///
/// Built once per compilation and read-only afterwards. Iteration and
/// serialization order is the identity order, so an unchanged graph
/// compiles to a byte-identical serialized table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyTable {
    entries: BTreeMap<String, Vec<Strategy>>,
}

impl StrategyTable {
    /// Looks up the per-input strategies chosen for an operator.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<&[Strategy]> {
        self.entries.get(identity).map(Vec::as_slice)
    }

    /// Iterates entries in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Strategy])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records an operator's chosen strategies.
    ///
    /// # Panics
    /// Panics if the identity is already present; identities are unique by
    /// construction.
    pub(crate) fn insert_new(&mut self, identity: String, strategies: Vec<Strategy>) {
        self.entries.insert_new(identity, strategies);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{shape, strategy};

    #[test]
    fn test_feasibility() {
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        assert!(strategy![2, 4, 1].is_feasible_for(&shape![128, 64, 64], &mesh));
        // 3 does not divide any 2-power dimension of the mesh product.
        assert!(!strategy![1, 3, 1].is_feasible_for(&shape![128, 63, 64], &mesh));
        // rank mismatch
        assert!(!strategy![2, 4].is_feasible_for(&shape![128, 64, 64], &mesh));
        // product 16 exceeds 8 devices
        assert!(!strategy![4, 4, 1].is_feasible_for(&shape![128, 64, 64], &mesh));
    }

    #[test]
    fn test_replicated_and_counts() {
        let s = Strategy::replicated(4);
        assert_eq!(s, strategy![1, 1, 1, 1]);
        assert_eq!(s.total_splits(), 1);
        assert_eq!(s.non_unit_count(), 0);
        assert_eq!(strategy![8, 1, 2, 1].non_unit_count(), 2);
    }

    #[test]
    fn test_without_axis() {
        assert_eq!(strategy![8, 1, 2, 1].without_axis(3), strategy![8, 1, 2]);
    }

    #[test]
    fn test_table_lookup_and_order() {
        let mut table = StrategyTable::default();
        table.insert_new("b/ReLU-op1".into(), vec![strategy![8, 1]]);
        table.insert_new("a/Mul-op0".into(), vec![strategy![8, 1], strategy![8, 1]]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("b/ReLU-op1"), Some(&[strategy![8, 1]][..]));
        assert_eq!(table.get("missing"), None);
        let keys: Vec<_> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a/Mul-op0", "b/ReLU-op1"]);
    }

    #[test]
    #[should_panic(expected = "already an entry")]
    fn test_table_rejects_duplicate_identity() {
        let mut table = StrategyTable::default();
        table.insert_new("Mul-op0".into(), vec![]);
        table.insert_new("Mul-op0".into(), vec![]);
    }
}
