//! Pure cost functions over candidate strategies.
//!
//! All functions here are pure in their arguments so the propagator can
//! memoize them freely. Costs are abstract volume units (tensor elements),
//! not wall-clock estimates. Every function shares the signature recorded
//! in the catalog's per-kind dispatch table.

use serde::{Deserialize, Serialize};

use crate::graph::OperatorKind;
use crate::mesh::DeviceMesh;
use crate::strategy::Strategy;
use crate::types::{resolve_axis, TensorShape};

/// Configuration of the cost model for one compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostModelConfig {
    /// Optimize each subgraph with its own independent search pass instead
    /// of assuming a single global optimum. Required when a parameter is
    /// consumed by more than one independently compiled loss head.
    pub multi_subgraphs: bool,
    /// Skip exact communication-volume computation in favor of a cheaper
    /// heuristic, trading search time for solution quality.
    pub approximate: bool,
}

/// Signature shared by all per-kind local cost functions.
pub(crate) type LocalCostFn =
    fn(&OperatorKind, &[Strategy], &[TensorShape], &DeviceMesh, &CostModelConfig) -> f64;

/// Returns the local execution cost of an elementwise operator: the number
/// of elements each device touches, summed over operands.
///
/// # Examples
/// ```
/// # use shardplan::{shape, strategy};
/// # use shardplan::graph::OperatorKind;
/// # use shardplan::mesh::DeviceMesh;
/// # use shardplan::strategy::cost::{elementwise_cost, CostModelConfig};
/// let mesh = DeviceMesh::linear(8, 0).unwrap();
/// let cost = elementwise_cost(
///     &OperatorKind::Mul,
///     &[strategy![8, 1], strategy![8, 1]],
///     &[shape![8, 8], shape![8, 8]],
///     &mesh,
///     &CostModelConfig::default(),
/// );
/// assert_eq!(cost, 16.0); // two operands, 64 elements each, 8 shards
/// ```
#[must_use]
pub fn elementwise_cost(
    _kind: &OperatorKind,
    strategies: &[Strategy],
    input_shapes: &[TensorShape],
    _mesh: &DeviceMesh,
    _config: &CostModelConfig,
) -> f64 {
    strategies
        .iter()
        .zip(input_shapes)
        .map(|(s, shape)| shape.elements() / s.total_splits() as f64)
        .sum()
}

/// Returns the local execution cost of a reduction: reading the sharded
/// input plus writing the (one axis smaller) output.
#[must_use]
pub fn reduction_cost(
    kind: &OperatorKind,
    strategies: &[Strategy],
    input_shapes: &[TensorShape],
    mesh: &DeviceMesh,
    config: &CostModelConfig,
) -> f64 {
    let read = elementwise_cost(kind, strategies, input_shapes, mesh, config);
    let input = &input_shapes[0];
    let axis = match kind {
        OperatorKind::ReduceSum { axis } | OperatorKind::ReduceMean { axis } => {
            resolve_axis(*axis, input.rank())
        }
        _ => None,
    };
    // The reduced axis is never split, so the partial results are already
    // complete and the write volume is the output size per shard.
    let reduced_len = axis.map_or(1.0, |a| input.dims()[a] as f64);
    let local_input = input.elements() / strategies[0].total_splits() as f64;
    read + local_input / reduced_len
}

/// Returns the local execution cost of an axis normalization: one pass to
/// accumulate the norm and one to scale.
#[must_use]
pub fn normalize_cost(
    kind: &OperatorKind,
    strategies: &[Strategy],
    input_shapes: &[TensorShape],
    mesh: &DeviceMesh,
    config: &CostModelConfig,
) -> f64 {
    2.0 * elementwise_cost(kind, strategies, input_shapes, mesh, config)
}

/// Returns the communication volume of converting a tensor from one
/// strategy to another.
///
/// Exact mode computes the fraction of data that is already local from the
/// per-dimension overlap of the two shard grids; `approximate` charges the
/// full tensor volume for any mismatch.
///
/// # Examples
/// ```
/// # use shardplan::{shape, strategy};
/// # use shardplan::mesh::DeviceMesh;
/// # use shardplan::strategy::cost::{redistribution_cost, CostModelConfig};
/// let mesh = DeviceMesh::linear(8, 0).unwrap();
/// let config = CostModelConfig::default();
/// let shape = shape![8, 8];
/// // identical layouts move nothing
/// assert_eq!(
///     redistribution_cost(&strategy![8, 1], &strategy![8, 1], &shape, &mesh, &config),
///     0.0
/// );
/// // transposing the split moves all but the 1/64 diagonal overlap
/// assert_eq!(
///     redistribution_cost(&strategy![8, 1], &strategy![1, 8], &shape, &mesh, &config),
///     63.0
/// );
/// ```
#[must_use]
pub fn redistribution_cost(
    from: &Strategy,
    to: &Strategy,
    shape: &TensorShape,
    _mesh: &DeviceMesh,
    config: &CostModelConfig,
) -> f64 {
    debug_assert_eq!(from.rank(), to.rank(), "strategies must cover equal ranks");
    if from == to {
        return 0.0;
    }
    if config.approximate {
        return shape.elements();
    }
    let aligned: f64 = from
        .splits()
        .iter()
        .zip(to.splits())
        .map(|(&f, &t)| gcd(f, t) as f64 / f.max(t) as f64)
        .product();
    shape.elements() * (1.0 - aligned)
}

pub(crate) fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
