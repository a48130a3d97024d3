//! Per-operator sharding rules.
//!
//! Each supported [`OperatorKind`] maps to an [`OperatorBehavior`] record
//! describing how to enumerate its candidate strategies, how expensive a
//! candidate is locally and what output layout it produces. The propagator
//! never matches on operator kinds directly; everything it needs goes
//! through this table.

use std::fmt;

use itertools::Itertools;

use crate::graph::OperatorKind;
use crate::mesh::DeviceMesh;
use crate::strategy::cost::{
    elementwise_cost, gcd, normalize_cost, reduction_cost, CostModelConfig, LocalCostFn,
};
use crate::strategy::Strategy;
use crate::types::{resolve_axis, TensorShape};

/// Why the catalog could not produce candidates for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFailure {
    /// The operator kind has no entry in the catalog.
    Unsupported,
    /// No candidate uses the whole device mesh, so the operator cannot be
    /// placed without leaving devices idle.
    NoFeasible,
}

impl fmt::Display for CatalogFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CatalogFailure::Unsupported => f.write_str("no catalog entry"),
            CatalogFailure::NoFeasible => f.write_str("no mesh-filling candidate"),
        }
    }
}

/// One enumerated sharding option for an operator.
///
/// `inputs` holds the required layout per operand slot, `output` the layout
/// the operator produces under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub inputs: Vec<Strategy>,
    pub output: Strategy,
}

/// Sharding behavior of one operator kind.
pub(crate) struct OperatorBehavior {
    pub(crate) local_cost: LocalCostFn,
    /// Axes of the base shape that must stay unsplit.
    pinned_axes: fn(&OperatorKind, &TensorShape) -> Vec<usize>,
    /// Maps a base-shape strategy to the output layout.
    output_strategy: fn(&OperatorKind, &Strategy) -> Strategy,
}

fn no_pinned_axes(_kind: &OperatorKind, _base: &TensorShape) -> Vec<usize> {
    Vec::new()
}

fn axis_pinned(kind: &OperatorKind, base: &TensorShape) -> Vec<usize> {
    let axis = match kind {
        OperatorKind::ReduceSum { axis }
        | OperatorKind::ReduceMean { axis }
        | OperatorKind::L2Normalize { axis } => *axis,
        _ => return Vec::new(),
    };
    // Out-of-bounds axes are rejected at graph construction.
    resolve_axis(axis, base.rank()).into_iter().collect()
}

fn same_as_base(_kind: &OperatorKind, base: &Strategy) -> Strategy {
    base.clone()
}

fn base_without_axis(kind: &OperatorKind, base: &Strategy) -> Strategy {
    match kind {
        OperatorKind::ReduceSum { axis } | OperatorKind::ReduceMean { axis } => {
            match resolve_axis(*axis, base.rank()) {
                Some(a) => base.without_axis(a),
                None => base.clone(),
            }
        }
        _ => base.clone(),
    }
}

static ELEMENTWISE_BINARY: OperatorBehavior = OperatorBehavior {
    local_cost: elementwise_cost,
    pinned_axes: no_pinned_axes,
    output_strategy: same_as_base,
};

static ELEMENTWISE_UNARY: OperatorBehavior = OperatorBehavior {
    local_cost: elementwise_cost,
    pinned_axes: no_pinned_axes,
    output_strategy: same_as_base,
};

static REDUCTION: OperatorBehavior = OperatorBehavior {
    local_cost: reduction_cost,
    pinned_axes: axis_pinned,
    output_strategy: base_without_axis,
};

static NORMALIZE: OperatorBehavior = OperatorBehavior {
    local_cost: normalize_cost,
    pinned_axes: axis_pinned,
    output_strategy: same_as_base,
};

/// Looks up the behavior record of a kind; `None` for unsupported kinds.
pub(crate) fn behavior(kind: &OperatorKind) -> Option<&'static OperatorBehavior> {
    match kind {
        OperatorKind::Mul => Some(&ELEMENTWISE_BINARY),
        OperatorKind::ReLU => Some(&ELEMENTWISE_UNARY),
        OperatorKind::ReduceSum { .. } | OperatorKind::ReduceMean { .. } => Some(&REDUCTION),
        OperatorKind::L2Normalize { .. } => Some(&NORMALIZE),
        OperatorKind::Custom(_) => None,
    }
}

/// Enumerates all feasible candidates of an operator on a mesh.
///
/// Candidates are produced in descending lexicographic order of their base
/// split vectors, so the fully sharded layout on the leading dimension comes
/// first and the tie-breaking rules of the propagator stay deterministic.
///
/// # Errors
/// [`CatalogFailure::Unsupported`] for kinds without a catalog entry,
/// [`CatalogFailure::NoFeasible`] when no candidate occupies the whole mesh.
///
/// # Examples
/// ```
/// # use shardplan::{shape, strategy};
/// # use shardplan::graph::OperatorKind;
/// # use shardplan::mesh::DeviceMesh;
/// # use shardplan::strategy::catalog::candidate_strategies;
/// let mesh = DeviceMesh::linear(8, 0).unwrap();
/// let candidates =
///     candidate_strategies(&OperatorKind::ReLU, &[shape![8, 8, 8, 8]], &mesh).unwrap();
/// assert_eq!(candidates[0].output, strategy![8, 1, 1, 1]);
/// assert!(candidates
///     .iter()
///     .any(|c| c.output.total_splits() == mesh.device_count()));
/// ```
pub fn candidate_strategies(
    kind: &OperatorKind,
    input_shapes: &[TensorShape],
    mesh: &DeviceMesh,
) -> Result<Vec<Candidate>, CatalogFailure> {
    let behavior = behavior(kind).ok_or(CatalogFailure::Unsupported)?;
    let base = base_shape(kind, input_shapes);
    let pinned = (behavior.pinned_axes)(kind, &base);
    let devices = mesh.device_count();

    let per_dim: Vec<Vec<usize>> = base
        .dims()
        .iter()
        .enumerate()
        .map(|(axis, &dim)| {
            if pinned.contains(&axis) {
                vec![1]
            } else {
                divisors_desc(gcd(dim, devices))
            }
        })
        .collect();

    let candidates: Vec<Candidate> = per_dim
        .into_iter()
        .multi_cartesian_product()
        .filter(|splits| devices % splits.iter().product::<usize>() == 0)
        .map(|splits| {
            let strategy = Strategy::new(splits);
            let inputs = input_shapes
                .iter()
                .map(|shape| project(&strategy, &base, shape))
                .collect();
            let output = (behavior.output_strategy)(kind, &strategy);
            Candidate { inputs, output }
        })
        .collect();

    if !candidates
        .iter()
        .any(|c| c.inputs.iter().any(|s| s.total_splits() == devices)
            || c.output.total_splits() == devices)
    {
        return Err(CatalogFailure::NoFeasible);
    }
    Ok(candidates)
}

/// Dispatches the local cost of one candidate through the catalog.
pub(crate) fn local_cost(
    kind: &OperatorKind,
    candidate: &Candidate,
    input_shapes: &[TensorShape],
    mesh: &DeviceMesh,
    config: &CostModelConfig,
) -> f64 {
    match behavior(kind) {
        Some(b) => (b.local_cost)(kind, &candidate.inputs, input_shapes, mesh, config),
        None => f64::INFINITY,
    }
}

/// The shape that candidate split vectors range over: the broadcast output
/// shape for binary elementwise kinds, the input shape otherwise.
fn base_shape(kind: &OperatorKind, input_shapes: &[TensorShape]) -> TensorShape {
    match kind {
        OperatorKind::Mul => input_shapes[0]
            .broadcast(&input_shapes[1])
            .unwrap_or_else(|| input_shapes[0].clone()),
        _ => input_shapes[0].clone(),
    }
}

/// Projects a base-shape strategy onto one operand: broadcast dimensions of
/// size one cannot be split and fall back to a unit factor.
fn project(strategy: &Strategy, base: &TensorShape, operand: &TensorShape) -> Strategy {
    if operand == base {
        return strategy.clone();
    }
    let splits = strategy
        .splits()
        .iter()
        .zip(operand.dims())
        .map(|(&s, &dim)| if dim == 1 { 1 } else { s })
        .collect();
    Strategy::new(splits)
}

/// All divisors of `n` in descending order.
fn divisors_desc(n: usize) -> Vec<usize> {
    (1..=n).rev().filter(|d| n % d == 0).collect()
}
