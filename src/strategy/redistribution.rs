//! Layout conversions for edges whose strategies disagree.
//!
//! Per-subgraph optimization can legitimately leave a producer and a
//! consumer with different layouts for the same tensor. The planner walks
//! every edge after propagation and synthesizes the collective steps that
//! convert one layout into the other, so downstream scheduling only ever
//! sees matching layouts.

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::graph::{OperandSource, OperatorGraph};
use crate::strategy::cost::gcd;
use crate::strategy::propagation::Assignment;
use crate::strategy::Strategy;

/// One collective primitive of a layout conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformStep {
    /// Reassemble `factor` shards along `dim` on every device.
    AllGather { dim: usize, factor: usize },
    /// Keep one of `factor` slices along `dim` on every device.
    Slice { dim: usize, factor: usize },
    /// Exchange shards so `gather_dim` coarsens by `factor` while
    /// `slice_dim` refines by it; cheaper than a gather followed by an
    /// independent slice because only the moving fraction crosses the wire.
    AllToAll {
        gather_dim: usize,
        slice_dim: usize,
        factor: usize,
    },
}

/// A layout conversion inserted on one operand edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionOp {
    /// Identity of the consumer whose operand is converted.
    pub consumer: String,
    /// Operand slot of the consumer.
    pub slot: usize,
    pub from: Strategy,
    pub to: Strategy,
    pub steps: Vec<TransformStep>,
}

/// All conversions of one compilation, in deterministic (consumer, slot)
/// edge order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedistributionPlan {
    ops: Vec<RedistributionOp>,
}

impl RedistributionPlan {
    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[RedistributionOp] {
        &self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Looks up the conversion feeding one operand slot, if any.
    #[must_use]
    pub fn for_edge(&self, consumer: &str, slot: usize) -> Option<&RedistributionOp> {
        self.ops
            .iter()
            .find(|op| op.consumer == consumer && op.slot == slot)
    }
}

/// Builds the conversion plan for a propagated graph.
///
/// Node edges compare the producer's output layout with the consumer's
/// required layout. Parameter edges compare against the layout of the first
/// consumer in edge order, which becomes the layout the parameter is stored
/// in. Graph-input edges never get a conversion: the data pipeline shards
/// each batch directly into whatever the consumer asks for.
///
/// # Errors
/// [`CompileError::IrreducibleMismatch`] when two layouts cannot be related
/// by gather/slice steps. Propagation only produces rank-matched layouts,
/// so hitting this means an inconsistency between catalog and planner.
pub fn plan(
    graph: &OperatorGraph,
    assignments: &[Assignment],
    identities: &[String],
) -> Result<RedistributionPlan> {
    let mut parameter_layouts: FxHashMap<usize, Strategy> = FxHashMap::default();
    let mut ops = Vec::new();

    for edge in graph.edges() {
        let required = &assignments[edge.consumer].inputs[edge.slot];
        let provided = match edge.source {
            OperandSource::Input(_) => continue,
            OperandSource::Parameter(parameter) => parameter_layouts
                .entry(parameter)
                .or_insert_with(|| required.clone())
                .clone(),
            OperandSource::Node(producer) => assignments[producer].output.clone(),
        };
        if provided == *required {
            continue;
        }
        let edge_label = format!("{}[{}]", identities[edge.consumer], edge.slot);
        let steps = synthesize(&provided, required).map_err(|reason| {
            CompileError::IrreducibleMismatch {
                edge: edge_label.clone(),
                reason,
            }
        })?;
        debug!(
            edge = edge_label.as_str(),
            from:% = provided,
            to:% = required;
            "inserting layout conversion"
        );
        ops.push(RedistributionOp {
            consumer: identities[edge.consumer].clone(),
            slot: edge.slot,
            from: provided,
            to: required.clone(),
            steps,
        });
    }
    Ok(RedistributionPlan { ops })
}

/// Synthesizes the step sequence converting `from` into `to`.
///
/// Per dimension, the shared factor `gcd(f, t)` stays put; the surplus
/// `f / gcd` must be gathered and the deficit `t / gcd` sliced. Gathers and
/// slices on different dimensions are paired into [`TransformStep::AllToAll`]
/// exchanges as far as their factors overlap; the remainders become plain
/// gathers and slices.
fn synthesize(from: &Strategy, to: &Strategy) -> std::result::Result<Vec<TransformStep>, String> {
    if from.rank() != to.rank() {
        return Err(format!(
            "rank mismatch: {} vs {}",
            from.rank(),
            to.rank()
        ));
    }

    let mut gathers: Vec<(usize, usize)> = Vec::new();
    let mut slices: Vec<(usize, usize)> = Vec::new();
    for (dim, (&f, &t)) in from.splits().iter().zip(to.splits()).enumerate() {
        let shared = gcd(f, t);
        if f / shared > 1 {
            gathers.push((dim, f / shared));
        }
        if t / shared > 1 {
            slices.push((dim, t / shared));
        }
    }

    let mut steps = Vec::new();
    let mut gathers = gathers.into_iter().peekable();
    let mut slices = slices.into_iter().peekable();
    while let (Some(&(gather_dim, gather_factor)), Some(&(slice_dim, slice_factor))) =
        (gathers.peek(), slices.peek())
    {
        let factor = gcd(gather_factor, slice_factor);
        if factor == 1 {
            // nothing to exchange; fall through to plain gathers and slices
            break;
        }
        steps.push(TransformStep::AllToAll {
            gather_dim,
            slice_dim,
            factor,
        });
        advance(&mut gathers, factor);
        advance(&mut slices, factor);
    }
    for (dim, factor) in gathers {
        steps.push(TransformStep::AllGather { dim, factor });
    }
    for (dim, factor) in slices {
        steps.push(TransformStep::Slice { dim, factor });
    }
    Ok(steps)
}

/// Divides the factor at the front of the queue and pops it once exhausted.
fn advance(queue: &mut std::iter::Peekable<std::vec::IntoIter<(usize, usize)>>, by: usize) {
    if let Some((_, factor)) = queue.peek_mut() {
        *factor /= by;
        if *factor == 1 {
            queue.next();
        }
    }
}
