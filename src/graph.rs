//! Computation-graph representation consumed by the strategy engine.
//!
//! The graph is an ordered list of operator nodes over a set of graph inputs
//! and trainable parameters. Nodes carry the subgraph they belong to (one
//! subgraph per independently optimized loss head) and an optional scope
//! used to form stable operator identities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};
use crate::types::{resolve_axis, NodeIndex, SubgraphId, TensorShape};

pub mod builder;

/// The closed set of operator kinds known to the engine.
///
/// Sharding behavior is dispatched through a lookup in the strategy catalog;
/// adding a kind means adding one catalog entry. [`OperatorKind::Custom`]
/// represents an operator the runtime can trace but the catalog has no
/// sharding rules for; compiling a graph containing one fails with
/// [`CompileError::UnsupportedOperator`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Elementwise multiplication with broadcasting.
    Mul,
    /// Elementwise rectified linear unit.
    ReLU,
    /// Sum reduction over one axis; the reduced axis is removed.
    ReduceSum { axis: isize },
    /// Mean reduction over one axis; the reduced axis is removed.
    ReduceMean { axis: isize },
    /// L2 normalization along one axis; shape preserving.
    L2Normalize { axis: isize },
    /// An operator kind without catalog support.
    Custom(String),
}

impl OperatorKind {
    /// Returns the kind name used in operator identities.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            OperatorKind::Mul => "Mul",
            OperatorKind::ReLU => "ReLU",
            OperatorKind::ReduceSum { .. } => "ReduceSum",
            OperatorKind::ReduceMean { .. } => "ReduceMean",
            OperatorKind::L2Normalize { .. } => "L2Normalize",
            OperatorKind::Custom(name) => name,
        }
    }

    /// Returns the number of operands this kind consumes, or `None` when the
    /// arity is not fixed.
    #[must_use]
    pub fn arity(&self) -> Option<usize> {
        match self {
            OperatorKind::Mul => Some(2),
            OperatorKind::ReLU
            | OperatorKind::ReduceSum { .. }
            | OperatorKind::ReduceMean { .. }
            | OperatorKind::L2Normalize { .. } => Some(1),
            OperatorKind::Custom(_) => None,
        }
    }

    /// Computes the output shape for the given input shapes.
    ///
    /// # Errors
    /// Returns [`CompileError::InvalidGraph`] on arity mismatch,
    /// non-broadcastable operands or an out-of-bounds axis.
    pub fn output_shape(&self, input_shapes: &[TensorShape]) -> Result<TensorShape> {
        if let Some(arity) = self.arity() {
            if input_shapes.len() != arity {
                return Err(CompileError::InvalidGraph(format!(
                    "{} expects {arity} operand(s), got {}",
                    self.name(),
                    input_shapes.len()
                )));
            }
        } else if input_shapes.is_empty() {
            return Err(CompileError::InvalidGraph(format!(
                "{} expects at least one operand",
                self.name()
            )));
        }
        match self {
            OperatorKind::Mul => {
                input_shapes[0]
                    .broadcast(&input_shapes[1])
                    .ok_or_else(|| {
                        CompileError::InvalidGraph(format!(
                            "Mul operands {} and {} are not broadcast compatible",
                            input_shapes[0], input_shapes[1]
                        ))
                    })
            }
            OperatorKind::ReLU => Ok(input_shapes[0].clone()),
            OperatorKind::ReduceSum { axis } | OperatorKind::ReduceMean { axis } => {
                let rank = input_shapes[0].rank();
                let axis = resolve_axis(*axis, rank).ok_or_else(|| {
                    CompileError::InvalidGraph(format!(
                        "{} axis {axis} out of bounds for rank {rank}",
                        self.name()
                    ))
                })?;
                Ok(input_shapes[0].without_axis(axis))
            }
            OperatorKind::L2Normalize { axis } => {
                let rank = input_shapes[0].rank();
                resolve_axis(*axis, rank).ok_or_else(|| {
                    CompileError::InvalidGraph(format!(
                        "L2Normalize axis {axis} out of bounds for rank {rank}"
                    ))
                })?;
                Ok(input_shapes[0].clone())
            }
            // No shape semantics are registered; assume shape preserving.
            OperatorKind::Custom(_) => Ok(input_shapes[0].clone()),
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an operator input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperandSource {
    /// A graph input tensor (fed by the data pipeline).
    Input(usize),
    /// A trainable parameter, shared read-only across subgraphs.
    Parameter(usize),
    /// The output of another operator node.
    Node(NodeIndex),
}

/// One producer-to-consumer data dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub source: OperandSource,
    pub consumer: NodeIndex,
    /// Input slot of the consumer this edge feeds.
    pub slot: usize,
}

/// One instance of a computation-graph operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    kind: OperatorKind,
    inputs: Vec<OperandSource>,
    input_shapes: Vec<TensorShape>,
    output_shape: TensorShape,
    subgraph: SubgraphId,
    scope: String,
}

impl OperatorNode {
    /// Constructs a node. Callers normally go through
    /// [`GraphBuilder`](builder::GraphBuilder), which resolves operand
    /// shapes and validates them against the kind.
    #[must_use]
    pub fn new(
        kind: OperatorKind,
        inputs: Vec<OperandSource>,
        input_shapes: Vec<TensorShape>,
        output_shape: TensorShape,
        subgraph: SubgraphId,
        scope: String,
    ) -> Self {
        Self {
            kind,
            inputs,
            input_shapes,
            output_shape,
            subgraph,
            scope,
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    #[inline]
    #[must_use]
    pub fn inputs(&self) -> &[OperandSource] {
        &self.inputs
    }

    #[inline]
    #[must_use]
    pub fn input_shapes(&self) -> &[TensorShape] {
        &self.input_shapes
    }

    #[inline]
    #[must_use]
    pub fn output_shape(&self) -> &TensorShape {
        &self.output_shape
    }

    #[inline]
    #[must_use]
    pub fn subgraph(&self) -> SubgraphId {
        self.subgraph
    }

    #[inline]
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Formats the stable identity of this node given its compilation
    /// ordinal, e.g. `network/Mul-op2`.
    #[must_use]
    pub fn identity(&self, ordinal: usize) -> String {
        if self.scope.is_empty() {
            format!("{}-op{ordinal}", self.kind.name())
        } else {
            format!("{}/{}-op{ordinal}", self.scope, self.kind.name())
        }
    }
}

/// An ordered operator list over graph inputs and shared parameters.
///
/// The graph exclusively owns its nodes; the strategy table produced by a
/// compilation refers into it by operator identity only.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorGraph {
    inputs: Vec<TensorShape>,
    parameters: Vec<TensorShape>,
    nodes: Vec<OperatorNode>,
}

impl OperatorGraph {
    /// Assembles a graph from parts, validating operand references and
    /// recorded shapes. Cycles are not rejected here; they surface as
    /// [`CompileError::CyclicGraph`] during propagation.
    pub fn new(
        inputs: Vec<TensorShape>,
        parameters: Vec<TensorShape>,
        nodes: Vec<OperatorNode>,
    ) -> Result<Self> {
        let graph = Self {
            inputs,
            parameters,
            nodes,
        };
        for (index, node) in graph.nodes.iter().enumerate() {
            if node.inputs.len() != node.input_shapes.len() {
                return Err(CompileError::InvalidGraph(format!(
                    "node {index}: {} operands but {} shapes",
                    node.inputs.len(),
                    node.input_shapes.len()
                )));
            }
            for (slot, source) in node.inputs.iter().enumerate() {
                let resolved = graph.source_shape(*source).ok_or_else(|| {
                    CompileError::InvalidGraph(format!(
                        "node {index} slot {slot}: dangling operand reference {source:?}"
                    ))
                })?;
                if resolved != &node.input_shapes[slot] {
                    return Err(CompileError::InvalidGraph(format!(
                        "node {index} slot {slot}: recorded shape {} does not match source shape {resolved}",
                        node.input_shapes[slot]
                    )));
                }
            }
            let expected = node.kind.output_shape(&node.input_shapes)?;
            if expected != node.output_shape {
                return Err(CompileError::InvalidGraph(format!(
                    "node {index}: output shape {} does not match {} semantics",
                    node.output_shape,
                    node.kind.name()
                )));
            }
        }
        Ok(graph)
    }

    #[inline]
    #[must_use]
    pub fn nodes(&self) -> &[OperatorNode] {
        &self.nodes
    }

    #[inline]
    #[must_use]
    pub fn inputs(&self) -> &[TensorShape] {
        &self.inputs
    }

    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[TensorShape] {
        &self.parameters
    }

    /// Returns the number of subgraphs (max subgraph id + 1; at least one).
    #[must_use]
    pub fn num_subgraphs(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.subgraph + 1)
            .max()
            .unwrap_or(1)
    }

    /// Resolves the tensor shape behind an operand source.
    #[must_use]
    pub fn source_shape(&self, source: OperandSource) -> Option<&TensorShape> {
        match source {
            OperandSource::Input(i) => self.inputs.get(i),
            OperandSource::Parameter(i) => self.parameters.get(i),
            OperandSource::Node(i) => self.nodes.get(i).map(OperatorNode::output_shape),
        }
    }

    /// Enumerates all edges in deterministic (consumer, slot) order.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for (consumer, node) in self.nodes.iter().enumerate() {
            for (slot, &source) in node.inputs.iter().enumerate() {
                edges.push(Edge {
                    source,
                    consumer,
                    slot,
                });
            }
        }
        edges
    }

    /// Returns the out-degree (number of consuming slots) of each node.
    #[must_use]
    pub fn fan_out(&self) -> Vec<usize> {
        let mut fan_out = vec![0; self.nodes.len()];
        for node in &self.nodes {
            for &source in &node.inputs {
                if let OperandSource::Node(p) = source {
                    fan_out[p] += 1;
                }
            }
        }
        fan_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::shape;

    #[test]
    fn test_output_shape_elementwise() {
        let kind = OperatorKind::Mul;
        let out = kind
            .output_shape(&[shape![8, 1, 4], shape![8, 3, 4]])
            .unwrap();
        assert_eq!(out, shape![8, 3, 4]);
    }

    #[test]
    fn test_output_shape_reduction_removes_axis() {
        let kind = OperatorKind::ReduceSum { axis: -1 };
        let out = kind.output_shape(&[shape![8, 8, 8, 8]]).unwrap();
        assert_eq!(out, shape![8, 8, 8]);
    }

    #[test]
    fn test_output_shape_arity_mismatch() {
        let err = OperatorKind::Mul.output_shape(&[shape![4]]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }

    #[test]
    fn test_output_shape_axis_out_of_bounds() {
        let err = OperatorKind::ReduceMean { axis: 3 }
            .output_shape(&[shape![4, 4]])
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }

    #[test]
    fn test_identity_formatting() {
        let node = OperatorNode::new(
            OperatorKind::ReLU,
            vec![OperandSource::Input(0)],
            vec![shape![4]],
            shape![4],
            0,
            "network/net".into(),
        );
        assert_eq!(node.identity(2), "network/net/ReLU-op2");

        let unscoped = OperatorNode::new(
            OperatorKind::ReLU,
            vec![OperandSource::Input(0)],
            vec![shape![4]],
            shape![4],
            0,
            String::new(),
        );
        assert_eq!(unscoped.identity(0), "ReLU-op0");
    }

    #[test]
    fn test_graph_rejects_dangling_reference() {
        let node = OperatorNode::new(
            OperatorKind::ReLU,
            vec![OperandSource::Node(7)],
            vec![shape![4]],
            shape![4],
            0,
            String::new(),
        );
        let err = OperatorGraph::new(vec![], vec![], vec![node]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }

    #[test]
    fn test_graph_rejects_shape_mismatch() {
        let node = OperatorNode::new(
            OperatorKind::ReLU,
            vec![OperandSource::Input(0)],
            vec![shape![8]],
            shape![8],
            0,
            String::new(),
        );
        let err = OperatorGraph::new(vec![shape![4]], vec![], vec![node]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }
}
