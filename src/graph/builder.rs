//! Incremental construction of [`OperatorGraph`]s with scoped identities.

use crate::error::{CompileError, Result};
use crate::graph::{OperandSource, OperatorGraph, OperatorKind, OperatorNode};
use crate::types::{SubgraphId, TensorShape};

/// Builds an [`OperatorGraph`] node by node.
///
/// Operands must exist before they are consumed, so graphs built here are
/// acyclic by construction and the node list is already in topological
/// order. Scopes nest and become the identity prefix of every node applied
/// while they are open.
///
/// # Examples
/// ```
/// # use shardplan::graph::builder::GraphBuilder;
/// # use shardplan::graph::OperatorKind;
/// # use shardplan::shape;
/// let mut b = GraphBuilder::new();
/// let x = b.input(shape![8, 8]);
/// b.push_scope("net");
/// let y = b.apply(OperatorKind::ReLU, &[x]).unwrap();
/// b.pop_scope();
/// let graph = b.finish();
/// assert_eq!(graph.nodes().len(), 1);
/// assert_eq!(graph.nodes()[0].scope(), "net");
/// ```
#[derive(Debug, Default)]
pub struct GraphBuilder {
    inputs: Vec<TensorShape>,
    parameters: Vec<TensorShape>,
    nodes: Vec<OperatorNode>,
    scope_stack: Vec<String>,
    subgraph: SubgraphId,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a graph input tensor and returns its operand handle.
    pub fn input(&mut self, shape: TensorShape) -> OperandSource {
        self.inputs.push(shape);
        OperandSource::Input(self.inputs.len() - 1)
    }

    /// Declares a trainable parameter and returns its operand handle.
    /// Parameters may be consumed from any subgraph.
    pub fn parameter(&mut self, shape: TensorShape) -> OperandSource {
        self.parameters.push(shape);
        OperandSource::Parameter(self.parameters.len() - 1)
    }

    /// Opens a scope; nodes applied until the matching [`pop_scope`]
    /// carry it as an identity prefix.
    ///
    /// [`pop_scope`]: GraphBuilder::pop_scope
    pub fn push_scope(&mut self, name: &str) {
        self.scope_stack.push(name.to_string());
    }

    /// Closes the innermost scope.
    pub fn pop_scope(&mut self) {
        self.scope_stack.pop();
    }

    /// Switches the subgraph that subsequently applied nodes belong to.
    pub fn set_subgraph(&mut self, subgraph: SubgraphId) {
        self.subgraph = subgraph;
    }

    /// Appends an operator node consuming the given operands.
    ///
    /// # Errors
    /// Returns [`CompileError::InvalidGraph`] on dangling operands, arity
    /// mismatch or shape-incompatible inputs.
    pub fn apply(&mut self, kind: OperatorKind, operands: &[OperandSource]) -> Result<OperandSource> {
        let mut input_shapes = Vec::with_capacity(operands.len());
        for &source in operands {
            let shape = self.resolve(source).ok_or_else(|| {
                CompileError::InvalidGraph(format!("operand {source:?} does not exist"))
            })?;
            input_shapes.push(shape.clone());
        }
        let output_shape = kind.output_shape(&input_shapes)?;
        self.nodes.push(OperatorNode::new(
            kind,
            operands.to_vec(),
            input_shapes,
            output_shape,
            self.subgraph,
            self.scope_stack.join("/"),
        ));
        Ok(OperandSource::Node(self.nodes.len() - 1))
    }

    /// Finalizes the graph.
    #[must_use]
    pub fn finish(self) -> OperatorGraph {
        // Construction guarantees the invariants OperatorGraph::new checks.
        OperatorGraph::new(self.inputs, self.parameters, self.nodes)
            .expect("builder-produced graph is always structurally valid")
    }

    fn resolve(&self, source: OperandSource) -> Option<&TensorShape> {
        match source {
            OperandSource::Input(i) => self.inputs.get(i),
            OperandSource::Parameter(i) => self.parameters.get(i),
            OperandSource::Node(i) => self.nodes.get(i).map(OperatorNode::output_shape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::shape;

    #[test]
    fn test_builder_tracks_scopes_and_subgraphs() {
        let mut b = GraphBuilder::new();
        let x = b.input(shape![8, 8, 8, 8]);
        let w = b.parameter(shape![8, 8, 8, 8]);
        b.push_scope("network");
        b.push_scope("net");
        let mul = b.apply(OperatorKind::Mul, &[x, w]).unwrap();
        b.pop_scope();
        b.set_subgraph(1);
        let sum = b.apply(OperatorKind::ReduceSum { axis: -1 }, &[mul]).unwrap();
        b.pop_scope();
        let graph = b.finish();

        assert_eq!(graph.nodes()[0].scope(), "network/net");
        assert_eq!(graph.nodes()[0].subgraph(), 0);
        assert_eq!(graph.nodes()[1].scope(), "network");
        assert_eq!(graph.nodes()[1].subgraph(), 1);
        assert_eq!(graph.num_subgraphs(), 2);
        assert_eq!(sum, OperandSource::Node(1));
    }

    #[test]
    fn test_builder_rejects_incompatible_operands() {
        let mut b = GraphBuilder::new();
        let x = b.input(shape![8, 4]);
        let y = b.input(shape![8, 3]);
        let err = b.apply(OperatorKind::Mul, &[x, y]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }

    #[test]
    fn test_builder_rejects_dangling_operand() {
        let mut b = GraphBuilder::new();
        let err = b
            .apply(OperatorKind::ReLU, &[OperandSource::Node(3)])
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidGraph(_)));
    }
}
