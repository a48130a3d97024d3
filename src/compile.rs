//! Compilation driver tying ids, propagation and planning together.

use log::info;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::graph::OperatorGraph;
use crate::mesh::DeviceMesh;
use crate::strategy::cost::CostModelConfig;
use crate::strategy::propagation::{self, Assignment};
use crate::strategy::redistribution::{self, RedistributionPlan};
use crate::strategy::{Strategy, StrategyTable};
use crate::types::NodeIndex;
use crate::utils::traits::WithCapacity;

/// Operator-id state shared across the compilations of one session.
///
/// Identities like `net/Mul-op3` must stay stable for the lifetime of a
/// strategy table, so the ordinal counter lives in an explicit context that
/// callers own instead of process-global state. Compiling two graphs with
/// the same context keeps their identities disjoint; [`reset`] starts a
/// fresh numbering when a table is rebuilt from scratch.
///
/// [`reset`]: CompileContext::reset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileContext {
    next_op_id: usize,
}

impl CompileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts operator numbering at zero. Strategy tables produced before
    /// the reset no longer match identities produced after it.
    pub fn reset(&mut self) {
        self.next_op_id = 0;
    }

    fn next_op_id(&mut self) -> usize {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }
}

/// The result of compiling one graph: stable identities, the chosen
/// strategy per operator and the layout conversions the choices imply.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGraph {
    identities: Vec<String>,
    assignments: Vec<Assignment>,
    table: StrategyTable,
    plan: RedistributionPlan,
    index: FxHashMap<String, NodeIndex>,
}

impl CompiledGraph {
    /// Identity of each operator, by node index.
    #[inline]
    #[must_use]
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// The strategy table, keyed by operator identity. Each entry holds the
    /// operand layouts of one operator.
    #[inline]
    #[must_use]
    pub fn table(&self) -> &StrategyTable {
        &self.table
    }

    /// The layout conversions inserted between mismatched edges.
    #[inline]
    #[must_use]
    pub fn redistributions(&self) -> &RedistributionPlan {
        &self.plan
    }

    /// Looks up the operand layouts of an operator by identity.
    #[must_use]
    pub fn get_strategy(&self, identity: &str) -> Option<&[Strategy]> {
        self.table.get(identity)
    }

    /// Looks up the full assignment, including the output layout.
    #[must_use]
    pub fn assignment(&self, identity: &str) -> Option<&Assignment> {
        self.index
            .get(identity)
            .map(|&index| &self.assignments[index])
    }
}

/// Compiles a graph with a fresh [`CompileContext`], numbering operators
/// from zero.
///
/// # Errors
/// See [`compile_with_context`].
pub fn compile(
    graph: &OperatorGraph,
    mesh: &DeviceMesh,
    config: &CostModelConfig,
) -> Result<CompiledGraph> {
    let mut context = CompileContext::new();
    compile_with_context(graph, mesh, config, &mut context)
}

/// Compiles a graph, drawing operator ordinals from `context`.
///
/// The graph itself is never modified; repeated compilation of the same
/// graph with a freshly reset context reproduces the identical table and
/// plan.
///
/// # Errors
/// Any [`CompileError`](crate::error::CompileError) raised by strategy
/// propagation or redistribution planning.
pub fn compile_with_context(
    graph: &OperatorGraph,
    mesh: &DeviceMesh,
    config: &CostModelConfig,
    context: &mut CompileContext,
) -> Result<CompiledGraph> {
    info!(
        nodes = graph.nodes().len(),
        subgraphs = graph.num_subgraphs(),
        devices = mesh.device_count();
        "compiling graph"
    );

    let identities: Vec<String> = graph
        .nodes()
        .iter()
        .map(|node| node.identity(context.next_op_id()))
        .collect();

    let assignments = propagation::propagate(graph, mesh, config, &identities)?;
    let plan = redistribution::plan(graph, &assignments, &identities)?;

    let mut table = StrategyTable::default();
    let mut index: FxHashMap<String, NodeIndex> =
        FxHashMap::with_capacity(identities.len());
    for (node_index, (identity, assignment)) in
        identities.iter().zip(&assignments).enumerate()
    {
        table.insert_new(identity.clone(), assignment.inputs.clone());
        index.insert(identity.clone(), node_index);
    }

    info!(
        operators = table.len(),
        conversions = plan.len();
        "compilation finished"
    );
    Ok(CompiledGraph {
        identities,
        assignments,
        table,
        plan,
        index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::graph::builder::GraphBuilder;
    use crate::graph::OperatorKind;
    use crate::shape;

    fn small_graph() -> OperatorGraph {
        let mut builder = GraphBuilder::new();
        builder.push_scope("net");
        let a = builder.input(shape![8, 8]);
        let x = builder.apply(OperatorKind::ReLU, &[a]).unwrap();
        builder.apply(OperatorKind::Mul, &[x, x]).unwrap();
        builder.finish()
    }

    #[test]
    fn test_identities_are_scoped_and_ordered() {
        let graph = small_graph();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let compiled = compile(&graph, &mesh, &CostModelConfig::default()).unwrap();
        assert_eq!(
            compiled.identities(),
            &["net/ReLU-op0".to_string(), "net/Mul-op1".to_string()]
        );
        assert!(compiled.get_strategy("net/Mul-op1").is_some());
        assert!(compiled.get_strategy("net/Mul-op99").is_none());
    }

    #[test]
    fn test_context_numbers_across_compilations() {
        let graph = small_graph();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let config = CostModelConfig::default();
        let mut context = CompileContext::new();

        let first = compile_with_context(&graph, &mesh, &config, &mut context).unwrap();
        let second = compile_with_context(&graph, &mesh, &config, &mut context).unwrap();
        assert_eq!(first.identities()[0], "net/ReLU-op0");
        assert_eq!(second.identities()[0], "net/ReLU-op2");

        context.reset();
        let third = compile_with_context(&graph, &mesh, &config, &mut context).unwrap();
        assert_eq!(third.identities(), first.identities());
    }

    #[test]
    fn test_recompilation_is_reproducible() {
        let graph = small_graph();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let config = CostModelConfig::default();
        let first = compile(&graph, &mesh, &config).unwrap();
        let second = compile(&graph, &mesh, &config).unwrap();
        assert_eq!(first.table(), second.table());
        assert_eq!(first.redistributions(), second.redistributions());
    }

    #[test]
    fn test_assignment_exposes_output_layout() {
        let graph = small_graph();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let compiled = compile(&graph, &mesh, &CostModelConfig::default()).unwrap();
        let assignment = compiled.assignment("net/ReLU-op0").unwrap();
        assert_eq!(assignment.output, assignment.inputs[0]);
    }
}
