//! Cost-driven strategy propagation.
//!
//! Propagation assigns every operator one candidate from the catalog. A
//! forward pass accumulates, per candidate, the cheapest cost of reaching it
//! from the graph sources; a backward pass then fixes the choices in reverse
//! topological order so every node sees the layouts its consumers settled
//! on. With `multi_subgraphs` enabled each subgraph runs its own pass in id
//! order and treats producers fixed by earlier passes as immutable.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::debug;
use ordered_float::NotNan;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{CompileError, Result};
use crate::graph::{OperandSource, OperatorGraph, OperatorNode};
use crate::mesh::DeviceMesh;
use crate::strategy::catalog::{self, Candidate, CatalogFailure};
use crate::strategy::cost::{redistribution_cost, CostModelConfig};
use crate::strategy::Strategy;
use crate::types::NodeIndex;
use crate::utils::traits::WithCapacity;

/// The strategy assignment of one operator: one layout per operand slot and
/// the layout of its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub inputs: Vec<Strategy>,
    pub output: Strategy,
}

/// Assigns a strategy to every node of the graph.
///
/// `identities` must hold the stable identity of each node by index; it is
/// used in error reports and log records only.
///
/// # Errors
/// [`CompileError::CyclicGraph`] when no topological order exists,
/// [`CompileError::UnsupportedOperator`] and
/// [`CompileError::NoFeasibleStrategy`] forwarded from the catalog, and
/// [`CompileError::NoFeasibleAssignment`] when selection runs out of
/// candidates.
pub fn propagate(
    graph: &OperatorGraph,
    mesh: &DeviceMesh,
    config: &CostModelConfig,
    identities: &[String],
) -> Result<Vec<Assignment>> {
    let order = topological_order(graph)?;
    let fan_out = graph.fan_out();

    let passes: Vec<Vec<NodeIndex>> = if config.multi_subgraphs {
        let mut passes = vec![Vec::new(); graph.num_subgraphs()];
        for &index in &order {
            passes[graph.nodes()[index].subgraph()].push(index);
        }
        passes
    } else {
        vec![order]
    };

    let mut fixed: Vec<Option<Assignment>> = vec![None; graph.nodes().len()];
    for pass in passes.iter().filter(|pass| !pass.is_empty()) {
        run_pass(graph, mesh, config, identities, pass, &fan_out, &mut fixed)?;
    }
    Ok(fixed
        .into_iter()
        .map(|assignment| assignment.expect("every node belongs to exactly one pass"))
        .collect())
}

/// Kahn's algorithm with a min-heap frontier, so the order is deterministic
/// for a given node numbering.
fn topological_order(graph: &OperatorGraph) -> Result<Vec<NodeIndex>> {
    let nodes = graph.nodes();
    let mut indegree = vec![0_usize; nodes.len()];
    let mut consumers: Vec<Vec<NodeIndex>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for &source in node.inputs() {
            if let OperandSource::Node(producer) = source {
                indegree[index] += 1;
                consumers[producer].push(index);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &consumer in &consumers[index] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(CompileError::CyclicGraph);
    }
    Ok(order)
}

#[allow(clippy::too_many_arguments)]
fn run_pass(
    graph: &OperatorGraph,
    mesh: &DeviceMesh,
    config: &CostModelConfig,
    identities: &[String],
    pass: &[NodeIndex],
    fan_out: &[usize],
    fixed: &mut [Option<Assignment>],
) -> Result<()> {
    let nodes = graph.nodes();

    let mut candidates: FxHashMap<NodeIndex, Vec<Candidate>> =
        FxHashMap::with_capacity(pass.len());
    for &index in pass {
        let node = &nodes[index];
        let enumerated = catalog::candidate_strategies(node.kind(), node.input_shapes(), mesh)
            .map_err(|failure| match failure {
                CatalogFailure::Unsupported => CompileError::UnsupportedOperator {
                    kind: node.kind().name().to_string(),
                },
                CatalogFailure::NoFeasible => CompileError::NoFeasibleStrategy {
                    identity: identities[index].clone(),
                },
            })?;
        debug!(
            identity = identities[index].as_str(),
            count = enumerated.len();
            "enumerated candidate strategies"
        );
        candidates.insert(index, enumerated);
    }

    // Forward: cheapest cumulative cost of ending up in each candidate.
    let mut cumulative: FxHashMap<NodeIndex, Vec<f64>> = FxHashMap::with_capacity(pass.len());
    for &index in pass {
        let node = &nodes[index];
        let fixed_view: &[Option<Assignment>] = fixed;
        let costs: Vec<f64> = candidates[&index]
            .par_iter()
            .map(|candidate| {
                let mut cost =
                    catalog::local_cost(node.kind(), candidate, node.input_shapes(), mesh, config);
                for (slot, &source) in node.inputs().iter().enumerate() {
                    cost += incoming_cost(
                        mesh, config, &candidates, &cumulative, fixed_view, fan_out, node, source,
                        slot, candidate,
                    );
                }
                cost
            })
            .collect();
        cumulative.insert(index, costs);
    }

    // Backward: fix choices against the consumers settled so far.
    for &index in pass.iter().rev() {
        let node = &nodes[index];
        let node_candidates = &candidates[&index];
        let cumulative_costs = &cumulative[&index];

        let consumer_edges = fixed_consumer_edges(nodes, fixed, index);
        // The widest-fan-out consumer dominates the tie-break: aligning with
        // it avoids the redistribution most likely to be shared.
        let key_edge = consumer_edges
            .iter()
            .copied()
            .max_by_key(|&(consumer, slot)| (fan_out[consumer], Reverse(consumer), Reverse(slot)));

        let choice = node_candidates
            .iter()
            .enumerate()
            .map(|(rank, candidate)| {
                let downstream: f64 = consumer_edges
                    .iter()
                    .map(|&edge| edge_cost(mesh, config, fixed, node, candidate, edge))
                    .sum();
                let key_cost =
                    key_edge.map_or(0.0, |edge| edge_cost(mesh, config, fixed, node, candidate, edge));
                let non_unit: usize = candidate
                    .inputs
                    .iter()
                    .map(Strategy::non_unit_count)
                    .sum::<usize>()
                    + candidate.output.non_unit_count();
                (cumulative_costs[rank] + downstream, key_cost, non_unit, rank)
            })
            .min_by_key(|&(score, key_cost, non_unit, rank)| {
                (ordered(score), ordered(key_cost), non_unit, rank)
            })
            .ok_or_else(|| CompileError::NoFeasibleAssignment {
                identity: identities[index].clone(),
            })?;

        let candidate = &node_candidates[choice.3];
        debug!(
            identity = identities[index].as_str(),
            strategy:% = candidate.output,
            score = choice.0;
            "selected strategy"
        );
        fixed[index] = Some(Assignment {
            inputs: candidate.inputs.clone(),
            output: candidate.output.clone(),
        });
    }
    Ok(())
}

/// Cost contribution of one operand edge under a consumer candidate.
#[allow(clippy::too_many_arguments)]
fn incoming_cost(
    mesh: &DeviceMesh,
    config: &CostModelConfig,
    candidates: &FxHashMap<NodeIndex, Vec<Candidate>>,
    cumulative: &FxHashMap<NodeIndex, Vec<f64>>,
    fixed: &[Option<Assignment>],
    fan_out: &[usize],
    node: &OperatorNode,
    source: OperandSource,
    slot: usize,
    candidate: &Candidate,
) -> f64 {
    let required = &candidate.inputs[slot];
    let shape = &node.input_shapes()[slot];
    let producer = match source {
        // Graph inputs and parameters take whatever initial layout the
        // consumers agree on, so the edge itself is free.
        OperandSource::Input(_) | OperandSource::Parameter(_) => return 0.0,
        OperandSource::Node(producer) => producer,
    };
    if let Some(assignment) = &fixed[producer] {
        return redistribution_cost(&assignment.output, required, shape, mesh, config);
    }
    match (candidates.get(&producer), cumulative.get(&producer)) {
        (Some(producer_candidates), Some(producer_costs)) => {
            // Spread the producer's cumulative cost across its consumers so
            // shared prefixes are not charged once per edge.
            let share = fan_out[producer].max(1) as f64;
            producer_candidates
                .iter()
                .zip(producer_costs)
                .map(|(producer_candidate, &cost)| {
                    cost / share
                        + redistribution_cost(&producer_candidate.output, required, shape, mesh, config)
                })
                .fold(f64::INFINITY, f64::min)
        }
        // Producer owned by a later pass; its layout is still open and the
        // redistribution planner reconciles whatever it settles on.
        _ => 0.0,
    }
}

/// Edges from `producer` into consumers whose assignment is already fixed.
fn fixed_consumer_edges(
    nodes: &[OperatorNode],
    fixed: &[Option<Assignment>],
    producer: NodeIndex,
) -> Vec<(NodeIndex, usize)> {
    let mut edges = Vec::new();
    for (consumer, node) in nodes.iter().enumerate() {
        if fixed[consumer].is_none() {
            continue;
        }
        for (slot, &source) in node.inputs().iter().enumerate() {
            if source == OperandSource::Node(producer) {
                edges.push((consumer, slot));
            }
        }
    }
    edges
}

fn edge_cost(
    mesh: &DeviceMesh,
    config: &CostModelConfig,
    fixed: &[Option<Assignment>],
    producer: &OperatorNode,
    candidate: &Candidate,
    (consumer, slot): (NodeIndex, usize),
) -> f64 {
    let assignment = fixed[consumer]
        .as_ref()
        .expect("consumer edges are collected from fixed nodes only");
    redistribution_cost(
        &candidate.output,
        &assignment.inputs[slot],
        producer.output_shape(),
        mesh,
        config,
    )
}

// Costs come from finite arithmetic over positive dimensions; NaN here would
// be a cost-model bug worth crashing on.
fn ordered(cost: f64) -> NotNan<f64> {
    NotNan::new(cost).expect("cost is NaN")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::graph::builder::GraphBuilder;
    use crate::graph::{OperatorKind, OperatorNode};
    use crate::{shape, strategy};

    fn identities(graph: &OperatorGraph) -> Vec<String> {
        graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(index, node)| node.identity(index))
            .collect()
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![8, 8]);
        let x = builder.apply(OperatorKind::ReLU, &[a]).unwrap();
        let y = builder.apply(OperatorKind::ReLU, &[a]).unwrap();
        builder.apply(OperatorKind::Mul, &[x, y]).unwrap();
        let graph = builder.finish();
        assert_eq!(topological_order(&graph).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        // self-referential node, assembled by hand since the builder cannot
        // express it
        let node = OperatorNode::new(
            OperatorKind::ReLU,
            vec![crate::graph::OperandSource::Node(0)],
            vec![shape![8]],
            shape![8],
            0,
            String::new(),
        );
        let graph = OperatorGraph::new(vec![], vec![], vec![node]).unwrap();
        let err = topological_order(&graph).unwrap_err();
        assert_eq!(err, CompileError::CyclicGraph);
    }

    #[test]
    fn test_aligned_chain_has_no_mismatch() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![8, 8, 8, 8]);
        let x = builder.apply(OperatorKind::ReLU, &[a]).unwrap();
        builder
            .apply(OperatorKind::ReduceSum { axis: -1 }, &[x])
            .unwrap();
        let graph = builder.finish();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let ids = identities(&graph);
        let assignments =
            propagate(&graph, &mesh, &CostModelConfig::default(), &ids).unwrap();

        assert_eq!(assignments[0].output, strategy![8, 1, 1, 1]);
        assert_eq!(assignments[1].inputs[0], strategy![8, 1, 1, 1]);
        assert_eq!(assignments[1].output, strategy![8, 1, 1]);
    }

    #[test]
    fn test_pinned_axis_pushes_split_off_the_leading_dim() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![128, 64, 64]);
        let n = builder
            .apply(OperatorKind::L2Normalize { axis: 0 }, &[a])
            .unwrap();
        builder.apply(OperatorKind::Mul, &[n, n]).unwrap();
        let graph = builder.finish();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let ids = identities(&graph);
        let assignments =
            propagate(&graph, &mesh, &CostModelConfig::default(), &ids).unwrap();

        // axis 0 is pinned upstream; the consumer follows rather than paying
        // for a relayout
        assert_eq!(assignments[0].output, strategy![1, 8, 1]);
        assert_eq!(assignments[1].inputs[0], strategy![1, 8, 1]);
        assert_eq!(assignments[1].output, strategy![1, 8, 1]);
    }

    #[test]
    fn test_unsupported_kind_names_the_operator() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![8, 8]);
        builder
            .apply(OperatorKind::Custom("FancyOp".into()), &[a])
            .unwrap();
        let graph = builder.finish();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let ids = identities(&graph);
        let err = propagate(&graph, &mesh, &CostModelConfig::default(), &ids).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnsupportedOperator {
                kind: "FancyOp".into()
            }
        );
    }

    #[test]
    fn test_cross_subgraph_producer_is_respected() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![8, 8, 8, 8]);
        let x = builder.apply(OperatorKind::ReLU, &[a]).unwrap();
        builder.set_subgraph(1);
        builder
            .apply(OperatorKind::ReduceSum { axis: 0 }, &[x])
            .unwrap();
        let graph = builder.finish();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let config = CostModelConfig {
            multi_subgraphs: true,
            ..CostModelConfig::default()
        };
        let ids = identities(&graph);
        let assignments = propagate(&graph, &mesh, &config, &ids).unwrap();

        // subgraph 0 settles on the leading dim; the later pass cannot use it
        // (reduced axis) and shards the next one instead
        assert_eq!(assignments[0].output, strategy![8, 1, 1, 1]);
        assert_eq!(assignments[1].inputs[0], strategy![1, 8, 1, 1]);
    }

    #[test]
    fn test_every_assignment_is_feasible() {
        let mut builder = GraphBuilder::new();
        let a = builder.input(shape![8, 4, 2]);
        let w = builder.parameter(shape![8, 4, 2]);
        let m = builder.apply(OperatorKind::Mul, &[a, w]).unwrap();
        builder
            .apply(OperatorKind::ReduceMean { axis: 1 }, &[m])
            .unwrap();
        let graph = builder.finish();
        let mesh = DeviceMesh::linear(8, 0).unwrap();
        let ids = identities(&graph);
        let assignments =
            propagate(&graph, &mesh, &CostModelConfig::default(), &ids).unwrap();

        for (index, assignment) in assignments.iter().enumerate() {
            let node = &graph.nodes()[index];
            for (slot, strategy) in assignment.inputs.iter().enumerate() {
                assert!(strategy.is_feasible_for(&node.input_shapes()[slot], &mesh));
            }
            assert!(assignment.output.is_feasible_for(node.output_shape(), &mesh));
        }
    }
}
