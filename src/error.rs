//! Error taxonomy of the strategy-assignment engine.
//!
//! Every failure aborts the whole compilation; no partial strategy table is
//! ever returned.

use thiserror::Error;

/// Errors surfaced by graph construction and compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The operator kind has no entry in the strategy catalog.
    #[error("unsupported operator kind: {kind}")]
    UnsupportedOperator { kind: String },

    /// The catalog could not enumerate a single mesh-filling strategy for
    /// this operator's input shapes.
    #[error("no feasible sharding strategy for operator {identity}")]
    NoFeasibleStrategy { identity: String },

    /// Strategy propagation ran out of candidates for an operator.
    #[error("no feasible strategy assignment for operator {identity}")]
    NoFeasibleAssignment { identity: String },

    /// The input graph admits no topological ordering.
    #[error("computation graph contains a cycle")]
    CyclicGraph,

    /// The redistribution planner found two strategies with no valid
    /// transform between them. This indicates a catalog/planner
    /// inconsistency and is not user-recoverable.
    #[error("irreducible strategy mismatch on edge {edge}: {reason}")]
    IrreducibleMismatch { edge: String, reason: String },

    /// The device mesh description is invalid.
    #[error("invalid device mesh: {0}")]
    InvalidMesh(String),

    /// The graph description is invalid (bad arity, incompatible shapes,
    /// dangling operand reference).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
