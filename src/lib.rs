//! Sharding-strategy search and redistribution planning for distributed
//! training graphs.
//!
//! A computation graph over a device mesh is compiled into a strategy
//! table: one sharding strategy per operator, chosen by a cost-driven
//! propagation over the graph, plus the layout conversions needed where
//! neighboring choices disagree. See [`compile::compile`] for the entry
//! point.

pub mod compile;
pub mod error;
pub mod graph;
pub mod mesh;
pub mod strategy;
pub mod types;
mod utils;
