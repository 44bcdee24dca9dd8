//! Rack-aware network topology for BlockGrid
//!
//! Models the cluster as a tree of rack paths (`/datacenter/rack`) with
//! datanodes at the leaves. The coordinator uses it to rank candidate nodes
//! by network distance and to pick random nodes within a scope.

pub mod node;
pub mod tree;

pub use node::{DEFAULT_RACK, NodeBase, TopologyNode, normalize_location};
pub use tree::NetworkTopology;
