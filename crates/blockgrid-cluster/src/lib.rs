//! BlockGrid datanode registry and lifecycle management
//!
//! The [`DatanodeManager`] is the coordinator's authoritative view of the
//! storage nodes in the cluster: which exist, where they sit in the network
//! topology, which are alive, which are being decommissioned, and what work
//! each should perform on its next heartbeat.
//!
//! Registration and heartbeats arrive from the RPC layer; the manager keeps
//! the primary registry, the host index, and the topology tree in lockstep,
//! and piggybacks replication, invalidation, caching, recovery, and
//! bandwidth commands on heartbeat responses.

pub mod block_manager;
pub mod commands;
pub mod descriptor;
pub mod host_index;
pub mod hosts;
pub mod manager;
pub mod monitor;
pub mod namesystem;
pub mod resolver;
pub mod stats;

pub(crate) mod time;

pub use block_manager::{BlockManagerOps, NoopBlockManager};
pub use commands::{
    BlockKey, BlockTargetPair, DatanodeCommand, HeartbeatResponse, RecoveringBlock,
};
pub use descriptor::{BlockUnderConstruction, DatanodeDescriptor, DatanodeReport, StorageStats};
pub use hosts::{HostEntry, HostFileManager};
pub use manager::{DatanodeManager, LocatedBlock, RemotePeer, ReportKind};
pub use monitor::{MonitorHandles, spawn_monitors};
pub use namesystem::Namesystem;
pub use resolver::{CachingRackResolver, CachingResolver, RackResolver, StaticRackResolver};
pub use stats::ClusterStats;
