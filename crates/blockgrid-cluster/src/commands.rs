//! Commands piggybacked on heartbeat responses
//!
//! The RPC layer encodes these to the wire; callers must tolerate an empty
//! command list. [`HeartbeatResponse::AskReregister`] is encoded as the
//! single `REGISTER` wire value.

use blockgrid_common::{Block, DatanodeId, ExtendedBlock};
use serde::{Deserialize, Serialize};

/// A block and the datanodes it must be copied to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockTargetPair {
    pub block: Block,
    pub targets: Vec<DatanodeId>,
}

/// A block under construction to be recovered, addressed to the given
/// replica locations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveringBlock {
    pub block: ExtendedBlock,
    pub locations: Vec<DatanodeId>,
}

/// A block access key pushed down to datanodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockKey {
    pub key_id: u32,
    pub expiry_ms: u64,
    pub key_bytes: Vec<u8>,
}

/// A single unit of work for a datanode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatanodeCommand {
    /// Replicate blocks to the given targets
    Transfer {
        pool_id: String,
        blocks: Vec<BlockTargetPair>,
    },
    /// Delete local replicas of the given blocks
    Invalidate { pool_id: String, blocks: Vec<Block> },
    /// Pull the given blocks into the datanode cache
    Cache { pool_id: String, block_ids: Vec<u64> },
    /// Drop the given blocks from the datanode cache
    Uncache { pool_id: String, block_ids: Vec<u64> },
    /// Refresh block access keys
    KeyUpdate { keys: Vec<BlockKey> },
    /// New balancer bandwidth ceiling, bytes per second
    #[serde(rename = "BANDWIDTH")]
    BalancerBandwidth { bytes_per_sec: u64 },
    /// Recover the given blocks left open by failed writers
    Recovery { blocks: Vec<RecoveringBlock> },
}

impl DatanodeCommand {
    /// Wire kind of this command
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "TRANSFER",
            Self::Invalidate { .. } => "INVALIDATE",
            Self::Cache { .. } => "CACHE",
            Self::Uncache { .. } => "UNCACHE",
            Self::KeyUpdate { .. } => "KEY_UPDATE",
            Self::BalancerBandwidth { .. } => "BANDWIDTH",
            Self::Recovery { .. } => "RECOVERY",
        }
    }
}

/// Outcome of one heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HeartbeatResponse {
    /// Ordered command list, possibly empty
    Commands(Vec<DatanodeCommand>),
    /// The node must re-register before it is served again
    AskReregister,
    /// The node has been administratively refused
    Disallowed { reason: String },
}

impl HeartbeatResponse {
    /// The commands carried by this response, if any
    #[must_use]
    pub fn commands(&self) -> Option<&[DatanodeCommand]> {
        match self {
            Self::Commands(cmds) => Some(cmds),
            _ => None,
        }
    }

    /// True when this response carries no work
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Commands(cmds) if cmds.is_empty())
    }
}
