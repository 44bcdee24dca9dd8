//! Core type definitions for BlockGrid
//!
//! This module defines the fundamental types used throughout the system:
//! storage identifiers, datanode identities, and block descriptors.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, cluster-unique identifier of a data volume set.
///
/// A storage ID persists across datanode restarts; a node that loses its
/// volumes registers with an empty ID and is assigned a fresh one.
#[derive(
    Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct StorageId(String);

impl StorageId {
    /// Create a storage ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random storage ID.
    ///
    /// Callers must re-check the result against the registry for collisions
    /// before accepting it.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("DS-{}", rand::random::<u32>()))
    }

    /// An empty (unassigned) storage ID
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// True if no ID has been assigned yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageId({})", self.0)
    }
}

/// Identity of a datanode as presented on registration.
///
/// The transfer address `ip_addr:xfer_port` is the node's primary key on the
/// wire; `storage_id` is its durable identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatanodeId {
    /// IP address the node serves block transfers from
    pub ip_addr: String,
    /// Hostname claimed by the node
    pub host_name: String,
    /// Hostname as seen by the coordinator's RPC layer, when available
    pub peer_host_name: Option<String>,
    /// Block transfer (data streaming) port
    pub xfer_port: u16,
    /// HTTP info port
    pub info_port: u16,
    /// HTTPS info port
    pub info_secure_port: u16,
    /// IPC (RPC) port
    pub ipc_port: u16,
    /// Durable storage identity
    pub storage_id: StorageId,
}

impl DatanodeId {
    /// The transfer address, `ip:port`
    #[must_use]
    pub fn xfer_addr(&self) -> String {
        format!("{}:{}", self.ip_addr, self.xfer_port)
    }

    /// Hostname plus transfer port, for operator-facing output
    #[must_use]
    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host_name, self.xfer_port)
    }

    /// The hostname the coordinator should trust: the RPC-observed peer
    /// hostname when present, the claimed hostname otherwise.
    #[must_use]
    pub fn effective_host_name(&self) -> &str {
        self.peer_host_name.as_deref().unwrap_or(&self.host_name)
    }
}

impl fmt::Display for DatanodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.xfer_addr())
    }
}

/// A single block: identifier, length, and generation stamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    /// Block identifier, unique within a block pool
    pub block_id: u64,
    /// Number of bytes in the block
    pub num_bytes: u64,
    /// Generation stamp, bumped on each append or recovery
    pub generation_stamp: u64,
}

impl Block {
    /// Create a new block descriptor
    #[must_use]
    pub const fn new(block_id: u64, num_bytes: u64, generation_stamp: u64) -> Self {
        Self {
            block_id,
            num_bytes,
            generation_stamp,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}_{}", self.block_id, self.generation_stamp)
    }
}

/// A block qualified by the block pool it belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtendedBlock {
    /// Namespace-scoped pool identifier
    pub pool_id: String,
    /// The block itself
    pub block: Block,
}

impl ExtendedBlock {
    /// Create a new extended block
    pub fn new(pool_id: impl Into<String>, block: Block) -> Self {
        Self {
            pool_id: pool_id.into(),
            block,
        }
    }
}

impl fmt::Display for ExtendedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool_id, self.block)
    }
}

/// Administrative state of a datanode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminState {
    /// In service
    #[default]
    Normal,
    /// Blocks are being re-replicated off the node
    DecommissionInProgress,
    /// Retirement complete; the node no longer receives new blocks
    Decommissioned,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "In Service"),
            Self::DecommissionInProgress => write!(f, "Decommission In Progress"),
            Self::Decommissioned => write!(f, "Decommissioned"),
        }
    }
}
