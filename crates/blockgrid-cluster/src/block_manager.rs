//! Block manager contract
//!
//! Block-to-node replication accounting lives outside this crate. The
//! datanode manager only needs the handful of operations below: purging
//! state for a departing node, observing replication progress during
//! decommission, reacting to re-commission and rack-count changes, and
//! fetching key updates to piggyback on heartbeats.

use crate::commands::BlockKey;
use crate::descriptor::DatanodeDescriptor;

/// Operations the datanode manager requires from the block manager.
pub trait BlockManagerOps: Send + Sync {
    /// Remove all block state associated with a departing node
    fn remove_blocks_associated(&self, node: &DatanodeDescriptor);

    /// True while blocks on the node still need re-replication; a
    /// decommissioning node completes once this returns false
    fn has_replication_in_progress(&self, node: &DatanodeDescriptor) -> bool;

    /// Re-examine blocks on a node returning to service, which are now
    /// over-replicated
    fn process_over_replicated_blocks(&self, node: &DatanodeDescriptor);

    /// Scan for blocks that violate placement after the cluster first
    /// becomes multi-rack
    fn process_mis_replicated_blocks(&self);

    /// Current block access keys to push to datanodes, when key rotation
    /// is due
    fn key_update(&self) -> Option<Vec<BlockKey>>;

    /// Re-evaluate safe-mode thresholds after membership changed
    fn check_safe_mode(&self);
}

/// Block manager that tracks nothing.
///
/// Decommissioning completes immediately and no key updates are issued.
/// Useful for embedding the manager without replication accounting and in
/// tests.
#[derive(Default)]
pub struct NoopBlockManager;

impl BlockManagerOps for NoopBlockManager {
    fn remove_blocks_associated(&self, _node: &DatanodeDescriptor) {}

    fn has_replication_in_progress(&self, _node: &DatanodeDescriptor) -> bool {
        false
    }

    fn process_over_replicated_blocks(&self, _node: &DatanodeDescriptor) {}

    fn process_mis_replicated_blocks(&self) {}

    fn key_update(&self) -> Option<Vec<BlockKey>> {
        None
    }

    fn check_safe_mode(&self) {}
}
