//! Per-datanode mutable record
//!
//! A [`DatanodeDescriptor`] is the registry's view of one storage node:
//! identity, topology position, liveness, admin state, capacity counters,
//! and the queues of work handed out on heartbeats. Field groups carry
//! their own locks; cross-descriptor consistency is the
//! [`crate::manager::DatanodeManager`]'s job.

use crate::commands::BlockTargetPair;
use blockgrid_common::{AdminState, Block, DatanodeId, ExtendedBlock, StorageId};
use blockgrid_topology::TopologyNode;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Capacity and activity counters reported on each heartbeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub capacity: u64,
    pub dfs_used: u64,
    pub remaining: u64,
    pub block_pool_used: u64,
    pub cache_capacity: u64,
    pub cache_used: u64,
    pub xceiver_count: u32,
    pub failed_volumes: u32,
}

/// A block left open by a failed writer, queued for lease recovery along
/// with the replica locations expected to hold it.
#[derive(Clone)]
pub struct BlockUnderConstruction {
    pub block: ExtendedBlock,
    pub expected_locations: Vec<Arc<DatanodeDescriptor>>,
}

/// Identity and runtime state of one storage node.
pub struct DatanodeDescriptor {
    id: RwLock<DatanodeId>,
    location: RwLock<String>,
    software_version: RwLock<Option<String>>,
    storage: RwLock<StorageStats>,
    /// Milliseconds of the last heartbeat; 0 means forced dead
    last_update: AtomicU64,
    alive: AtomicBool,
    admin_state: RwLock<AdminState>,
    /// Set when the node falls off the include list while registered
    disallowed: AtomicBool,
    decommission_start: AtomicU64,

    replicate_blocks: Mutex<VecDeque<BlockTargetPair>>,
    recover_blocks: Mutex<VecDeque<BlockUnderConstruction>>,
    invalidate_blocks: Mutex<VecDeque<Block>>,
    pending_cache: Mutex<Vec<u64>>,
    pending_uncache: Mutex<Vec<u64>>,
    /// Bytes per second to announce on the next heartbeat; 0 means nothing
    balancer_bandwidth: AtomicU64,
}

impl DatanodeDescriptor {
    /// Create a descriptor for a node at the given rack path.
    ///
    /// New descriptors start not-alive with `last_update = 0`; liveness is
    /// established by heartbeat statistics registration.
    pub fn new(id: DatanodeId, location: impl Into<String>) -> Self {
        Self {
            id: RwLock::new(id),
            location: RwLock::new(location.into()),
            software_version: RwLock::new(None),
            storage: RwLock::new(StorageStats::default()),
            last_update: AtomicU64::new(0),
            alive: AtomicBool::new(false),
            admin_state: RwLock::new(AdminState::Normal),
            disallowed: AtomicBool::new(false),
            decommission_start: AtomicU64::new(0),
            replicate_blocks: Mutex::new(VecDeque::new()),
            recover_blocks: Mutex::new(VecDeque::new()),
            invalidate_blocks: Mutex::new(VecDeque::new()),
            pending_cache: Mutex::new(Vec::new()),
            pending_uncache: Mutex::new(Vec::new()),
            balancer_bandwidth: AtomicU64::new(0),
        }
    }

    // --- identity ---

    /// Snapshot of the node's identity
    #[must_use]
    pub fn datanode_id(&self) -> DatanodeId {
        self.id.read().clone()
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.id.read().storage_id.clone()
    }

    #[must_use]
    pub fn ip_addr(&self) -> String {
        self.id.read().ip_addr.clone()
    }

    #[must_use]
    pub fn xfer_addr(&self) -> String {
        self.id.read().xfer_addr()
    }

    /// Overwrite identity fields from a fresh registration
    pub fn update_registration(&self, reg: &DatanodeId) {
        *self.id.write() = reg.clone();
    }

    #[must_use]
    pub fn software_version(&self) -> Option<String> {
        self.software_version.read().clone()
    }

    pub fn set_software_version(&self, version: Option<String>) {
        *self.software_version.write() = version;
    }

    // --- topology ---

    #[must_use]
    pub fn location(&self) -> String {
        self.location.read().clone()
    }

    pub fn set_location(&self, location: impl Into<String>) {
        *self.location.write() = location.into();
    }

    // --- liveness ---

    #[must_use]
    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Relaxed)
    }

    pub fn set_last_update(&self, millis: u64) {
        self.last_update.store(millis, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    /// A node is stale when it has not heartbeated within `stale_interval`
    #[must_use]
    pub fn is_stale(&self, now: u64, stale_interval_ms: u64) -> bool {
        self.last_update() + stale_interval_ms < now
    }

    /// A node is dead when it has not heartbeated within the expiry window
    #[must_use]
    pub fn is_dead(&self, now: u64, expire_interval_ms: u64) -> bool {
        self.last_update() < now.saturating_sub(expire_interval_ms)
    }

    #[must_use]
    pub fn storage_stats(&self) -> StorageStats {
        *self.storage.read()
    }

    /// Record a heartbeat: counters, timestamp, liveness
    pub fn update_heartbeat(&self, reported: StorageStats, now: u64) {
        *self.storage.write() = reported;
        self.set_last_update(now);
        self.set_alive(true);
    }

    // --- admin state ---

    #[must_use]
    pub fn admin_state(&self) -> AdminState {
        *self.admin_state.read()
    }

    #[must_use]
    pub fn is_decommission_in_progress(&self) -> bool {
        self.admin_state() == AdminState::DecommissionInProgress
    }

    #[must_use]
    pub fn is_decommissioned(&self) -> bool {
        self.admin_state() == AdminState::Decommissioned
    }

    pub fn start_decommission(&self, now: u64) {
        *self.admin_state.write() = AdminState::DecommissionInProgress;
        self.decommission_start.store(now, Ordering::Relaxed);
    }

    pub fn set_decommissioned(&self) {
        *self.admin_state.write() = AdminState::Decommissioned;
    }

    pub fn stop_decommission(&self) {
        *self.admin_state.write() = AdminState::Normal;
        self.decommission_start.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn decommission_start_time(&self) -> u64 {
        self.decommission_start.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_disallowed(&self) -> bool {
        self.disallowed.load(Ordering::Relaxed)
    }

    pub fn set_disallowed(&self, disallowed: bool) {
        self.disallowed.store(disallowed, Ordering::Relaxed);
    }

    // --- pending work queues (FIFO within each queue) ---

    /// Queue a block for replication to the given targets
    pub fn add_block_to_be_replicated(&self, block: Block, targets: Vec<DatanodeId>) {
        self.replicate_blocks
            .lock()
            .push_back(BlockTargetPair { block, targets });
    }

    /// Drain up to `max` queued replication work items
    pub fn drain_replication_work(&self, max: usize) -> Vec<BlockTargetPair> {
        let mut queue = self.replicate_blocks.lock();
        let n = usize::min(max, queue.len());
        queue.drain(..n).collect()
    }

    #[must_use]
    pub fn pending_replication_count(&self) -> usize {
        self.replicate_blocks.lock().len()
    }

    /// Queue a block under construction for lease recovery
    pub fn add_block_to_be_recovered(&self, block: BlockUnderConstruction) {
        let mut queue = self.recover_blocks.lock();
        if queue
            .iter()
            .any(|b| b.block.block.block_id == block.block.block.block_id)
        {
            debug!(
                "recovery of {} is already pending on {}",
                block.block,
                self.xfer_addr()
            );
            return;
        }
        queue.push_back(block);
    }

    /// Drain every queued recovery item
    pub fn drain_recovery_work(&self) -> Vec<BlockUnderConstruction> {
        self.recover_blocks.lock().drain(..).collect()
    }

    /// Queue blocks whose local replicas must be deleted
    pub fn add_blocks_to_be_invalidated(&self, blocks: Vec<Block>) {
        let mut queue = self.invalidate_blocks.lock();
        for block in blocks {
            if !queue.iter().any(|b| b.block_id == block.block_id) {
                queue.push_back(block);
            }
        }
    }

    /// Drain up to `max` queued invalidations
    pub fn drain_invalidate_work(&self, max: usize) -> Vec<Block> {
        let mut queue = self.invalidate_blocks.lock();
        let n = usize::min(max, queue.len());
        queue.drain(..n).collect()
    }

    #[must_use]
    pub fn pending_invalidate_count(&self) -> usize {
        self.invalidate_blocks.lock().len()
    }

    pub fn add_pending_cache(&self, block_ids: Vec<u64>) {
        self.pending_cache.lock().extend(block_ids);
    }

    /// Take and clear the pending-cache set
    pub fn take_pending_cache(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending_cache.lock())
    }

    pub fn add_pending_uncache(&self, block_ids: Vec<u64>) {
        self.pending_uncache.lock().extend(block_ids);
    }

    /// Take and clear the pending-uncache set
    pub fn take_pending_uncache(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending_uncache.lock())
    }

    #[must_use]
    pub fn balancer_bandwidth(&self) -> u64 {
        self.balancer_bandwidth.load(Ordering::Relaxed)
    }

    pub fn set_balancer_bandwidth(&self, bytes_per_sec: u64) {
        self.balancer_bandwidth
            .store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Take the pending bandwidth announcement, acknowledging delivery
    pub fn take_balancer_bandwidth(&self) -> u64 {
        self.balancer_bandwidth.swap(0, Ordering::Relaxed)
    }

    /// Operator-facing snapshot of this node
    #[must_use]
    pub fn report(&self, now: u64, expire_interval_ms: u64, stale_interval_ms: u64) -> DatanodeReport {
        let id = self.id.read().clone();
        let storage = self.storage_stats();
        DatanodeReport {
            xfer_addr: id.xfer_addr(),
            host_name: id.host_name.clone(),
            storage_id: id.storage_id.clone(),
            id,
            network_location: self.location(),
            admin_state: self.admin_state(),
            storage,
            last_update: self.last_update(),
            alive: self.is_alive(),
            dead: self.is_dead(now, expire_interval_ms),
            stale: self.is_stale(now, stale_interval_ms),
            software_version: self.software_version(),
            decommission_start: self.decommission_start_time(),
        }
    }
}

impl TopologyNode for DatanodeDescriptor {
    fn name(&self) -> String {
        self.xfer_addr()
    }

    fn network_location(&self) -> String {
        self.location()
    }
}

impl fmt::Display for DatanodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.xfer_addr())
    }
}

impl fmt::Debug for DatanodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatanodeDescriptor")
            .field("id", &*self.id.read())
            .field("location", &*self.location.read())
            .field("admin_state", &self.admin_state())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Point-in-time row describing one datanode.
#[derive(Clone, Debug, Serialize)]
pub struct DatanodeReport {
    pub id: DatanodeId,
    pub xfer_addr: String,
    pub host_name: String,
    pub storage_id: StorageId,
    pub network_location: String,
    pub admin_state: AdminState,
    pub storage: StorageStats,
    pub last_update: u64,
    pub alive: bool,
    pub dead: bool,
    pub stale: bool,
    pub software_version: Option<String>,
    pub decommission_start: u64,
}
