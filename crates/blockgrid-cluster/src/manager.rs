//! The datanode manager
//!
//! Authoritative registry and lifecycle controller for the cluster's
//! storage nodes. Keeps the primary storage-ID map, the host index, and
//! the topology tree in lockstep under the registry monitor, admits and
//! replaces nodes presenting registrations, answers heartbeats with
//! command lists, runs the decommission state machine, and serves
//! operator reports.
//!
//! Lock ordering (outermost first): namesystem lock, statistics lock,
//! registry monitor. The topology tree's internal lock is a leaf.

use crate::block_manager::BlockManagerOps;
use crate::commands::{DatanodeCommand, HeartbeatResponse, RecoveringBlock};
use crate::descriptor::{BlockUnderConstruction, DatanodeDescriptor, DatanodeReport, StorageStats};
use crate::host_index::Host2NodesIndex;
use crate::hosts::HostFileManager;
use crate::namesystem::Namesystem;
use crate::resolver::RackResolver;
use crate::stats::{ClusterStats, HeartbeatStats};
use crate::time;
use blockgrid_common::{ClusterConfig, DatanodeId, Error, ExtendedBlock, Result, StorageId};
use blockgrid_topology::{DEFAULT_RACK, NetworkTopology, NodeBase, normalize_location};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Address of the RPC peer a registration arrived from. When present it
/// authoritatively overrides what the node claims about itself.
#[derive(Clone, Debug)]
pub struct RemotePeer {
    pub ip: String,
    pub host_name: Option<String>,
}

/// Which nodes a report covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    All,
    Live,
    Dead,
}

/// A block plus the replica locations a read may be served from.
#[derive(Clone, Debug)]
pub struct LocatedBlock {
    pub block: ExtendedBlock,
    pub locations: Vec<Arc<DatanodeDescriptor>>,
}

/// State guarded by the registry monitor.
struct RegistryState {
    /// Primary map, storage ID -> descriptor; ordered so the decommission
    /// monitor can scan it cyclically
    datanode_map: BTreeMap<StorageId, Arc<DatanodeDescriptor>>,
    host_index: Host2NodesIndex,
    /// Software-version histogram over live, non-dead descriptors
    software_versions: BTreeMap<String, u64>,
    /// Sticky: set the first time the topology reports a second rack
    has_ever_been_multi_rack: bool,
}

/// Registry and lifecycle controller for datanodes.
pub struct DatanodeManager {
    config: ClusterConfig,
    heartbeat_expire_interval_ms: u64,
    stale_interval_ms: u64,
    block_invalidate_limit: usize,

    namesystem: Arc<Namesystem>,
    block_manager: Arc<dyn BlockManagerOps>,
    resolver: Arc<dyn RackResolver>,

    topology: NetworkTopology,
    hosts: HostFileManager,
    stats: HeartbeatStats,
    registry: Mutex<RegistryState>,

    /// Process-wide switch for emitting cache/uncache commands
    send_caching_commands: AtomicBool,
    /// Last storage ID visited by the decommission monitor
    decommission_cursor: Mutex<Option<StorageId>>,
}

impl DatanodeManager {
    /// Create a manager over the given collaborators.
    ///
    /// Validates the configuration, loads the host files, and pre-warms a
    /// caching resolver with the include-list hosts.
    pub fn new(
        config: ClusterConfig,
        namesystem: Arc<Namesystem>,
        block_manager: Arc<dyn BlockManagerOps>,
        resolver: Arc<dyn RackResolver>,
    ) -> Result<Self> {
        let config = config.validated()?;
        let hosts = HostFileManager::new();
        hosts.refresh(config.hosts_include.as_deref(), config.hosts_exclude.as_deref())?;

        let manager = Self {
            heartbeat_expire_interval_ms: config.heartbeat_expire_interval_ms(),
            stale_interval_ms: config.stale_interval_ms,
            block_invalidate_limit: config.effective_block_invalidate_limit(),
            stats: HeartbeatStats::new(
                config.avoid_stale_datanodes_for_write,
                config.use_stale_write_ratio,
            ),
            config,
            namesystem,
            block_manager,
            resolver,
            topology: NetworkTopology::new(),
            hosts,
            registry: Mutex::new(RegistryState {
                datanode_map: BTreeMap::new(),
                host_index: Host2NodesIndex::new(),
                software_versions: BTreeMap::new(),
                has_ever_been_multi_rack: false,
            }),
            send_caching_commands: AtomicBool::new(false),
            decommission_cursor: Mutex::new(None),
        };

        if manager.resolver.as_caching().is_some() {
            let include_hosts: Vec<String> = manager
                .hosts
                .include_entries()
                .iter()
                .map(|e| e.host().to_string())
                .collect();
            if !include_hosts.is_empty() {
                info!(
                    "pre-resolving rack locations for {} include hosts",
                    include_hosts.len()
                );
                manager.resolver.resolve(&include_hosts);
            }
        }

        Ok(manager)
    }

    /// The topology tree
    #[must_use]
    pub fn topology(&self) -> &NetworkTopology {
        &self.topology
    }

    /// The host include/exclude policy
    #[must_use]
    pub fn hosts(&self) -> &HostFileManager {
        &self.hosts
    }

    /// The effective configuration
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Aggregate cluster capacity totals
    #[must_use]
    pub fn cluster_stats(&self) -> ClusterStats {
        self.stats.cluster_stats()
    }

    /// Whether placement should still avoid stale nodes for writes
    #[must_use]
    pub fn should_avoid_stale_datanodes_for_write(&self) -> bool {
        self.stats.should_avoid_stale_datanodes_for_write()
    }

    /// Switch cache/uncache command emission on or off
    pub fn set_send_caching_commands(&self, enabled: bool) {
        self.send_caching_commands.store(enabled, Ordering::Relaxed);
    }

    /// Whether the cluster has ever spanned more than one rack
    #[must_use]
    pub fn has_ever_been_multi_rack(&self) -> bool {
        self.registry.lock().has_ever_been_multi_rack
    }

    // --- registry mutators ---

    /// Atomic add: evict any prior descriptor with the same storage ID from
    /// the host index, insert into the primary map, add to the topology,
    /// index the host. Returns whether this add made the cluster
    /// multi-rack for the first time; on error the caller rolls back with
    /// [`Self::wipe_datanode`].
    fn add_datanode(&self, node: &Arc<DatanodeDescriptor>) -> Result<bool> {
        let mut registry = self.registry.lock();
        if let Some(prev) = registry.datanode_map.get(&node.storage_id()).cloned() {
            registry.host_index.remove(&prev);
        }
        registry
            .datanode_map
            .insert(node.storage_id(), Arc::clone(node));
        self.topology.add(&**node)?;
        registry.host_index.add(node);
        debug!("added datanode {} at {}", node.storage_id(), node);

        let first_multi_rack =
            !registry.has_ever_been_multi_rack && self.topology.num_racks() > 1;
        if first_multi_rack {
            registry.has_ever_been_multi_rack = true;
        }
        Ok(first_multi_rack)
    }

    /// Remove a descriptor from the primary map and the host index only
    fn wipe_datanode(&self, node: &Arc<DatanodeDescriptor>) {
        let mut registry = self.registry.lock();
        let key = node.storage_id();
        if registry
            .datanode_map
            .get(&key)
            .is_some_and(|n| Arc::ptr_eq(n, node))
        {
            registry.datanode_map.remove(&key);
        }
        registry.host_index.remove(node);
        debug!("wiped datanode {} from the registry", key);
    }

    /// Detach a node from everything but the primary map: statistics,
    /// block manager, topology, version histogram. Caller holds the
    /// namesystem write lock.
    fn remove_datanode_internal(&self, node: &Arc<DatanodeDescriptor>) {
        self.stats.remove(node);
        self.block_manager.remove_blocks_associated(node);
        self.topology.remove(&**node);
        self.decrement_version_count_for(node);
        self.block_manager.check_safe_mode();
    }

    /// Remove a node presented by the operator or RPC layer.
    pub fn remove_datanode(&self, node_id: &DatanodeId) -> Result<()> {
        let _guard = self.namesystem.write_lock();
        let node = self
            .get_datanode(node_id)?
            .ok_or_else(|| Error::NodeNotFound(node_id.xfer_addr()))?;
        self.wipe_datanode(&node);
        self.remove_datanode_internal(&node);
        info!("removed datanode {}", node);
        Ok(())
    }

    // --- lookups ---

    /// Look up the descriptor registered under a node's storage ID.
    ///
    /// Fails with `UnregisteredNode` when the storage ID is held by a
    /// descriptor at a different transfer address; the node must
    /// re-register before it is served again.
    pub fn get_datanode(&self, reg: &DatanodeId) -> Result<Option<Arc<DatanodeDescriptor>>> {
        let registry = self.registry.lock();
        let Some(node) = registry.datanode_map.get(&reg.storage_id).cloned() else {
            return Ok(None);
        };
        if node.xfer_addr() != reg.xfer_addr() {
            return Err(Error::UnregisteredNode {
                node: reg.xfer_addr(),
                registered: node.xfer_addr(),
            });
        }
        Ok(Some(node))
    }

    /// One descriptor on the given host, if any
    #[must_use]
    pub fn get_datanode_by_host(&self, ip: &str) -> Option<Arc<DatanodeDescriptor>> {
        self.registry.lock().host_index.lookup_by_host(ip)
    }

    /// The descriptor at `ip:xfer_port`, if any
    #[must_use]
    pub fn get_datanode_by_xfer_addr(
        &self,
        ip: &str,
        xfer_port: u16,
    ) -> Option<Arc<DatanodeDescriptor>> {
        self.registry
            .lock()
            .host_index
            .lookup_by_xfer_addr(ip, xfer_port)
    }

    /// Best-effort resolution of a `host[:port]` string to a descriptor:
    /// exact transfer address, then any node on the host, then a random
    /// node in the host's rack, then any node in the cluster.
    #[must_use]
    pub fn get_datanode_descriptor(&self, address: &str) -> Option<Arc<DatanodeDescriptor>> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port_str)) => (host, port_str.parse::<u16>().ok()),
            None => (address, None),
        };
        {
            let registry = self.registry.lock();
            if let Some(port) = port
                && let Some(node) = registry.host_index.lookup_by_xfer_addr(host, port)
            {
                return Some(node);
            }
            if let Some(node) = registry.host_index.lookup_by_host(host) {
                return Some(node);
            }
        }
        let rack = self.resolve_location_of(host);
        let leaf = self
            .topology
            .choose_random(&rack)
            .or_else(|| self.topology.choose_random("/"))?;
        self.descriptor_for_leaf(&leaf)
    }

    fn descriptor_for_leaf(&self, leaf: &NodeBase) -> Option<Arc<DatanodeDescriptor>> {
        let (ip, port_str) = leaf.name.rsplit_once(':')?;
        let port = port_str.parse::<u16>().ok()?;
        self.get_datanode_by_xfer_addr(ip, port)
    }

    // --- software version histogram ---

    fn should_count_version(&self, node: &DatanodeDescriptor, now: u64) -> bool {
        node.software_version().is_some()
            && node.is_alive()
            && !node.is_dead(now, self.heartbeat_expire_interval_ms)
    }

    fn increment_version_count_for(&self, node: &DatanodeDescriptor) {
        if !self.should_count_version(node, time::now_millis()) {
            return;
        }
        let Some(version) = node.software_version() else {
            return;
        };
        let mut registry = self.registry.lock();
        *registry.software_versions.entry(version).or_insert(0) += 1;
    }

    fn decrement_version_count_for(&self, node: &DatanodeDescriptor) {
        let Some(version) = node.software_version() else {
            return;
        };
        let mut registry = self.registry.lock();
        if let Some(count) = registry.software_versions.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                registry.software_versions.remove(&version);
            }
        }
    }

    fn recount_software_versions(&self) {
        let now = time::now_millis();
        let expire = self.heartbeat_expire_interval_ms;
        let mut registry = self.registry.lock();
        let mut histogram = BTreeMap::new();
        for node in registry.datanode_map.values() {
            if let Some(version) = node.software_version()
                && node.is_alive()
                && !node.is_dead(now, expire)
            {
                *histogram.entry(version).or_insert(0u64) += 1;
            }
        }
        registry.software_versions = histogram;
    }

    /// Snapshot of the software-version histogram; callers must not assume
    /// live mutation
    #[must_use]
    pub fn datanode_software_versions(&self) -> BTreeMap<String, u64> {
        self.registry.lock().software_versions.clone()
    }

    // --- registration protocol ---

    /// Admit, replace, or restart a node presenting a registration.
    ///
    /// Runs entirely under the namesystem write lock; every state-mutating
    /// path is all-or-nothing. Returns the registration with the assigned
    /// storage ID filled in.
    pub fn register_datanode(
        &self,
        mut node_reg: DatanodeId,
        software_version: Option<String>,
        remote: Option<RemotePeer>,
    ) -> Result<DatanodeId> {
        let _guard = self.namesystem.write_lock();

        // the RPC remote address is authoritative
        if let Some(peer) = remote {
            node_reg.ip_addr = peer.ip;
            node_reg.peer_host_name = peer.host_name;
        }

        if self.config.check_ip_hostname && !is_name_resolved(&node_reg) {
            let reason = format!(
                "hostname cannot be resolved (ip={}, hostname={})",
                node_reg.ip_addr,
                node_reg.effective_host_name()
            );
            warn!("rejecting registration from {}: {}", node_reg.xfer_addr(), reason);
            return Err(Error::disallowed(node_reg.xfer_addr(), reason));
        }
        if !self.hosts.is_included(&node_reg) {
            warn!(
                "rejecting registration from {}: not in the include host list",
                node_reg.xfer_addr()
            );
            return Err(Error::disallowed(
                node_reg.xfer_addr(),
                "not in the include host list",
            ));
        }

        let (node_s, node_n) = {
            let registry = self.registry.lock();
            (
                registry.datanode_map.get(&node_reg.storage_id).cloned(),
                registry
                    .host_index
                    .lookup_by_xfer_addr(&node_reg.ip_addr, node_reg.xfer_port),
            )
        };

        // a different storage previously lived at this address; its
        // descriptor is now orphaned
        if let Some(orphan) = node_n
            && node_s.as_ref().is_none_or(|s| !Arc::ptr_eq(s, &orphan))
        {
            info!(
                "removing orphaned datanode {} ({}) at reused address {}",
                orphan,
                orphan.storage_id(),
                node_reg.xfer_addr()
            );
            self.remove_datanode_internal(&orphan);
            self.wipe_datanode(&orphan);
        }

        if let Some(node) = node_s {
            if node.xfer_addr() == node_reg.xfer_addr() {
                // same node restarted on the same storage, no data loss
                debug!("datanode {} re-registered in place", node_reg.xfer_addr());
            } else {
                info!(
                    "storage {} moved from {} to {}",
                    node_reg.storage_id,
                    node.xfer_addr(),
                    node_reg.xfer_addr()
                );
            }
            self.update_registered_datanode(&node, &node_reg, software_version)?;
            return Ok(node_reg);
        }

        // brand new node
        if node_reg.storage_id.is_empty() {
            node_reg.storage_id = self.allocate_storage_id();
            debug!(
                "assigned storage id {} to {}",
                node_reg.storage_id,
                node_reg.xfer_addr()
            );
        }
        let location = self.resolve_network_location(&node_reg);
        let node = Arc::new(DatanodeDescriptor::new(node_reg.clone(), location));
        node.set_software_version(software_version);

        if let Err(e) = self.register_new_datanode(&node) {
            self.rollback_registration(&node, &node_reg, &e);
            return Err(e);
        }
        info!(
            "registered datanode {} ({}) at {}",
            node_reg.xfer_addr(),
            node_reg.storage_id,
            node.location()
        );
        Ok(node_reg)
    }

    /// Update path: the storage ID is already registered. Re-resolves the
    /// node's rack, refreshes identity and liveness, and re-runs the
    /// decommission check. Rolls everything back on failure.
    fn update_registered_datanode(
        &self,
        node: &Arc<DatanodeDescriptor>,
        node_reg: &DatanodeId,
        software_version: Option<String>,
    ) -> Result<()> {
        let result = (|| -> Result<()> {
            self.topology.remove(&**node);
            self.decrement_version_count_for(node);
            {
                let mut registry = self.registry.lock();
                registry.host_index.remove(node);
            }
            node.update_registration(node_reg);
            node.set_software_version(software_version);
            node.set_disallowed(false);
            node.set_location(self.resolve_network_location(node_reg));
            self.topology.add(&**node)?;
            {
                let mut registry = self.registry.lock();
                registry.host_index.add(node);
            }
            // the registration doubles as the node's first heartbeat
            self.stats.register(node, time::now_millis());
            self.increment_version_count_for(node);
            self.check_decommissioning(node);
            Ok(())
        })();

        if let Err(e) = result {
            self.rollback_registration(node, node_reg, &e);
            return Err(e);
        }
        Ok(())
    }

    /// New-descriptor path. The caller rolls back on error.
    fn register_new_datanode(&self, node: &Arc<DatanodeDescriptor>) -> Result<()> {
        let first_multi_rack = self.add_datanode(node)?;
        self.check_decommissioning(node);
        self.stats.register(node, time::now_millis());
        self.increment_version_count_for(node);
        if first_multi_rack {
            self.on_first_multi_rack();
        }
        Ok(())
    }

    fn rollback_registration(
        &self,
        node: &Arc<DatanodeDescriptor>,
        node_reg: &DatanodeId,
        err: &Error,
    ) {
        error!(
            "rolling back registration of {}: {}",
            node_reg.xfer_addr(),
            err
        );
        if err.is_invalid_topology() {
            // evict stale resolver state so a retry re-resolves cleanly
            self.evict_resolver_cache(node_reg);
        }
        self.remove_datanode_internal(node);
        self.wipe_datanode(node);
        self.recount_software_versions();
    }

    fn on_first_multi_rack(&self) {
        info!(
            "cluster is now multi-rack ({} racks)",
            self.topology.num_racks()
        );
        if self.namesystem.is_populating_replication_queues() {
            self.block_manager.process_mis_replicated_blocks();
        }
    }

    fn allocate_storage_id(&self) -> StorageId {
        let registry = self.registry.lock();
        loop {
            let id = StorageId::generate();
            if !registry.datanode_map.contains_key(&id) {
                return id;
            }
        }
    }

    fn evict_resolver_cache(&self, id: &DatanodeId) {
        if let Some(caching) = self.resolver.as_caching() {
            let mut names = vec![id.ip_addr.clone(), id.host_name.clone()];
            if let Some(peer) = &id.peer_host_name {
                names.push(peer.clone());
            }
            caching.reload_cached(&names);
        }
    }

    fn resolve_network_location(&self, id: &DatanodeId) -> String {
        self.resolve_location_of(&id.ip_addr)
    }

    fn resolve_location_of(&self, name: &str) -> String {
        let resolved = self
            .resolver
            .resolve(&[name.to_string()])
            .into_iter()
            .next()
            .flatten();
        match resolved {
            Some(location) => normalize_location(&location),
            None => {
                warn!("could not resolve a rack for {}; using {}", name, DEFAULT_RACK);
                DEFAULT_RACK.to_string()
            }
        }
    }

    // --- decommission state machine ---

    /// Start decommission unless it is already under way or complete
    pub fn start_decommission(&self, node: &Arc<DatanodeDescriptor>) {
        if !node.is_decommission_in_progress() && !node.is_decommissioned() {
            info!(
                "starting decommission of {} ({} blocks pending replication)",
                node,
                node.pending_replication_count()
            );
            self.stats.start_decommission(node, time::now_millis());
            self.check_decommission_state(node);
        }
    }

    /// Return a decommissioning or decommissioned node to service
    pub fn stop_decommission(&self, node: &Arc<DatanodeDescriptor>) {
        if node.is_decommission_in_progress() || node.is_decommissioned() {
            info!("stopping decommission of {}", node);
            self.stats.stop_decommission(node);
            // blocks on a re-commissioned live node are over-replicated
            if node.is_alive() {
                self.block_manager.process_over_replicated_blocks(node);
            }
        }
    }

    /// Mark a decommissioning node decommissioned once the block manager
    /// reports no replication in progress on it
    pub(crate) fn check_decommission_state(&self, node: &Arc<DatanodeDescriptor>) {
        if node.is_decommission_in_progress()
            && !self.block_manager.has_replication_in_progress(node)
        {
            node.set_decommissioned();
            info!("decommission of {} is complete", node);
        }
    }

    /// Start decommission for a registering node on the exclude list
    fn check_decommissioning(&self, node: &Arc<DatanodeDescriptor>) {
        if self.hosts.is_excluded(&node.datanode_id()) {
            self.start_decommission(node);
        }
    }

    /// One decommission-monitor pass: inspect at most
    /// `decommission_nodes_per_interval` in-progress nodes, scanning the
    /// registry cyclically from the previous pass's position.
    pub fn decommission_tick(&self) {
        let _guard = self.namesystem.write_lock();
        let budget = self.config.decommission_nodes_per_interval;
        let cursor = self.decommission_cursor.lock().clone();

        let ordered: Vec<(StorageId, Arc<DatanodeDescriptor>)> = {
            let registry = self.registry.lock();
            match &cursor {
                Some(last) => registry
                    .datanode_map
                    .range((Bound::Excluded(last.clone()), Bound::Unbounded))
                    .chain(registry.datanode_map.range(..=last.clone()))
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect(),
                None => registry
                    .datanode_map
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect(),
            }
        };

        let mut checked = 0;
        for (key, node) in ordered {
            if checked >= budget {
                break;
            }
            *self.decommission_cursor.lock() = Some(key);
            if node.is_decommission_in_progress() {
                checked += 1;
                self.check_decommission_state(&node);
            }
        }
    }

    // --- heartbeat responder ---

    /// Answer one heartbeat: refresh liveness and capacity, then hand back
    /// pending work. Lease recovery preempts every other command kind.
    pub fn handle_heartbeat(
        &self,
        reg: &DatanodeId,
        pool_id: &str,
        reported: StorageStats,
        max_transfers: usize,
    ) -> HeartbeatResponse {
        let _guard = self.namesystem.read_lock();
        let now = time::now_millis();

        let node = match self.get_datanode(reg) {
            Ok(node) => node,
            Err(e) => {
                error!(
                    "heartbeat from {}: {}; asking the node to re-register",
                    reg.xfer_addr(),
                    e
                );
                return HeartbeatResponse::AskReregister;
            }
        };

        if let Some(node) = &node
            && node.is_disallowed()
        {
            warn!("refusing heartbeat from disallowed datanode {}", node);
            node.set_last_update(0);
            return HeartbeatResponse::Disallowed {
                reason: "node is not allowed to communicate with the coordinator".to_string(),
            };
        }

        let Some(node) = node.filter(|n| n.is_alive()) else {
            return HeartbeatResponse::AskReregister;
        };

        self.stats.update_heartbeat(&node, reported, now);

        // no commands, and no queue draining, while in safe mode
        if self.namesystem.is_in_safe_mode() {
            return HeartbeatResponse::Commands(Vec::new());
        }

        let recoveries = node.drain_recovery_work();
        if !recoveries.is_empty() {
            let blocks = recoveries
                .into_iter()
                .map(|r| self.recovering_block(r, now))
                .collect();
            return HeartbeatResponse::Commands(vec![DatanodeCommand::Recovery { blocks }]);
        }

        let mut commands = Vec::new();
        let transfers = node.drain_replication_work(max_transfers);
        if !transfers.is_empty() {
            commands.push(DatanodeCommand::Transfer {
                pool_id: pool_id.to_string(),
                blocks: transfers,
            });
        }
        let invalidations = node.drain_invalidate_work(self.block_invalidate_limit);
        if !invalidations.is_empty() {
            commands.push(DatanodeCommand::Invalidate {
                pool_id: pool_id.to_string(),
                blocks: invalidations,
            });
        }
        let send_caching = self.send_caching_commands.load(Ordering::Relaxed);
        let cache = node.take_pending_cache();
        if send_caching && !cache.is_empty() {
            commands.push(DatanodeCommand::Cache {
                pool_id: pool_id.to_string(),
                block_ids: cache,
            });
        }
        let uncache = node.take_pending_uncache();
        if send_caching && !uncache.is_empty() {
            commands.push(DatanodeCommand::Uncache {
                pool_id: pool_id.to_string(),
                block_ids: uncache,
            });
        }
        if let Some(keys) = self.block_manager.key_update() {
            commands.push(DatanodeCommand::KeyUpdate { keys });
        }
        let bandwidth = node.take_balancer_bandwidth();
        if bandwidth > 0 {
            commands.push(DatanodeCommand::BalancerBandwidth {
                bytes_per_sec: bandwidth,
            });
        }
        HeartbeatResponse::Commands(commands)
    }

    /// Address a recovery to the non-stale expected locations, or to all
    /// of them when one or fewer are fresh; the primary replica will drive
    /// error handling in that case.
    fn recovering_block(&self, work: BlockUnderConstruction, now: u64) -> RecoveringBlock {
        let total = work.expected_locations.len();
        let fresh: Vec<&Arc<DatanodeDescriptor>> = work
            .expected_locations
            .iter()
            .filter(|d| !d.is_stale(now, self.stale_interval_ms))
            .collect();

        let locations: Vec<DatanodeId> = if fresh.len() > 1 {
            if fresh.len() < total {
                info!(
                    "skipped {} stale replicas of {} when dispatching recovery",
                    total - fresh.len(),
                    work.block
                );
            }
            fresh.iter().map(|d| d.datanode_id()).collect()
        } else {
            work.expected_locations
                .iter()
                .map(|d| d.datanode_id())
                .collect()
        };
        RecoveringBlock {
            block: work.block,
            locations,
        }
    }

    // --- liveness sweep ---

    /// One dead-sweep pass: publish the stale count and remove expired
    /// nodes, at most one removal per rescan of the live list.
    pub fn heartbeat_tick(&self) {
        let expire = self.heartbeat_expire_interval_ms;
        loop {
            let now = time::now_millis();
            let live = self.stats.live_snapshot();
            let stale = live
                .iter()
                .filter(|n| n.is_alive() && n.is_stale(now, self.stale_interval_ms))
                .count();
            self.stats.set_num_stale_nodes(stale);

            let Some(dead) = live.into_iter().find(|n| n.is_dead(now, expire)) else {
                break;
            };
            let _guard = self.namesystem.write_lock();
            // re-check under the lock; a heartbeat may have raced us
            if dead.is_dead(time::now_millis(), expire) {
                warn!("removing dead datanode {}", dead);
                self.stats.incr_expired_heartbeats();
                self.wipe_datanode(&dead);
                self.remove_datanode_internal(&dead);
            }
        }
    }

    /// Stale-node count as last published by the sweep
    #[must_use]
    pub fn num_stale_nodes(&self) -> usize {
        self.stats.num_stale_nodes()
    }

    // --- administrative operations ---

    /// Reload the host files and reclassify every registered node: not
    /// included means disallowed, included and excluded starts
    /// decommission, included and not excluded returns the node to
    /// service. Idempotent when the host files are unchanged.
    pub fn refresh_nodes(&self) {
        if let Err(e) = self.hosts.refresh(
            self.config.hosts_include.as_deref(),
            self.config.hosts_exclude.as_deref(),
        ) {
            warn!("failed to refresh host files, keeping previous policy: {}", e);
        }

        let _guard = self.namesystem.write_lock();
        let nodes: Vec<Arc<DatanodeDescriptor>> =
            { self.registry.lock().datanode_map.values().cloned().collect() };
        for node in nodes {
            let id = node.datanode_id();
            if self.hosts.is_included(&id) {
                node.set_disallowed(false);
                if self.hosts.is_excluded(&id) {
                    self.start_decommission(&node);
                } else {
                    self.stop_decommission(&node);
                }
            } else {
                // refused on its next heartbeat
                node.set_disallowed(true);
            }
        }
        self.recount_software_versions();
    }

    /// Schedule a balancer-bandwidth announcement on every node's next
    /// heartbeat
    pub fn set_balancer_bandwidth(&self, bytes_per_sec: u64) {
        let nodes: Vec<Arc<DatanodeDescriptor>> =
            { self.registry.lock().datanode_map.values().cloned().collect() };
        for node in &nodes {
            node.set_balancer_bandwidth(bytes_per_sec);
        }
        info!(
            "scheduled balancer bandwidth of {} bytes/s on {} datanodes",
            bytes_per_sec,
            nodes.len()
        );
    }

    // --- reports & queries ---

    /// Snapshot the registry and bucket by liveness. Dead listings also
    /// synthesize placeholder descriptors for included hosts that were
    /// never heard from and are not excluded, inferring the transfer port
    /// from the host entry with the configured default as fallback.
    #[must_use]
    pub fn datanode_list_for_report(&self, kind: ReportKind) -> Vec<Arc<DatanodeDescriptor>> {
        let now = time::now_millis();
        let expire = self.heartbeat_expire_interval_ms;
        let nodes: Vec<Arc<DatanodeDescriptor>> =
            { self.registry.lock().datanode_map.values().cloned().collect() };

        let mut list: Vec<Arc<DatanodeDescriptor>> = nodes
            .iter()
            .filter(|n| match kind {
                ReportKind::All => true,
                ReportKind::Live => !n.is_dead(now, expire),
                ReportKind::Dead => n.is_dead(now, expire),
            })
            .cloned()
            .collect();

        if matches!(kind, ReportKind::Dead | ReportKind::All) {
            for entry in self.hosts.include_entries() {
                let seen = nodes.iter().any(|n| entry.matches(&n.datanode_id()));
                if seen {
                    continue;
                }
                let host = entry.host().to_string();
                let port = if entry.port == 0 {
                    self.config.default_xfer_port
                } else {
                    entry.port
                };
                let id = DatanodeId {
                    ip_addr: host.clone(),
                    host_name: host,
                    peer_host_name: None,
                    xfer_port: port,
                    info_port: 0,
                    info_secure_port: 0,
                    ipc_port: 0,
                    storage_id: StorageId::empty(),
                };
                if self.hosts.is_excluded(&id) {
                    continue;
                }
                // placeholders start with last_update 0: always dead
                list.push(Arc::new(DatanodeDescriptor::new(id, DEFAULT_RACK)));
            }
        }
        list
    }

    /// Operator-facing report rows for the given listing
    #[must_use]
    pub fn datanode_reports(&self, kind: ReportKind) -> Vec<DatanodeReport> {
        let now = time::now_millis();
        self.datanode_list_for_report(kind)
            .iter()
            .map(|n| n.report(now, self.heartbeat_expire_interval_ms, self.stale_interval_ms))
            .collect()
    }

    /// Live nodes currently decommissioning
    #[must_use]
    pub fn decommissioning_nodes(&self) -> Vec<Arc<DatanodeDescriptor>> {
        self.datanode_list_for_report(ReportKind::Live)
            .into_iter()
            .filter(|n| n.is_decommission_in_progress())
            .collect()
    }

    /// Strip nodes the operator has fully retired: decommissioned and
    /// named by neither host list while an include list is in force.
    pub fn remove_decom_nodes_from_list(&self, nodes: &mut Vec<Arc<DatanodeDescriptor>>) {
        nodes.retain(|n| {
            let id = n.datanode_id();
            !(n.is_decommissioned()
                && !self.hosts.is_included(&id)
                && !self.hosts.is_excluded(&id))
        });
    }

    /// Order each block's replica locations for a reader: closest first,
    /// decommissioned (and, when configured, stale) nodes pushed to the
    /// end. The reorder is stable within each tier.
    pub fn sort_located_blocks(&self, target_host: &str, blocks: &mut [LocatedBlock]) {
        let now = time::now_millis();
        let reader = match self.get_datanode_by_host(target_host) {
            Some(node) => NodeBase::new(node.xfer_addr(), node.location()),
            None => NodeBase::new(target_host, self.resolve_location_of(target_host)),
        };
        let avoid_stale = self.config.avoid_stale_datanodes_for_read;

        for block in blocks {
            self.topology
                .pseudo_sort_by_distance(&reader, &mut block.locations);
            block.locations.sort_by_key(|n| {
                if n.is_decommissioned() {
                    2u8
                } else if avoid_stale && n.is_stale(now, self.stale_interval_ms) {
                    1
                } else {
                    0
                }
            });
        }
    }
}

/// A registration's address resolves when the node's hostname is known and
/// differs from the bare IP; loopback addresses are exempt.
fn is_name_resolved(id: &DatanodeId) -> bool {
    let hostname = id.effective_host_name();
    if hostname.is_empty() || hostname == id.ip_addr {
        return id
            .ip_addr
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::BlockManagerOps;
    use crate::commands::BlockKey;
    use crate::resolver::{CachingResolver, StaticRackResolver};
    use blockgrid_common::{AdminState, Block};
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    /// Block manager double that records every call.
    #[derive(Default)]
    struct RecordingBlockManager {
        removed: Mutex<Vec<String>>,
        over_replicated: Mutex<Vec<String>>,
        mis_replicated_scans: AtomicUsize,
        replication_in_progress: AtomicBool,
    }

    impl RecordingBlockManager {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn removed_storage_ids(&self) -> Vec<String> {
            self.removed.lock().clone()
        }

        fn set_replication_in_progress(&self, on: bool) {
            self.replication_in_progress.store(on, Ordering::Relaxed);
        }
    }

    impl BlockManagerOps for RecordingBlockManager {
        fn remove_blocks_associated(&self, node: &DatanodeDescriptor) {
            self.removed.lock().push(node.storage_id().as_str().to_string());
        }

        fn has_replication_in_progress(&self, _node: &DatanodeDescriptor) -> bool {
            self.replication_in_progress.load(Ordering::Relaxed)
        }

        fn process_over_replicated_blocks(&self, node: &DatanodeDescriptor) {
            self.over_replicated
                .lock()
                .push(node.storage_id().as_str().to_string());
        }

        fn process_mis_replicated_blocks(&self) {
            self.mis_replicated_scans.fetch_add(1, Ordering::Relaxed);
        }

        fn key_update(&self) -> Option<Vec<BlockKey>> {
            None
        }

        fn check_safe_mode(&self) {}
    }

    /// Resolver whose table can change between registrations.
    #[derive(Default)]
    struct MutableResolver {
        table: Mutex<HashMap<String, String>>,
    }

    impl MutableResolver {
        fn set(&self, host: &str, rack: &str) {
            self.table.lock().insert(host.to_string(), rack.to_string());
        }
    }

    impl RackResolver for MutableResolver {
        fn resolve(&self, names: &[String]) -> Vec<Option<String>> {
            let table = self.table.lock();
            names.iter().map(|n| table.get(n).cloned()).collect()
        }
    }

    struct TestCluster {
        manager: DatanodeManager,
        namesystem: Arc<Namesystem>,
        block_manager: Arc<RecordingBlockManager>,
    }

    fn rack_table() -> StaticRackResolver {
        let mut resolver = StaticRackResolver::default();
        for i in 1..=3 {
            resolver.insert(format!("10.0.0.{i}"), "/dc1/rack1");
            resolver.insert(format!("10.0.1.{i}"), "/dc1/rack2");
        }
        resolver.insert("10.1.0.1", "/dc2/rack1");
        resolver
    }

    fn cluster() -> TestCluster {
        cluster_with(ClusterConfig::default())
    }

    fn cluster_with(config: ClusterConfig) -> TestCluster {
        cluster_custom(config, Arc::new(rack_table()))
    }

    fn cluster_custom(config: ClusterConfig, resolver: Arc<dyn RackResolver>) -> TestCluster {
        let namesystem = Arc::new(Namesystem::new());
        let block_manager = RecordingBlockManager::new();
        let manager = DatanodeManager::new(
            config,
            Arc::clone(&namesystem),
            block_manager.clone(),
            resolver,
        )
        .unwrap();
        TestCluster {
            manager,
            namesystem,
            block_manager,
        }
    }

    fn reg_id(ip: &str, port: u16, storage: &str) -> DatanodeId {
        DatanodeId {
            ip_addr: ip.to_string(),
            host_name: format!("host-{ip}"),
            peer_host_name: None,
            xfer_port: port,
            info_port: 50075,
            info_secure_port: 50475,
            ipc_port: 50020,
            storage_id: StorageId::new(storage),
        }
    }

    fn register(manager: &DatanodeManager, ip: &str, storage: &str) -> DatanodeId {
        manager
            .register_datanode(reg_id(ip, 50010, storage), Some("1.2.0".to_string()), None)
            .unwrap()
    }

    fn heartbeat(manager: &DatanodeManager, id: &DatanodeId) -> HeartbeatResponse {
        manager.handle_heartbeat(
            id,
            "BP-1",
            StorageStats {
                capacity: 100,
                remaining: 100,
                ..Default::default()
            },
            16,
        )
    }

    fn command_kinds(response: &HeartbeatResponse) -> Vec<&'static str> {
        response
            .commands()
            .unwrap()
            .iter()
            .map(DatanodeCommand::kind)
            .collect()
    }

    #[test]
    fn test_new_registration_assigns_storage_id() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        fs::write(&include, "10.0.0.1\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include),
            ..Default::default()
        });

        let assigned = c
            .manager
            .register_datanode(reg_id("10.0.0.1", 50010, ""), Some("1.2.0".into()), None)
            .unwrap();
        assert!(assigned.storage_id.as_str().starts_with("DS-"));

        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        assert_eq!(node.admin_state(), AdminState::Normal);
        assert!(node.is_alive());
        assert_eq!(node.location(), "/dc1/rack1");
        assert!(c.manager.topology().contains("10.0.0.1:50010"));
        assert_eq!(
            c.manager.datanode_software_versions().get("1.2.0"),
            Some(&1)
        );

        // the first heartbeat of an idle node carries no commands
        assert!(heartbeat(&c.manager, &assigned).is_empty());
    }

    #[test]
    fn test_replacement_same_storage_new_address() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.1.1", "DS-1");

        let node = c.manager.get_datanode_by_xfer_addr("10.0.1.1", 50010).unwrap();
        assert_eq!(node.storage_id(), StorageId::new("DS-1"));
        assert_eq!(node.location(), "/dc1/rack2");
        assert!(c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).is_none());
        assert!(!c.manager.topology().contains("10.0.0.1:50010"));
        assert_eq!(c.manager.datanode_list_for_report(ReportKind::All).len(), 1);
    }

    #[test]
    fn test_collision_evicts_prior_storage() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.1", "DS-2");

        assert_eq!(c.block_manager.removed_storage_ids(), vec!["DS-1"]);
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        assert_eq!(node.storage_id(), StorageId::new("DS-2"));
        assert!(c.manager.get_datanode(&reg_id("10.0.0.1", 50010, "DS-1")).unwrap().is_none());
        assert_eq!(c.manager.datanode_list_for_report(ReportKind::All).len(), 1);
        assert_eq!(c.manager.topology().num_leaves(), 1);
    }

    #[test]
    fn test_restart_in_place() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.1", "DS-1");

        assert_eq!(c.manager.datanode_list_for_report(ReportKind::All).len(), 1);
        assert_eq!(c.manager.cluster_stats().live_nodes, 1);
        assert_eq!(
            c.manager.datanode_software_versions().get("1.2.0"),
            Some(&1)
        );
    }

    #[test]
    fn test_registration_rejected_when_not_included() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        fs::write(&include, "10.0.0.2\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include),
            ..Default::default()
        });

        let err = c
            .manager
            .register_datanode(reg_id("10.0.0.1", 50010, ""), None, None)
            .unwrap_err();
        assert!(err.is_disallowed());
        assert!(c.manager.datanode_list_for_report(ReportKind::All).is_empty());
    }

    #[test]
    fn test_registration_rejected_when_unresolved() {
        let c = cluster();
        let mut unresolved = reg_id("10.0.0.1", 50010, "");
        unresolved.host_name = "10.0.0.1".to_string();
        let err = c
            .manager
            .register_datanode(unresolved, None, None)
            .unwrap_err();
        assert!(err.is_disallowed());

        // loopback addresses are exempt from the check
        let mut local = reg_id("127.0.0.1", 50010, "");
        local.host_name = "127.0.0.1".to_string();
        c.manager.register_datanode(local, None, None).unwrap();
    }

    #[test]
    fn test_remote_peer_overrides_claimed_address() {
        let c = cluster();
        let claimed = reg_id("10.9.9.9", 50010, "DS-1");
        c.manager
            .register_datanode(
                claimed,
                None,
                Some(RemotePeer {
                    ip: "10.0.0.1".to_string(),
                    host_name: Some("dn1.example.com".to_string()),
                }),
            )
            .unwrap();

        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        assert_eq!(node.datanode_id().peer_host_name.as_deref(), Some("dn1.example.com"));
        assert!(c.manager.get_datanode_by_xfer_addr("10.9.9.9", 50010).is_none());
    }

    #[test]
    fn test_invalid_topology_rolls_back_and_evicts_cache() {
        let backing = Arc::new(MutableResolver::default());
        backing.set("10.0.0.1", "/dc1/rack1");
        // wrong depth: a rack where the tree expects /datacenter/rack
        backing.set("10.0.1.1", "/rack2");
        let resolver = Arc::new(CachingResolver::new(Arc::clone(&backing)));
        let c = cluster_custom(ClusterConfig::default(), resolver);

        register(&c.manager, "10.0.0.1", "DS-1");
        let err = c
            .manager
            .register_datanode(reg_id("10.0.1.1", 50010, "DS-2"), Some("1.2.0".into()), None)
            .unwrap_err();
        assert!(err.is_invalid_topology());

        // all-or-nothing: no trace of the failed registration
        assert_eq!(c.manager.datanode_list_for_report(ReportKind::All).len(), 1);
        assert!(c.manager.get_datanode_by_xfer_addr("10.0.1.1", 50010).is_none());
        assert_eq!(c.manager.topology().num_leaves(), 1);
        assert_eq!(
            c.manager.datanode_software_versions().get("1.2.0"),
            Some(&1)
        );

        // the failure evicted the cached mapping, so a fixed table is
        // picked up on retry
        backing.set("10.0.1.1", "/dc1/rack2");
        register(&c.manager, "10.0.1.1", "DS-2");
        assert_eq!(c.manager.topology().num_racks(), 2);
    }

    #[test]
    fn test_unresolvable_host_falls_back_to_default_rack() {
        let c = cluster();
        register(&c.manager, "172.16.0.1", "DS-9");
        let node = c.manager.get_datanode_by_xfer_addr("172.16.0.1", 50010).unwrap();
        assert_eq!(node.location(), DEFAULT_RACK);
    }

    #[test]
    fn test_heartbeat_from_unknown_node_asks_reregister() {
        let c = cluster();
        let response = heartbeat(&c.manager, &reg_id("10.0.0.1", 50010, "DS-1"));
        assert!(matches!(response, HeartbeatResponse::AskReregister));
    }

    #[test]
    fn test_heartbeat_with_divergent_address_asks_reregister() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        let response = heartbeat(&c.manager, &reg_id("10.0.1.1", 50010, "DS-1"));
        assert!(matches!(response, HeartbeatResponse::AskReregister));
    }

    #[test]
    fn test_refresh_disallows_and_heartbeat_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        fs::write(&include, "10.0.0.1 10.0.0.2\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include.clone()),
            ..Default::default()
        });
        let id = register(&c.manager, "10.0.0.1", "DS-1");

        fs::write(&include, "10.0.0.2\n").unwrap();
        c.manager.refresh_nodes();
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        assert!(node.is_disallowed());

        let response = heartbeat(&c.manager, &id);
        assert!(matches!(response, HeartbeatResponse::Disallowed { .. }));
        assert_eq!(node.last_update(), 0);

        // emptying the include files returns every node to allowed
        fs::write(&include, "").unwrap();
        c.manager.refresh_nodes();
        assert!(!node.is_disallowed());
    }

    #[test]
    fn test_heartbeat_command_order_and_limits() {
        let c = cluster_with(ClusterConfig {
            block_invalidate_limit: Some(2),
            ..Default::default()
        });
        c.manager.set_send_caching_commands(true);
        let id = register(&c.manager, "10.0.0.1", "DS-1");
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();

        for i in 0..3 {
            node.add_block_to_be_replicated(Block::new(i, 0, 1), vec![]);
        }
        node.add_blocks_to_be_invalidated(vec![
            Block::new(10, 0, 1),
            Block::new(11, 0, 1),
            Block::new(12, 0, 1),
        ]);
        node.add_pending_cache(vec![20, 21]);
        node.add_pending_uncache(vec![30]);
        c.manager.set_balancer_bandwidth(2048);

        let response = c.manager.handle_heartbeat(&id, "BP-1", StorageStats::default(), 2);
        assert_eq!(
            command_kinds(&response),
            vec!["TRANSFER", "INVALIDATE", "CACHE", "UNCACHE", "BANDWIDTH"]
        );
        let commands = response.commands().unwrap();
        let DatanodeCommand::Transfer { blocks, .. } = &commands[0] else {
            panic!("expected transfer");
        };
        assert_eq!(blocks.len(), 2);
        let DatanodeCommand::Invalidate { blocks, .. } = &commands[1] else {
            panic!("expected invalidate");
        };
        assert_eq!(blocks.len(), 2);
        let DatanodeCommand::BalancerBandwidth { bytes_per_sec } = &commands[4] else {
            panic!("expected bandwidth");
        };
        assert_eq!(*bytes_per_sec, 2048);

        // remaining queue entries drain on the next heartbeat, and the
        // bandwidth announcement is not repeated
        let response = c.manager.handle_heartbeat(&id, "BP-1", StorageStats::default(), 2);
        assert_eq!(command_kinds(&response), vec!["TRANSFER", "INVALIDATE"]);

        // an empty queue yields an empty command list, twice over
        assert!(heartbeat(&c.manager, &id).is_empty());
        assert!(heartbeat(&c.manager, &id).is_empty());
    }

    #[test]
    fn test_caching_commands_cleared_silently_when_disabled() {
        let c = cluster();
        let id = register(&c.manager, "10.0.0.1", "DS-1");
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();

        node.add_pending_cache(vec![1, 2]);
        assert!(heartbeat(&c.manager, &id).is_empty());

        // the queue was cleared, not deferred
        c.manager.set_send_caching_commands(true);
        assert!(heartbeat(&c.manager, &id).is_empty());
    }

    #[test]
    fn test_safe_mode_returns_empty_and_keeps_queues() {
        let c = cluster();
        let id = register(&c.manager, "10.0.0.1", "DS-1");
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        node.add_block_to_be_replicated(Block::new(1, 0, 1), vec![]);

        c.namesystem.set_safe_mode(true);
        assert!(heartbeat(&c.manager, &id).is_empty());
        assert_eq!(node.pending_replication_count(), 1);

        c.namesystem.set_safe_mode(false);
        assert_eq!(command_kinds(&heartbeat(&c.manager, &id)), vec!["TRANSFER"]);
    }

    #[test]
    fn test_lease_recovery_preempts_other_commands() {
        let c = cluster();
        let id = register(&c.manager, "10.0.0.1", "DS-0");
        register(&c.manager, "10.0.0.2", "DS-1");
        register(&c.manager, "10.0.0.3", "DS-2");
        register(&c.manager, "10.0.1.1", "DS-3");

        let primary = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        let r1 = c.manager.get_datanode_by_xfer_addr("10.0.0.2", 50010).unwrap();
        let r2 = c.manager.get_datanode_by_xfer_addr("10.0.0.3", 50010).unwrap();
        let r3 = c.manager.get_datanode_by_xfer_addr("10.0.1.1", 50010).unwrap();

        // two of three expected locations have gone stale
        let now = time::now_millis();
        let stale = c.manager.config().stale_interval_ms;
        r1.set_last_update(now - stale - 10_000);
        r2.set_last_update(now - stale - 10_000);

        primary.add_block_to_be_recovered(BlockUnderConstruction {
            block: ExtendedBlock::new("BP-1", Block::new(5, 0, 9)),
            expected_locations: vec![r1.clone(), r2.clone(), r3.clone()],
        });
        primary.add_block_to_be_replicated(Block::new(6, 0, 1), vec![]);

        let response = heartbeat(&c.manager, &id);
        // recovery is the only command on this heartbeat
        assert_eq!(command_kinds(&response), vec!["RECOVERY"]);
        let DatanodeCommand::Recovery { blocks } = &response.commands().unwrap()[0] else {
            panic!("expected recovery");
        };
        // one fresh replica is not enough: recovery goes to all three
        assert_eq!(blocks[0].locations.len(), 3);

        // the transfer held back by recovery goes out on the next beat
        assert_eq!(command_kinds(&heartbeat(&c.manager, &id)), vec!["TRANSFER"]);

        // with two fresh replicas, the stale one is skipped
        r1.set_last_update(now);
        primary.add_block_to_be_recovered(BlockUnderConstruction {
            block: ExtendedBlock::new("BP-1", Block::new(7, 0, 9)),
            expected_locations: vec![r1.clone(), r2.clone(), r3.clone()],
        });
        let response = heartbeat(&c.manager, &id);
        let DatanodeCommand::Recovery { blocks } = &response.commands().unwrap()[0] else {
            panic!("expected recovery");
        };
        assert_eq!(blocks[0].locations.len(), 2);
        assert!(
            blocks[0]
                .locations
                .iter()
                .all(|l| l.ip_addr != r2.ip_addr())
        );
    }

    #[test]
    fn test_decommission_through_refresh_completes_without_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        let exclude = dir.path().join("exclude");
        fs::write(&include, "10.0.0.1 10.0.0.2\n").unwrap();
        fs::write(&exclude, "").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include),
            hosts_exclude: Some(exclude.clone()),
            ..Default::default()
        });
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.2", "DS-2");

        fs::write(&exclude, "10.0.0.2\n").unwrap();
        c.manager.refresh_nodes();

        // nothing to re-replicate, so decommission completes immediately
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.2", 50010).unwrap();
        assert!(node.is_decommissioned());
        assert!(c.manager.decommissioning_nodes().is_empty());

        // refresh with unchanged files is idempotent
        c.manager.refresh_nodes();
        assert!(node.is_decommissioned());

        // removing the exclusion returns the node to service
        fs::write(&exclude, "").unwrap();
        c.manager.refresh_nodes();
        assert_eq!(node.admin_state(), AdminState::Normal);
        assert_eq!(c.block_manager.over_replicated.lock().clone(), vec!["DS-2"]);
    }

    #[test]
    fn test_decommission_waits_for_replication() {
        let dir = tempfile::tempdir().unwrap();
        let exclude = dir.path().join("exclude");
        fs::write(&exclude, "10.0.0.1\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_exclude: Some(exclude),
            ..Default::default()
        });
        c.block_manager.set_replication_in_progress(true);

        // a registering node on the exclude list starts decommissioning
        register(&c.manager, "10.0.0.1", "DS-1");
        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        assert!(node.is_decommission_in_progress());
        assert!(node.decommission_start_time() > 0);
        assert_eq!(c.manager.decommissioning_nodes().len(), 1);

        // the monitor completes it once replication drains
        c.manager.decommission_tick();
        assert!(node.is_decommission_in_progress());
        c.block_manager.set_replication_in_progress(false);
        c.manager.decommission_tick();
        assert!(node.is_decommissioned());
    }

    #[test]
    fn test_decommission_monitor_budget_is_cyclic() {
        let c = cluster_with(ClusterConfig {
            decommission_nodes_per_interval: 1,
            ..Default::default()
        });
        c.block_manager.set_replication_in_progress(true);
        for i in 1..=3 {
            register(&c.manager, &format!("10.0.0.{i}"), &format!("DS-{i}"));
        }
        let nodes: Vec<_> = (1..=3)
            .map(|i| {
                c.manager
                    .get_datanode_by_xfer_addr(&format!("10.0.0.{i}"), 50010)
                    .unwrap()
            })
            .collect();
        for node in &nodes {
            c.manager.start_decommission(node);
        }
        c.block_manager.set_replication_in_progress(false);

        // one node per tick, resuming where the previous tick stopped
        for done in 1..=3 {
            c.manager.decommission_tick();
            let completed = nodes.iter().filter(|n| n.is_decommissioned()).count();
            assert_eq!(completed, done);
        }
    }

    #[test]
    fn test_multi_rack_first_transition_scans_once() {
        let c = cluster();
        c.namesystem.set_populating_replication_queues(true);

        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.2", "DS-2");
        assert!(!c.manager.has_ever_been_multi_rack());
        assert_eq!(c.block_manager.mis_replicated_scans.load(Ordering::Relaxed), 0);

        register(&c.manager, "10.0.1.1", "DS-3");
        assert!(c.manager.has_ever_been_multi_rack());
        assert_eq!(c.block_manager.mis_replicated_scans.load(Ordering::Relaxed), 1);

        // sticky: further rack growth does not rescan
        register(&c.manager, "10.1.0.1", "DS-4");
        assert_eq!(c.block_manager.mis_replicated_scans.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_multi_rack_transition_without_queues_does_not_scan() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.1.1", "DS-2");
        assert!(c.manager.has_ever_been_multi_rack());
        assert_eq!(c.block_manager.mis_replicated_scans.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_dead_sweep_removes_expired_nodes() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        let id2 = register(&c.manager, "10.0.0.2", "DS-2");
        heartbeat(&c.manager, &id2);

        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        let expire = c.manager.config().heartbeat_expire_interval_ms();
        node.set_last_update(time::now_millis().saturating_sub(expire + 1_000));

        c.manager.heartbeat_tick();

        assert_eq!(c.manager.datanode_list_for_report(ReportKind::All).len(), 1);
        assert!(c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).is_none());
        assert!(c.block_manager.removed_storage_ids().contains(&"DS-1".to_string()));
        assert_eq!(c.manager.cluster_stats().live_nodes, 1);
        assert_eq!(c.manager.cluster_stats().expired_heartbeats, 1);
        assert_eq!(c.manager.topology().num_leaves(), 1);
        assert_eq!(
            c.manager.datanode_software_versions().get("1.2.0"),
            Some(&1)
        );
    }

    #[test]
    fn test_sweep_publishes_stale_count() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.2", "DS-2");

        let node = c.manager.get_datanode_by_xfer_addr("10.0.0.1", 50010).unwrap();
        let stale = c.manager.config().stale_interval_ms;
        node.set_last_update(time::now_millis() - stale - 5_000);

        c.manager.heartbeat_tick();
        assert_eq!(c.manager.num_stale_nodes(), 1);
    }

    #[test]
    fn test_dead_report_synthesizes_included_but_unseen_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        let exclude = dir.path().join("exclude");
        fs::write(&include, "10.0.0.1 10.0.0.9 10.0.0.8\n").unwrap();
        fs::write(&exclude, "10.0.0.8\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include),
            hosts_exclude: Some(exclude),
            ..Default::default()
        });
        register(&c.manager, "10.0.0.1", "DS-1");

        let dead = c.manager.datanode_list_for_report(ReportKind::Dead);
        assert_eq!(dead.len(), 1);
        let placeholder = &dead[0];
        // port inferred from the configured default, identity synthesized
        assert_eq!(placeholder.xfer_addr(), "10.0.0.9:50010");
        assert!(placeholder.storage_id().is_empty());
        assert_eq!(placeholder.location(), DEFAULT_RACK);
        assert!(!placeholder.is_alive());

        let all = c.manager.datanode_list_for_report(ReportKind::All);
        assert_eq!(all.len(), 2);
        let live = c.manager.datanode_list_for_report(ReportKind::Live);
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn test_remove_decom_nodes_from_list() {
        let dir = tempfile::tempdir().unwrap();
        let include = dir.path().join("include");
        fs::write(&include, "10.0.0.1 10.0.0.2\n").unwrap();
        let c = cluster_with(ClusterConfig {
            hosts_include: Some(include.clone()),
            ..Default::default()
        });
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.0.2", "DS-2");

        let retired = c.manager.get_datanode_by_xfer_addr("10.0.0.2", 50010).unwrap();
        c.manager.start_decommission(&retired);
        assert!(retired.is_decommissioned());

        // operator retires the node from both lists
        fs::write(&include, "10.0.0.1\n").unwrap();
        c.manager.refresh_nodes();

        let mut nodes = c.manager.datanode_list_for_report(ReportKind::All);
        c.manager.remove_decom_nodes_from_list(&mut nodes);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].storage_id(), StorageId::new("DS-1"));
    }

    #[test]
    fn test_sort_located_blocks_by_distance_and_state() {
        let c = cluster();
        register(&c.manager, "10.0.0.2", "DS-1");
        register(&c.manager, "10.0.1.1", "DS-2");
        register(&c.manager, "10.1.0.1", "DS-3");
        let rack_local = c.manager.get_datanode_by_xfer_addr("10.0.0.2", 50010).unwrap();
        let same_dc = c.manager.get_datanode_by_xfer_addr("10.0.1.1", 50010).unwrap();
        let remote = c.manager.get_datanode_by_xfer_addr("10.1.0.1", 50010).unwrap();

        let mut blocks = vec![LocatedBlock {
            block: ExtendedBlock::new("BP-1", Block::new(1, 0, 1)),
            locations: vec![remote.clone(), same_dc.clone(), rack_local.clone()],
        }];
        // the reader is on rack1 but is not a datanode
        c.manager.sort_located_blocks("10.0.0.1", &mut blocks);
        let order: Vec<String> = blocks[0].locations.iter().map(|n| n.ip_addr()).collect();
        assert_eq!(order, vec!["10.0.0.2", "10.0.1.1", "10.1.0.1"]);

        // decommissioned nodes sink to the end regardless of distance
        c.manager.start_decommission(&rack_local);
        assert!(rack_local.is_decommissioned());
        c.manager.sort_located_blocks("10.0.0.1", &mut blocks);
        let order: Vec<String> = blocks[0].locations.iter().map(|n| n.ip_addr()).collect();
        assert_eq!(order, vec!["10.0.1.1", "10.1.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_sort_located_blocks_demotes_stale_when_configured() {
        let c = cluster_with(ClusterConfig {
            avoid_stale_datanodes_for_read: true,
            ..Default::default()
        });
        register(&c.manager, "10.0.0.2", "DS-1");
        register(&c.manager, "10.0.1.1", "DS-2");
        let rack_local = c.manager.get_datanode_by_xfer_addr("10.0.0.2", 50010).unwrap();
        let same_dc = c.manager.get_datanode_by_xfer_addr("10.0.1.1", 50010).unwrap();

        let stale = c.manager.config().stale_interval_ms;
        rack_local.set_last_update(time::now_millis() - stale - 5_000);

        let mut blocks = vec![LocatedBlock {
            block: ExtendedBlock::new("BP-1", Block::new(1, 0, 1)),
            locations: vec![rack_local.clone(), same_dc.clone()],
        }];
        c.manager.sort_located_blocks("10.0.0.1", &mut blocks);
        let order: Vec<String> = blocks[0].locations.iter().map(|n| n.ip_addr()).collect();
        assert_eq!(order, vec!["10.0.1.1", "10.0.0.2"]);
    }

    #[test]
    fn test_get_datanode_descriptor_fallbacks() {
        let c = cluster();
        register(&c.manager, "10.0.0.1", "DS-1");
        register(&c.manager, "10.0.1.1", "DS-2");

        // exact transfer address
        let found = c.manager.get_datanode_descriptor("10.0.0.1:50010").unwrap();
        assert_eq!(found.storage_id(), StorageId::new("DS-1"));
        // any node on the host
        let found = c.manager.get_datanode_descriptor("10.0.0.1").unwrap();
        assert_eq!(found.storage_id(), StorageId::new("DS-1"));
        // unregistered host, known rack: a rack-mate
        let found = c.manager.get_datanode_descriptor("10.0.0.3").unwrap();
        assert_eq!(found.storage_id(), StorageId::new("DS-1"));
        // unknown host: any node in the cluster
        assert!(c.manager.get_datanode_descriptor("10.99.99.99").is_some());
    }

    #[test]
    fn test_operator_remove_datanode() {
        let c = cluster();
        let id = register(&c.manager, "10.0.0.1", "DS-1");

        assert!(matches!(
            c.manager.remove_datanode(&reg_id("10.0.0.9", 50010, "DS-9")),
            Err(Error::NodeNotFound(_))
        ));
        assert!(matches!(
            c.manager.remove_datanode(&reg_id("10.0.0.9", 50010, "DS-1")),
            Err(Error::UnregisteredNode { .. })
        ));

        c.manager.remove_datanode(&id).unwrap();
        assert!(c.manager.datanode_list_for_report(ReportKind::All).is_empty());
        assert!(c.manager.datanode_software_versions().is_empty());
        assert_eq!(c.block_manager.removed_storage_ids(), vec!["DS-1"]);
    }

    #[test]
    fn test_software_version_histogram_tracks_membership() {
        let c = cluster();
        c.manager
            .register_datanode(reg_id("10.0.0.1", 50010, "DS-1"), Some("1.2.0".into()), None)
            .unwrap();
        c.manager
            .register_datanode(reg_id("10.0.0.2", 50010, "DS-2"), Some("1.2.0".into()), None)
            .unwrap();
        let id3 = c
            .manager
            .register_datanode(reg_id("10.0.0.3", 50010, "DS-3"), Some("1.3.0".into()), None)
            .unwrap();

        let versions = c.manager.datanode_software_versions();
        assert_eq!(versions.get("1.2.0"), Some(&2));
        assert_eq!(versions.get("1.3.0"), Some(&1));

        c.manager.remove_datanode(&id3).unwrap();
        let versions = c.manager.datanode_software_versions();
        assert_eq!(versions.get("1.3.0"), None);

        // an upgrade re-registration moves the node between buckets
        c.manager
            .register_datanode(reg_id("10.0.0.2", 50010, "DS-2"), Some("1.3.0".into()), None)
            .unwrap();
        let versions = c.manager.datanode_software_versions();
        assert_eq!(versions.get("1.2.0"), Some(&1));
        assert_eq!(versions.get("1.3.0"), Some(&1));
    }
}
