//! Heartbeat statistics
//!
//! Accumulates cluster-wide capacity and usage totals from heartbeats,
//! tracks the live-node list the dead sweep walks, and publishes the stale
//! count that placement consults. In-service nodes contribute their full
//! counters; decommissioning and decommissioned nodes only their cache
//! counters.
//!
//! Lock ordering: the statistics lock is acquired before the registry
//! monitor, never after.

use crate::descriptor::{DatanodeDescriptor, StorageStats};
use blockgrid_common::AdminState;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Aggregate cluster totals.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ClusterStats {
    pub capacity_total: u64,
    pub capacity_used: u64,
    pub capacity_remaining: u64,
    pub block_pool_used: u64,
    pub cache_capacity: u64,
    pub cache_used: u64,
    pub xceiver_count: u64,
    pub live_nodes: usize,
    pub expired_heartbeats: u64,
}

#[derive(Default)]
struct Totals {
    capacity: u64,
    used: u64,
    remaining: u64,
    block_pool_used: u64,
    cache_capacity: u64,
    cache_used: u64,
    xceivers: u64,
}

impl Totals {
    fn add(&mut self, stats: &StorageStats, admin: AdminState) {
        self.cache_capacity += stats.cache_capacity;
        self.cache_used += stats.cache_used;
        if admin == AdminState::Normal {
            self.capacity += stats.capacity;
            self.used += stats.dfs_used;
            self.remaining += stats.remaining;
            self.block_pool_used += stats.block_pool_used;
            self.xceivers += u64::from(stats.xceiver_count);
        }
    }

    fn subtract(&mut self, stats: &StorageStats, admin: AdminState) {
        self.cache_capacity = self.cache_capacity.saturating_sub(stats.cache_capacity);
        self.cache_used = self.cache_used.saturating_sub(stats.cache_used);
        if admin == AdminState::Normal {
            self.capacity = self.capacity.saturating_sub(stats.capacity);
            self.used = self.used.saturating_sub(stats.dfs_used);
            self.remaining = self.remaining.saturating_sub(stats.remaining);
            self.block_pool_used = self.block_pool_used.saturating_sub(stats.block_pool_used);
            self.xceivers = self.xceivers.saturating_sub(u64::from(stats.xceiver_count));
        }
    }
}

struct StatsInner {
    live: Vec<Arc<DatanodeDescriptor>>,
    totals: Totals,
}

/// Heartbeat statistics manager.
pub struct HeartbeatStats {
    avoid_stale_for_write: bool,
    stale_write_ratio: f32,
    inner: Mutex<StatsInner>,
    /// Written by the sweep without the statistics lock; readers tolerate
    /// momentarily stale values
    num_stale_nodes: AtomicUsize,
    expired_heartbeats: AtomicU64,
}

impl HeartbeatStats {
    pub fn new(avoid_stale_for_write: bool, stale_write_ratio: f32) -> Self {
        Self {
            avoid_stale_for_write,
            stale_write_ratio,
            inner: Mutex::new(StatsInner {
                live: Vec::new(),
                totals: Totals::default(),
            }),
            num_stale_nodes: AtomicUsize::new(0),
            expired_heartbeats: AtomicU64::new(0),
        }
    }

    /// Track a newly registered node; counts as its first heartbeat
    pub fn register(&self, node: &Arc<DatanodeDescriptor>, now: u64) {
        let mut inner = self.inner.lock();
        if !inner.live.iter().any(|n| Arc::ptr_eq(n, node)) {
            inner
                .totals
                .add(&node.storage_stats(), node.admin_state());
            inner.live.push(Arc::clone(node));
        }
        node.set_alive(true);
        node.set_last_update(now);
    }

    /// Stop tracking a node and mark it not alive
    pub fn remove(&self, node: &Arc<DatanodeDescriptor>) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.live.iter().position(|n| Arc::ptr_eq(n, node)) {
            inner
                .totals
                .subtract(&node.storage_stats(), node.admin_state());
            inner.live.remove(pos);
        }
        node.set_alive(false);
    }

    /// Fold a heartbeat's counters into the totals
    pub fn update_heartbeat(&self, node: &Arc<DatanodeDescriptor>, reported: StorageStats, now: u64) {
        let mut inner = self.inner.lock();
        let tracked = inner.live.iter().any(|n| Arc::ptr_eq(n, node));
        if tracked {
            inner
                .totals
                .subtract(&node.storage_stats(), node.admin_state());
        }
        node.update_heartbeat(reported, now);
        if tracked {
            inner.totals.add(&reported, node.admin_state());
        }
    }

    /// Flip a node into decommission-in-progress, keeping totals consistent
    pub fn start_decommission(&self, node: &Arc<DatanodeDescriptor>, now: u64) {
        let mut inner = self.inner.lock();
        inner
            .totals
            .subtract(&node.storage_stats(), node.admin_state());
        node.start_decommission(now);
        inner.totals.add(&node.storage_stats(), node.admin_state());
    }

    /// Return a node to service, keeping totals consistent
    pub fn stop_decommission(&self, node: &Arc<DatanodeDescriptor>) {
        let mut inner = self.inner.lock();
        inner
            .totals
            .subtract(&node.storage_stats(), node.admin_state());
        node.stop_decommission();
        inner.totals.add(&node.storage_stats(), node.admin_state());
    }

    /// Aggregate totals snapshot
    #[must_use]
    pub fn cluster_stats(&self) -> ClusterStats {
        let inner = self.inner.lock();
        ClusterStats {
            capacity_total: inner.totals.capacity,
            capacity_used: inner.totals.used,
            capacity_remaining: inner.totals.remaining,
            block_pool_used: inner.totals.block_pool_used,
            cache_capacity: inner.totals.cache_capacity,
            cache_used: inner.totals.cache_used,
            xceiver_count: inner.totals.xceivers,
            live_nodes: inner.live.len(),
            expired_heartbeats: self.expired_heartbeats.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Snapshot of the live list, for the dead sweep
    #[must_use]
    pub fn live_snapshot(&self) -> Vec<Arc<DatanodeDescriptor>> {
        self.inner.lock().live.clone()
    }

    #[must_use]
    pub fn num_stale_nodes(&self) -> usize {
        self.num_stale_nodes.load(Ordering::Relaxed)
    }

    pub fn set_num_stale_nodes(&self, count: usize) {
        self.num_stale_nodes.store(count, Ordering::Relaxed);
    }

    pub fn incr_expired_heartbeats(&self) {
        self.expired_heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether placement should still avoid stale nodes for writes.
    ///
    /// Suspended when the stale fraction of live nodes exceeds the
    /// configured ratio, so a mass-staleness event does not starve writes.
    #[must_use]
    pub fn should_avoid_stale_datanodes_for_write(&self) -> bool {
        if !self.avoid_stale_for_write {
            return false;
        }
        let stale = self.num_stale_nodes() as f64;
        let live = self.live_count() as f64;
        stale <= live * f64::from(self.stale_write_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockgrid_common::{DatanodeId, StorageId};

    fn node(ip: &str, storage: &str) -> Arc<DatanodeDescriptor> {
        Arc::new(DatanodeDescriptor::new(
            DatanodeId {
                ip_addr: ip.to_string(),
                host_name: format!("host-{ip}"),
                peer_host_name: None,
                xfer_port: 50010,
                info_port: 0,
                info_secure_port: 0,
                ipc_port: 0,
                storage_id: StorageId::new(storage),
            },
            "/dc1/rack1",
        ))
    }

    fn reported(capacity: u64, used: u64) -> StorageStats {
        StorageStats {
            capacity,
            dfs_used: used,
            remaining: capacity - used,
            cache_capacity: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_update_remove_totals() {
        let stats = HeartbeatStats::new(false, 0.5);
        let a = node("10.0.0.1", "DS-1");

        stats.register(&a, 1_000);
        assert!(a.is_alive());
        assert_eq!(stats.live_count(), 1);

        stats.update_heartbeat(&a, reported(100, 30), 2_000);
        let snapshot = stats.cluster_stats();
        assert_eq!(snapshot.capacity_total, 100);
        assert_eq!(snapshot.capacity_used, 30);
        assert_eq!(snapshot.cache_capacity, 10);

        stats.update_heartbeat(&a, reported(100, 50), 3_000);
        assert_eq!(stats.cluster_stats().capacity_used, 50);

        stats.remove(&a);
        assert!(!a.is_alive());
        assert_eq!(stats.live_count(), 0);
        assert_eq!(stats.cluster_stats().capacity_total, 0);
    }

    #[test]
    fn test_decommissioning_node_keeps_only_cache_totals() {
        let stats = HeartbeatStats::new(false, 0.5);
        let a = node("10.0.0.1", "DS-1");
        stats.register(&a, 1_000);
        stats.update_heartbeat(&a, reported(100, 30), 2_000);

        stats.start_decommission(&a, 2_500);
        let snapshot = stats.cluster_stats();
        assert_eq!(snapshot.capacity_total, 0);
        assert_eq!(snapshot.cache_capacity, 10);
        assert_eq!(snapshot.live_nodes, 1);

        stats.stop_decommission(&a);
        assert_eq!(stats.cluster_stats().capacity_total, 100);
    }

    #[test]
    fn test_avoid_stale_for_write_ratio() {
        let stats = HeartbeatStats::new(true, 0.5);
        for i in 0..4 {
            stats.register(&node(&format!("10.0.0.{i}"), &format!("DS-{i}")), 1_000);
        }

        stats.set_num_stale_nodes(2);
        assert!(stats.should_avoid_stale_datanodes_for_write());
        stats.set_num_stale_nodes(3);
        assert!(!stats.should_avoid_stale_datanodes_for_write());
    }

    #[test]
    fn test_avoid_stale_disabled_by_config() {
        let stats = HeartbeatStats::new(false, 0.5);
        stats.set_num_stale_nodes(0);
        assert!(!stats.should_avoid_stale_datanodes_for_write());
    }
}
