//! Configuration types for BlockGrid
//!
//! Cluster-coordinator configuration with production defaults. Values are
//! validated and clamped once at startup through [`ClusterConfig::validated`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Datanode manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Heartbeat cadence expected from datanodes (seconds)
    pub heartbeat_interval_secs: u64,
    /// Dead-node sweep cadence (milliseconds)
    pub heartbeat_recheck_interval_ms: u64,
    /// Per-heartbeat invalidation cap; `None` selects the derived default
    pub block_invalidate_limit: Option<usize>,
    /// Reject registrations whose address does not reverse-resolve
    pub check_ip_hostname: bool,
    /// Demote stale nodes when sorting block locations for reads
    pub avoid_stale_datanodes_for_read: bool,
    /// Advise placement to skip stale nodes for writes
    pub avoid_stale_datanodes_for_write: bool,
    /// Interval after which a silent node is considered stale (milliseconds)
    pub stale_interval_ms: u64,
    /// Floor for the stale interval, in missed heartbeats
    pub stale_min_heartbeats: u64,
    /// Stale fraction of live nodes above which stale-avoidance for writes
    /// is suspended; must be in (0, 1]
    pub use_stale_write_ratio: f32,
    /// Decommission monitor cadence (seconds)
    pub decommission_interval_secs: u64,
    /// Decommissioning nodes inspected per monitor tick
    pub decommission_nodes_per_interval: usize,
    /// Include host file; `None` admits every host
    pub hosts_include: Option<PathBuf>,
    /// Exclude host file; `None` excludes nothing
    pub hosts_exclude: Option<PathBuf>,
    /// Transfer port assumed for host entries that do not carry one
    pub default_xfer_port: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 3,
            heartbeat_recheck_interval_ms: 5 * 60 * 1000,
            block_invalidate_limit: None,
            check_ip_hostname: true,
            avoid_stale_datanodes_for_read: false,
            avoid_stale_datanodes_for_write: false,
            stale_interval_ms: 30_000,
            stale_min_heartbeats: 3,
            use_stale_write_ratio: 0.5,
            decommission_interval_secs: 30,
            decommission_nodes_per_interval: 5,
            hosts_include: None,
            hosts_exclude: None,
            default_xfer_port: 50010,
        }
    }
}

impl ClusterConfig {
    /// Interval after which a silent node is declared dead (milliseconds).
    ///
    /// Two full recheck periods plus ten missed heartbeats.
    #[must_use]
    pub fn heartbeat_expire_interval_ms(&self) -> u64 {
        2 * self.heartbeat_recheck_interval_ms + 10 * self.heartbeat_interval_secs * 1000
    }

    /// Effective per-heartbeat invalidation cap.
    #[must_use]
    pub fn effective_block_invalidate_limit(&self) -> usize {
        self.block_invalidate_limit
            .unwrap_or_else(|| usize::max(20 * self.heartbeat_interval_secs as usize, 1000))
    }

    /// Validate and clamp the configuration.
    ///
    /// The stale interval is raised to `stale_min_heartbeats` heartbeat
    /// periods when configured below that floor, and a stale interval
    /// beyond the dead threshold is warned about but honored.
    pub fn validated(mut self) -> Result<Self> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::configuration("heartbeat interval must be positive"));
        }
        if !(self.use_stale_write_ratio > 0.0 && self.use_stale_write_ratio <= 1.0) {
            return Err(Error::configuration(format!(
                "stale write ratio must be in (0, 1], got {}",
                self.use_stale_write_ratio
            )));
        }

        let stale_floor_ms = self.stale_min_heartbeats * self.heartbeat_interval_secs * 1000;
        if self.stale_interval_ms < stale_floor_ms {
            warn!(
                "stale interval {}ms is below the floor of {} heartbeats; raising to {}ms",
                self.stale_interval_ms, self.stale_min_heartbeats, stale_floor_ms
            );
            self.stale_interval_ms = stale_floor_ms;
        }
        if self.stale_interval_ms > self.heartbeat_expire_interval_ms() {
            warn!(
                "stale interval {}ms exceeds the dead-node threshold of {}ms; \
                 stale nodes will be declared dead first",
                self.stale_interval_ms,
                self.heartbeat_expire_interval_ms()
            );
        }

        Ok(self)
    }
}
