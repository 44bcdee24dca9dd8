//! Secondary index: host IP -> datanode descriptors
//!
//! Not internally synchronized; every access goes through the registry
//! monitor in [`crate::manager::DatanodeManager`].

use crate::descriptor::DatanodeDescriptor;
use std::collections::HashMap;
use std::sync::Arc;

/// Host-to-descriptors index with transfer-address lookup.
#[derive(Default)]
pub struct Host2NodesIndex {
    map: HashMap<String, Vec<Arc<DatanodeDescriptor>>>,
}

impl Host2NodesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor under its current IP address
    pub fn add(&mut self, node: &Arc<DatanodeDescriptor>) {
        let entry = self.map.entry(node.ip_addr()).or_default();
        if !entry.iter().any(|n| Arc::ptr_eq(n, node)) {
            entry.push(Arc::clone(node));
        }
    }

    /// Remove a descriptor; returns whether it was present
    pub fn remove(&mut self, node: &Arc<DatanodeDescriptor>) -> bool {
        let ip = node.ip_addr();
        let Some(entry) = self.map.get_mut(&ip) else {
            return false;
        };
        let Some(pos) = entry.iter().position(|n| Arc::ptr_eq(n, node)) else {
            return false;
        };
        entry.remove(pos);
        if entry.is_empty() {
            self.map.remove(&ip);
        }
        true
    }

    /// One descriptor on the given host, arbitrary when several share it
    pub fn lookup_by_host(&self, ip: &str) -> Option<Arc<DatanodeDescriptor>> {
        self.map.get(ip).and_then(|v| v.first()).cloned()
    }

    /// The unique descriptor at `ip:xfer_port`, if any
    pub fn lookup_by_xfer_addr(&self, ip: &str, xfer_port: u16) -> Option<Arc<DatanodeDescriptor>> {
        self.map.get(ip).and_then(|v| {
            v.iter()
                .find(|n| n.datanode_id().xfer_port == xfer_port)
                .cloned()
        })
    }
}
