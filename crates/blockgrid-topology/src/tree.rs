//! The cluster topology tree

use crate::node::{
    NodeBase, PATH_SEPARATOR, TopologyNode, first_component, location_depth, normalize_location,
};
use blockgrid_common::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Default)]
struct TopoState {
    /// Rack path -> leaves in that rack
    racks: BTreeMap<String, Vec<NodeBase>>,
    /// Established rack-path depth; all leaves must agree
    depth: Option<usize>,
    num_leaves: usize,
}

/// Tree of rack paths with datanodes at the leaves.
///
/// Thread-safe; mutators and queries take the interior lock for the
/// duration of the call only.
#[derive(Default)]
pub struct NetworkTopology {
    state: RwLock<TopoState>,
}

impl NetworkTopology {
    /// Create an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leaf to the tree.
    ///
    /// Fails with `InvalidTopology` when the leaf name is already present,
    /// when the name itself contains a path separator, or when the rack
    /// path's depth conflicts with the structure established by earlier
    /// leaves (a rack and a non-rack entry at the same level).
    pub fn add(&self, node: &dyn TopologyNode) -> Result<()> {
        let name = node.name();
        if name.contains(PATH_SEPARATOR) {
            return Err(Error::invalid_topology(format!(
                "leaf name {name} must not contain '{PATH_SEPARATOR}'"
            )));
        }
        let location = normalize_location(&node.network_location());
        let depth = location_depth(&location);
        if depth == 0 {
            return Err(Error::invalid_topology(format!(
                "leaf {name} must be placed under a rack, got {location}"
            )));
        }

        let mut state = self.state.write();
        if let Some(established) = state.depth
            && established != depth
        {
            return Err(Error::invalid_topology(format!(
                "rack path {location} has depth {depth}, but the tree is built \
                 with racks at depth {established}"
            )));
        }
        if state
            .racks
            .values()
            .any(|rack| rack.iter().any(|n| n.name == name))
        {
            return Err(Error::invalid_topology(format!(
                "leaf {name} is already in the topology"
            )));
        }

        state
            .racks
            .entry(location.clone())
            .or_default()
            .push(NodeBase::new(name.clone(), location.clone()));
        state.depth.get_or_insert(depth);
        state.num_leaves += 1;
        debug!(
            "added node {}/{} ({} racks, {} leaves)",
            location,
            name,
            state.racks.len(),
            state.num_leaves
        );
        Ok(())
    }

    /// Remove a leaf from the tree; returns whether it was present.
    pub fn remove(&self, node: &dyn TopologyNode) -> bool {
        let name = node.name();
        let location = normalize_location(&node.network_location());

        let mut state = self.state.write();
        let Some(rack) = state.racks.get_mut(&location) else {
            return false;
        };
        let Some(pos) = rack.iter().position(|n| n.name == name) else {
            return false;
        };
        rack.remove(pos);
        if rack.is_empty() {
            state.racks.remove(&location);
        }
        state.num_leaves -= 1;
        if state.num_leaves == 0 {
            state.depth = None;
        }
        debug!("removed node {}/{}", location, name);
        true
    }

    /// Check whether a leaf with the given name is in the tree
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state
            .read()
            .racks
            .values()
            .any(|rack| rack.iter().any(|n| n.name == name))
    }

    /// Number of racks currently holding at least one leaf
    #[must_use]
    pub fn num_racks(&self) -> usize {
        self.state.read().racks.len()
    }

    /// Number of leaves in the tree
    #[must_use]
    pub fn num_leaves(&self) -> usize {
        self.state.read().num_leaves
    }

    /// Leaves in the given rack, in insertion order
    #[must_use]
    pub fn nodes_in_rack(&self, rack: &str) -> Vec<NodeBase> {
        let location = normalize_location(rack);
        self.state
            .read()
            .racks
            .get(&location)
            .cloned()
            .unwrap_or_default()
    }

    /// Pick a uniformly random leaf under `scope` (`/` for the whole tree)
    #[must_use]
    pub fn choose_random(&self, scope: &str) -> Option<NodeBase> {
        let scope = normalize_location(scope);
        let state = self.state.read();
        let candidates: Vec<&NodeBase> = state
            .racks
            .iter()
            .filter(|(rack, _)| {
                scope == "/" || **rack == scope || rack.starts_with(&format!("{scope}/"))
            })
            .flat_map(|(_, leaves)| leaves.iter())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[idx].clone())
    }

    /// Stably reorder `nodes` so that topologically closer entries come
    /// first: the reader itself, then same-rack, then same-datacenter, then
    /// the rest. Entries within one tier keep their input order.
    pub fn pseudo_sort_by_distance<N: TopologyNode>(&self, reader: &NodeBase, nodes: &mut [N]) {
        let reader_name = reader.name.clone();
        let reader_location = normalize_location(&reader.location);
        let reader_dc = first_component(&reader_location).to_string();

        nodes.sort_by_key(|n| {
            let location = normalize_location(&n.network_location());
            if n.name() == reader_name {
                0u8
            } else if location == reader_location {
                2
            } else if first_component(&location) == reader_dc {
                4
            } else {
                6
            }
        });
    }
}
