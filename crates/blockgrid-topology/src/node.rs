//! Leaf node representation and location path helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Rack assigned to nodes whose location cannot be resolved
pub const DEFAULT_RACK: &str = "/default-rack";

/// Separator between components of a rack path
pub const PATH_SEPARATOR: char = '/';

/// Anything that can live in the topology tree: a name (the transfer
/// address for datanodes) plus a rack path.
pub trait TopologyNode {
    /// Unique leaf name, e.g. `10.0.0.1:50010`
    fn name(&self) -> String;

    /// Rack path, e.g. `/dc1/rack7`
    fn network_location(&self) -> String;
}

impl<T: TopologyNode + ?Sized> TopologyNode for &T {
    fn name(&self) -> String {
        (**self).name()
    }

    fn network_location(&self) -> String {
        (**self).network_location()
    }
}

impl<T: TopologyNode + ?Sized> TopologyNode for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn network_location(&self) -> String {
        (**self).network_location()
    }
}

/// A plain leaf value: name and location with no further state.
///
/// Used for readers that are not registered datanodes and as the snapshot
/// row returned by tree queries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeBase {
    /// Leaf name
    pub name: String,
    /// Rack path
    pub location: String,
}

impl NodeBase {
    /// Create a new leaf value; the location is normalized
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: normalize_location(&location.into()),
        }
    }

    /// Full path of this leaf, `location/name`
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}{}{}", self.location, PATH_SEPARATOR, self.name)
    }
}

impl TopologyNode for NodeBase {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn network_location(&self) -> String {
        self.location.clone()
    }
}

impl fmt::Display for NodeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Normalize a rack path: leading separator, no trailing separator.
#[must_use]
pub fn normalize_location(location: &str) -> String {
    let trimmed = location.trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        return String::from(PATH_SEPARATOR);
    }
    if trimmed.starts_with(PATH_SEPARATOR) {
        trimmed.to_string()
    } else {
        format!("{PATH_SEPARATOR}{trimmed}")
    }
}

/// Number of components in a normalized rack path (`/d1/r1` has two).
#[must_use]
pub fn location_depth(location: &str) -> usize {
    location
        .split(PATH_SEPARATOR)
        .filter(|c| !c.is_empty())
        .count()
}

/// First component of a rack path, the datacenter tier.
#[must_use]
pub fn first_component(location: &str) -> &str {
    location
        .split(PATH_SEPARATOR)
        .find(|c| !c.is_empty())
        .unwrap_or("")
}
