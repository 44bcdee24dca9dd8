//! Error types for BlockGrid
//!
//! This module defines the common error type used throughout the system.

use thiserror::Error;

/// Common result type for BlockGrid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockGrid
#[derive(Debug, Error)]
pub enum Error {
    /// Registration or heartbeat refused by host policy
    #[error("datanode denied communication with coordinator: {node}: {reason}")]
    Disallowed { node: String, reason: String },

    /// The topology tree refused a node placement
    #[error("invalid network topology: {0}")]
    InvalidTopology(String),

    /// A heartbeat matched a storage ID registered at a different address
    #[error("unregistered datanode {node}: storage is registered at {registered}")]
    UnregisteredNode { node: String, registered: String },

    /// Host-file read or parse failure
    #[error("host file error: {0}")]
    HostFile(#[from] std::io::Error),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a disallowed-node error
    pub fn disallowed(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Disallowed {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-topology error
    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error rejects a node outright
    #[must_use]
    pub fn is_disallowed(&self) -> bool {
        matches!(self, Self::Disallowed { .. })
    }

    /// Check if this error came from the topology tree
    #[must_use]
    pub fn is_invalid_topology(&self) -> bool {
        matches!(self, Self::InvalidTopology(_))
    }
}
