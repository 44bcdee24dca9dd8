//! BlockGrid common library
//!
//! Shared building blocks for the BlockGrid cluster coordinator: storage
//! node identifiers, block types, cluster configuration, and the common
//! error type.

pub mod config;
pub mod error;
pub mod types;

pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use types::{AdminState, Block, DatanodeId, ExtendedBlock, StorageId};
