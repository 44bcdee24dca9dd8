//! Include/exclude host policy
//!
//! Operator-curated host files bound cluster membership: a non-empty
//! include list admits only the hosts it names, and the exclude list
//! schedules decommissioning. Files hold whitespace-separated
//! `host[:port]` tokens; `#` starts a comment. Port 0 (or no port)
//! matches any port.

use blockgrid_common::{DatanodeId, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

/// One host-file entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct HostEntry {
    /// Set when the entry names an IP literal
    pub ip_address: Option<String>,
    /// Hostname prefix, when the entry is not an IP literal
    pub host_name_prefix: String,
    /// Transfer port; 0 matches any
    pub port: u16,
}

impl HostEntry {
    /// Parse one `host[:port]` token; `None` for malformed tokens
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() {
            return None;
        }
        let (host, port) = match token.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => {
                    warn!("ignoring host entry with malformed port: {}", token);
                    return None;
                }
            },
            None => (token, 0),
        };
        if host.is_empty() {
            return None;
        }
        if host.parse::<IpAddr>().is_ok() {
            Some(Self {
                ip_address: Some(host.to_string()),
                host_name_prefix: String::new(),
                port,
            })
        } else {
            Some(Self {
                ip_address: None,
                host_name_prefix: host.to_ascii_lowercase(),
                port,
            })
        }
    }

    /// Check this entry against an address triple
    #[must_use]
    pub fn matches_addr(&self, ip: &str, host_name: &str, xfer_port: u16) -> bool {
        if self.port != 0 && self.port != xfer_port {
            return false;
        }
        match &self.ip_address {
            Some(entry_ip) => entry_ip == ip,
            None => host_name
                .to_ascii_lowercase()
                .starts_with(&self.host_name_prefix),
        }
    }

    /// Check this entry against a datanode identity
    #[must_use]
    pub fn matches(&self, id: &DatanodeId) -> bool {
        self.matches_addr(&id.ip_addr, &id.host_name, id.xfer_port)
            || id
                .peer_host_name
                .as_deref()
                .is_some_and(|peer| self.matches_addr(&id.ip_addr, peer, id.xfer_port))
    }

    /// The host this entry names, IP literal or hostname prefix
    #[must_use]
    pub fn host(&self) -> &str {
        self.ip_address.as_deref().unwrap_or(&self.host_name_prefix)
    }
}

#[derive(Default)]
struct HostLists {
    include: Vec<HostEntry>,
    exclude: Vec<HostEntry>,
}

/// Host-file policy with atomic refresh.
#[derive(Default)]
pub struct HostFileManager {
    lists: RwLock<HostLists>,
}

impl HostFileManager {
    /// Start with empty lists: everything included, nothing excluded
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read both host files and swap the policy in one step.
    ///
    /// A missing path means an empty list. On any IO error the previous
    /// policy stays in effect and the error is returned for logging.
    pub fn refresh(&self, include: Option<&Path>, exclude: Option<&Path>) -> Result<()> {
        let include = match include {
            Some(path) => parse_host_file(path)?,
            None => Vec::new(),
        };
        let exclude = match exclude {
            Some(path) => parse_host_file(path)?,
            None => Vec::new(),
        };
        debug!(
            "refreshed host files: {} include, {} exclude entries",
            include.len(),
            exclude.len()
        );
        *self.lists.write() = HostLists { include, exclude };
        Ok(())
    }

    /// True when the include list admits this node (an empty include list
    /// admits everyone)
    #[must_use]
    pub fn is_included(&self, id: &DatanodeId) -> bool {
        let lists = self.lists.read();
        lists.include.is_empty() || lists.include.iter().any(|e| e.matches(id))
    }

    /// True when the exclude list names this node
    #[must_use]
    pub fn is_excluded(&self, id: &DatanodeId) -> bool {
        self.lists.read().exclude.iter().any(|e| e.matches(id))
    }

    /// True when an include list is in force
    #[must_use]
    pub fn has_includes(&self) -> bool {
        !self.lists.read().include.is_empty()
    }

    /// Snapshot of the include entries
    #[must_use]
    pub fn include_entries(&self) -> Vec<HostEntry> {
        self.lists.read().include.clone()
    }
}

fn parse_host_file(path: &Path) -> Result<Vec<HostEntry>> {
    let contents = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("");
        for token in line.split_whitespace() {
            if let Some(entry) = HostEntry::parse(token) {
                entries.push(entry);
            }
        }
    }
    Ok(entries)
}
