//! Coordinator-wide lock and mode flags
//!
//! The namesystem lock is the outermost lock in the ordering: it is held
//! across every mutation that also touches the block manager. The flags
//! are owned by the surrounding coordinator; the datanode manager only
//! reads them.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared coordinator state: the global lock plus safe-mode and
/// startup-progress flags.
#[derive(Default)]
pub struct Namesystem {
    lock: RwLock<()>,
    safe_mode: AtomicBool,
    populating_replication_queues: AtomicBool,
}

impl Namesystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the namesystem write lock; released on drop
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Acquire the namesystem read lock; released on drop
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// True while the coordinator refuses mutations and heartbeat commands
    #[must_use]
    pub fn is_in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Relaxed)
    }

    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::Relaxed);
    }

    /// True once startup has progressed far enough that replication queues
    /// are being populated
    #[must_use]
    pub fn is_populating_replication_queues(&self) -> bool {
        self.populating_replication_queues.load(Ordering::Relaxed)
    }

    pub fn set_populating_replication_queues(&self, on: bool) {
        self.populating_replication_queues.store(on, Ordering::Relaxed);
    }
}
