//! Host-to-rack resolution
//!
//! Maps host names or IPs to rack paths. Resolution may sit in front of an
//! external script or service, so implementations can block; the heartbeat
//! fast path never calls into a resolver.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Capability for mapping hosts to rack paths.
///
/// `resolve` returns one entry per input name; `None` means the resolver
/// has no answer and the caller falls back to the default rack.
pub trait RackResolver: Send + Sync {
    fn resolve(&self, names: &[String]) -> Vec<Option<String>>;

    /// Downcast to the caching variant, when this resolver is one.
    ///
    /// The manager uses this to pre-warm include-list hosts and to evict
    /// entries after a topology conflict.
    fn as_caching(&self) -> Option<&dyn CachingRackResolver> {
        None
    }
}

impl<R: RackResolver + ?Sized> RackResolver for std::sync::Arc<R> {
    fn resolve(&self, names: &[String]) -> Vec<Option<String>> {
        (**self).resolve(names)
    }

    fn as_caching(&self) -> Option<&dyn CachingRackResolver> {
        (**self).as_caching()
    }
}

/// A resolver that holds previously resolved mappings.
pub trait CachingRackResolver: RackResolver {
    /// Drop cached mappings for the given names so the next resolution
    /// consults the backing resolver again
    fn reload_cached(&self, names: &[String]);
}

/// Table-backed resolver: a fixed host -> rack map.
#[derive(Default)]
pub struct StaticRackResolver {
    table: HashMap<String, String>,
}

impl StaticRackResolver {
    /// Create a resolver over the given table
    #[must_use]
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }

    /// Add one mapping
    pub fn insert(&mut self, host: impl Into<String>, rack: impl Into<String>) {
        self.table.insert(host.into(), rack.into());
    }
}

impl RackResolver for StaticRackResolver {
    fn resolve(&self, names: &[String]) -> Vec<Option<String>> {
        names.iter().map(|n| self.table.get(n).cloned()).collect()
    }
}

/// Caching wrapper over another resolver.
///
/// Resolved mappings (including misses) are held until evicted through
/// [`CachingRackResolver::reload_cached`].
pub struct CachingResolver<R> {
    inner: R,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl<R: RackResolver> CachingResolver<R> {
    /// Wrap a resolver with a cache
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: RackResolver> RackResolver for CachingResolver<R> {
    fn resolve(&self, names: &[String]) -> Vec<Option<String>> {
        let mut results: Vec<Option<Option<String>>> = {
            let cache = self.cache.lock();
            names.iter().map(|n| cache.get(n).cloned()).collect()
        };

        let unresolved: Vec<String> = names
            .iter()
            .zip(&results)
            .filter(|(_, r)| r.is_none())
            .map(|(n, _)| n.clone())
            .collect();

        if !unresolved.is_empty() {
            let fresh = self.inner.resolve(&unresolved);
            let mut cache = self.cache.lock();
            let mut fresh_iter = unresolved.iter().zip(fresh);
            for slot in results.iter_mut().filter(|r| r.is_none()) {
                if let Some((name, resolved)) = fresh_iter.next() {
                    cache.insert(name.clone(), resolved.clone());
                    *slot = Some(resolved);
                }
            }
        }

        results.into_iter().map(Option::unwrap_or_default).collect()
    }

    fn as_caching(&self) -> Option<&dyn CachingRackResolver> {
        Some(self)
    }
}

impl<R: RackResolver> CachingRackResolver for CachingResolver<R> {
    fn reload_cached(&self, names: &[String]) {
        let mut cache = self.cache.lock();
        for name in names {
            if cache.remove(name).is_some() {
                debug!("evicted cached rack mapping for {}", name);
            }
        }
    }
}
