//! Cache Registry
//!
//! Owns every cache of a process by name and starts or stops them in
//! dependency order.
//!
//! # Design
//!
//! - Constructed explicitly and passed around; there is no global instance
//! - Startup order is a topological sort (Kahn) with ties broken by name
//! - Unknown dependencies and cycles fail before anything is started

use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::backend::BackendHealth;
use crate::cache::Cache;
use crate::entity::Entity;
use crate::error::{Error, Result};

/// Type-erased view of a cache used by the registry
pub trait ManagedCache: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Names of caches that must be started first
    fn dependencies(&self) -> &[String];

    fn start(&self) -> Result<()>;

    fn shutdown(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    fn backend_name(&self) -> &str;

    fn backend_health(&self) -> BackendHealth;

    /// Recover the concrete type
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<E: Entity> ManagedCache for Cache<E> {
    fn name(&self) -> &str {
        Cache::name(self)
    }

    fn dependencies(&self) -> &[String] {
        Cache::dependencies(self)
    }

    fn start(&self) -> Result<()> {
        Cache::start(self)
    }

    fn shutdown(&self) -> Result<()> {
        Cache::shutdown(self)
    }

    fn is_running(&self) -> bool {
        Cache::is_running(self)
    }

    fn backend_name(&self) -> &str {
        Cache::backend_name(self)
    }

    fn backend_health(&self) -> BackendHealth {
        Cache::backend_health(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Pairwise startup comparison.
///
/// `Less` when `a` must start before `b` (b depends on a), `Greater` for
/// the converse, `None` when neither names the other. This is a partial
/// order over direct dependencies only; [`Registry::startup_order`] is the
/// authoritative ordering.
pub fn dependency_ordering(a: &dyn ManagedCache, b: &dyn ManagedCache) -> Option<Ordering> {
    let a_needs_b = a.dependencies().iter().any(|d| d == b.name());
    let b_needs_a = b.dependencies().iter().any(|d| d == a.name());
    match (a_needs_b, b_needs_a) {
        (false, true) => Some(Ordering::Less),
        (true, false) => Some(Ordering::Greater),
        (false, false) if a.name() == b.name() => Some(Ordering::Equal),
        _ => None,
    }
}

/// Named collection of caches
#[derive(Default)]
pub struct Registry {
    caches: RwLock<BTreeMap<String, Arc<dyn ManagedCache>>>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache under its own name
    pub fn register(&self, cache: Arc<dyn ManagedCache>) -> Result<()> {
        let mut caches = self.caches.write();
        let name = cache.name().to_string();
        if caches.contains_key(&name) {
            return Err(Error::DuplicateCache(name));
        }
        caches.insert(name, cache);
        Ok(())
    }

    /// Register a typed cache and hand back the shared reference
    pub fn register_cache<E: Entity>(&self, cache: Cache<E>) -> Result<Arc<Cache<E>>> {
        let cache = Arc::new(cache);
        self.register(cache.clone())?;
        Ok(cache)
    }

    /// Look up a cache by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedCache>> {
        self.caches.read().get(name).cloned()
    }

    /// Look up a cache by name and entity type
    pub fn cache<E: Entity>(&self, name: &str) -> Option<Arc<Cache<E>>> {
        self.get(name)?.into_any().downcast::<Cache<E>>().ok()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Every cache, dependencies before dependents
    pub fn startup_order(&self) -> Result<Vec<Arc<dyn ManagedCache>>> {
        let caches = self.caches.read();

        // name -> unresolved dependency count, and the reverse edges
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, cache) in caches.iter() {
            let mut unique: BTreeSet<&str> = BTreeSet::new();
            for dependency in cache.dependencies() {
                if !caches.contains_key(dependency) {
                    return Err(Error::UnknownDependency {
                        cache: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
                unique.insert(dependency.as_str());
            }
            for dependency in &unique {
                dependents.entry(*dependency).or_default().push(name.as_str());
            }
            pending.insert(name.as_str(), unique.len());
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(caches.len());

        while let Some(name) = ready.pop_first() {
            order.push(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() < caches.len() {
            let remaining: BTreeSet<&str> = pending
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(Error::DependencyCycle(find_cycle(&caches, &remaining)));
        }

        Ok(order
            .into_iter()
            .filter_map(|name| caches.get(name).cloned())
            .collect())
    }

    /// Start every cache in dependency order. On failure the caches already
    /// started by this call are stopped again.
    pub fn start_all(&self) -> Result<()> {
        let order = self.startup_order()?;
        let mut started: Vec<&Arc<dyn ManagedCache>> = Vec::with_capacity(order.len());
        for cache in &order {
            if let Err(e) = cache.start() {
                warn!(cache = cache.name(), error = %e, "Startup failed, rolling back");
                for done in started.iter().rev() {
                    if let Err(e) = done.shutdown() {
                        warn!(cache = done.name(), error = %e, "Rollback shutdown failed");
                    }
                }
                return Err(e);
            }
            started.push(cache);
        }
        info!(caches = order.len(), "All caches started");
        Ok(())
    }

    /// Stop every running cache, dependents first. Keeps going past
    /// failures and returns the first one.
    pub fn shutdown_all(&self) -> Result<()> {
        let order = self.startup_order()?;
        let mut first_error = None;
        for cache in order.iter().rev().filter(|cache| cache.is_running()) {
            if let Err(e) = cache.shutdown() {
                warn!(cache = cache.name(), error = %e, "Shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(caches = order.len(), "All caches stopped");
                Ok(())
            }
        }
    }
}

/// Walk unresolved dependencies from the smallest remaining name until a
/// name repeats. Every remaining node has a remaining dependency, so the
/// walk always closes a loop.
fn find_cycle(caches: &BTreeMap<String, Arc<dyn ManagedCache>>, remaining: &BTreeSet<&str>) -> Vec<String> {
    let Some(mut current) = remaining.first().copied() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    loop {
        if let Some(start) = path.iter().position(|name| *name == current) {
            let mut cycle: Vec<String> = path[start..].iter().map(|name| name.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        path.push(current);
        let next = caches.get(current).and_then(|cache| {
            cache
                .dependencies()
                .iter()
                .map(String::as_str)
                .filter(|dependency| remaining.contains(dependency))
                .min()
        });
        match next {
            Some(next) => current = remaining.get(next).copied().unwrap_or(current),
            None => return path.iter().map(|name| name.to_string()).collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
