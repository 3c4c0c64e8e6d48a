//! Blocking Cache Facade
//!
//! Synchronous wrappers over [`Cache`] for callers outside any runtime.
//! Calls park the current thread on a runtime handle; from inside an async
//! context they fail with `BlockingInAsyncContext` instead of deadlocking.

use std::sync::Arc;

use tokio::runtime::Handle as RuntimeHandle;

use super::index::{Index, IndexValue};
use super::manager::Cache;
use super::update::UpdateOutcome;
use crate::entity::{Entity, Handle};
use crate::error::{Error, Result};

/// Blocking view of a cache
pub struct BlockingCache<E: Entity> {
    cache: Arc<Cache<E>>,
    runtime: RuntimeHandle,
}

impl<E: Entity> BlockingCache<E> {
    /// Drive `cache` on `runtime`
    pub fn new(cache: Arc<Cache<E>>, runtime: RuntimeHandle) -> Self {
        Self { cache, runtime }
    }

    /// Underlying async cache
    pub fn inner(&self) -> &Arc<Cache<E>> {
        &self.cache
    }

    fn block_on<T>(&self, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        if RuntimeHandle::try_current().is_ok() {
            return Err(Error::BlockingInAsyncContext);
        }
        self.runtime.block_on(future)
    }

    pub fn read(&self, key: &E::Key) -> Result<Option<Handle<E>>> {
        self.block_on(self.cache.read(key))
    }

    pub fn create<F>(&self, key: E::Key, init: F) -> Result<Handle<E>>
    where
        F: FnOnce(&mut E) -> Result<()>,
    {
        self.block_on(self.cache.create(key, init))
    }

    pub fn read_or_create<F>(&self, key: E::Key, init: F) -> Result<Handle<E>>
    where
        F: FnOnce(&mut E) -> Result<()>,
    {
        self.block_on(self.cache.read_or_create(key, init))
    }

    pub fn update<F>(&self, key: &E::Key, mutation: F) -> Result<Handle<E>>
    where
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        self.block_on(self.cache.update(key, mutation))
    }

    pub fn update_handle<F>(&self, handle: &Handle<E>, mutation: F) -> Result<UpdateOutcome>
    where
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        self.block_on(self.cache.update_handle(handle, mutation))
    }

    pub fn delete(&self, key: &E::Key) -> Result<bool> {
        self.block_on(self.cache.delete(key))
    }

    pub fn read_all(&self, cache_results: bool) -> Result<Vec<Handle<E>>> {
        self.block_on(self.cache.read_all(cache_results))
    }

    pub fn keys(&self) -> Result<Vec<E::Key>> {
        self.block_on(self.cache.keys())
    }

    pub fn has(&self, key: &E::Key) -> Result<bool> {
        self.block_on(self.cache.has(key))
    }

    pub fn get_by_index<T: IndexValue>(&self, index: &Index<E, T>, value: &T) -> Result<Option<Handle<E>>> {
        self.block_on(self.cache.get_by_index(index, value))
    }
}

impl<E: Entity> Clone for BlockingCache<E> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            runtime: self.runtime.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::test_support::User;
    use tokio::runtime::Runtime;

    fn blocking(runtime: &Runtime) -> BlockingCache<User> {
        let cache = Arc::new(Cache::new("users", Arc::new(InMemoryBackend::new())));
        BlockingCache::new(cache, runtime.handle().clone())
    }

    #[test]
    fn test_blocking_round_trip() {
        let runtime = Runtime::new().unwrap();
        let users = blocking(&runtime);

        let created = users
            .create("u1".to_string(), |user| user.name.set("Alice".into()))
            .unwrap();
        let updated = users
            .update(&"u1".to_string(), |user| user.age.set(31))
            .unwrap();

        assert!(created.ptr_eq(&updated));
        assert_eq!(created.version(), 1);
        assert!(users.has(&"u1".to_string()).unwrap());
        assert!(users.delete(&"u1".to_string()).unwrap());
        assert!(users.read(&"u1".to_string()).unwrap().is_none());
    }

    #[test]
    fn test_refuses_inside_runtime() {
        let runtime = Runtime::new().unwrap();
        let users = blocking(&runtime);

        let result = tokio_test::block_on(async {
            // tokio_test::block_on enters its own runtime
            users.read(&"u1".to_string())
        });
        assert!(matches!(result, Err(Error::BlockingInAsyncContext)));
    }
}
