//! Shared Entity Handles
//!
//! A [`Handle`] is the read-only, reference-stable view the cache hands to
//! callers. Every clone points at the same record, so a committed update
//! merged into the handle is observed by all holders. Reads take a
//! `parking_lot` read lock; the only writer is the cache's merge step.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use super::record::{Entity, Record};
use crate::error::{Error, Result};

struct Shared<E: Entity> {
    key: E::Key,
    record: RwLock<Record<E>>,
    valid: AtomicBool,
}

/// Read-only shared entity
pub struct Handle<E: Entity> {
    inner: Arc<Shared<E>>,
}

impl<E: Entity> Handle<E> {
    /// Wrap a record, freezing it
    pub(crate) fn new(mut record: Record<E>) -> Self {
        record.set_read_only(true);
        Self {
            inner: Arc::new(Shared {
                key: record.key().clone(),
                record: RwLock::new(record),
                valid: AtomicBool::new(true),
            }),
        }
    }

    /// Identity
    pub fn key(&self) -> &E::Key {
        &self.inner.key
    }

    /// Current version
    pub fn version(&self) -> i64 {
        self.inner.record.read().version()
    }

    /// Borrow the whole record
    pub fn read(&self) -> RwLockReadGuard<'_, Record<E>> {
        self.inner.record.read()
    }

    /// Borrow the user fields
    pub fn entity(&self) -> MappedRwLockReadGuard<'_, E> {
        RwLockReadGuard::map(self.inner.record.read(), |record| record.entity())
    }

    /// Deep copy of the current state, still read-only
    pub fn snapshot(&self) -> Record<E> {
        self.inner.record.read().clone()
    }

    /// False once the entity has been deleted or evicted by `remove`
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Whether two handles share one record
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Permanently mark the handle as dead
    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::Release);
    }

    /// Apply a committed working copy in place. Sources older than the
    /// current version are ignored so concurrent commits can land in any
    /// order.
    pub(crate) fn merge_from(&self, source: &Record<E>) -> Result<()> {
        self.ensure_valid()?;
        let mut record = self.inner.record.write();
        if source.version() < record.version() {
            return Ok(());
        }
        record.merge_from(source)
    }

    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::invariant(format!(
                "entity {:?} was invalidated and can no longer be modified",
                self.inner.key
            )));
        }
        Ok(())
    }
}

impl<E: Entity> Clone for Handle<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> fmt::Debug for Handle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.inner.key)
            .field("version", &self.version())
            .field("valid", &self.is_valid())
            .finish()
    }
}
