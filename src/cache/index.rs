//! Secondary Indexes
//!
//! An [`Index`] is a logically unique lookup path over one field of an
//! entity. Backends with native index support resolve lookups themselves;
//! for the rest, the database tier keeps an [`IndexMapping`] that is
//! rewritten whenever a record is created, hydrated or updated and
//! invalidated when it is deleted. Either way a value has at most one
//! owner: writes that would give it a second one fail with
//! [`Error::UniqueViolation`](crate::Error::UniqueViolation).

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;

use crate::entity::{Entity, EntityKey, Field, FieldValue};
use crate::error::Result;

/// Values an index can be built over
pub trait IndexValue: FieldValue + PartialEq + Debug {
    /// Canonical string form used by the mapping
    fn to_index_string(&self) -> String;

    /// Parse the canonical string form
    fn from_index_string(value: &str) -> Result<Self>;
}

impl<T: EntityKey> IndexValue for T {
    fn to_index_string(&self) -> String {
        self.to_key_string()
    }

    fn from_index_string(value: &str) -> Result<Self> {
        T::from_key_string(value)
    }
}

type Extractor<E, T> = Arc<dyn Fn(&E) -> Option<T> + Send + Sync>;
type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Typed secondary index over one field
pub struct Index<E: Entity, T: IndexValue> {
    name: &'static str,
    extractor: Extractor<E, T>,
    equals: Equality<T>,
}

impl<E: Entity, T: IndexValue> Index<E, T> {
    /// Index named `name` (the document key of the indexed field)
    pub fn new(name: &'static str, extractor: impl Fn(&E) -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            name,
            extractor: Arc::new(extractor),
            equals: Arc::new(|a: &T, b: &T| a == b),
        }
    }

    /// Index over a field, named after it
    ///
    /// ```ignore
    /// let by_name = Index::field(|user: &User| &user.name);
    /// ```
    pub fn field(accessor: fn(&E) -> &Field<T>) -> Self {
        let name = accessor(&E::default()).name();
        Self::new(name, move |entity| {
            accessor(entity).get().ok().flatten().cloned()
        })
    }

    /// Replace the equality used for matching
    pub fn with_equality(mut self, equals: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        self.equals = Arc::new(equals);
        self
    }

    /// Index name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Extract the indexed value
    pub fn extract(&self, entity: &E) -> Option<T> {
        (self.extractor)(entity)
    }

    /// Whether `entity`'s indexed value equals `value`
    pub fn matches(&self, entity: &E, value: &T) -> bool {
        self.extract(entity)
            .is_some_and(|current| (self.equals)(&current, value))
    }

    /// Type-erased extractor producing the canonical string
    pub(crate) fn string_extractor(&self) -> IndexExtractor<E> {
        let extractor = Arc::clone(&self.extractor);
        Arc::new(move |entity: &E| extractor(entity).map(|value| value.to_index_string()))
    }
}

impl<E: Entity, T: IndexValue> Clone for Index<E, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            extractor: Arc::clone(&self.extractor),
            equals: Arc::clone(&self.equals),
        }
    }
}

impl<E: Entity, T: IndexValue> fmt::Debug for Index<E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("value_type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Extractor with the value already in string form
pub(crate) type IndexExtractor<E> = Arc<dyn Fn(&E) -> Option<String> + Send + Sync>;

/// Out-of-backend index: `(index, value) → id` with a reverse map for
/// invalidation
#[derive(Default)]
pub struct IndexMapping {
    forward: DashMap<(&'static str, String), String>,
    reverse: DashMap<String, Vec<(&'static str, String)>>,
}

impl IndexMapping {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// First of `entries` already owned by an id other than `id`, as
    /// `(index, value, owner)`
    pub fn conflict(&self, id: &str, entries: &[(&'static str, String)]) -> Option<(&'static str, String, String)> {
        entries.iter().find_map(|(index, value)| {
            self.lookup(index, value)
                .filter(|owner| owner != id)
                .map(|owner| (*index, value.clone(), owner))
        })
    }

    /// Replace every entry of `id` with `entries`. Entries owned by another
    /// id are taken over; check [`IndexMapping::conflict`] first when that
    /// must not happen.
    pub fn rewrite(&self, id: &str, entries: Vec<(&'static str, String)>) {
        self.invalidate(id);
        for entry in &entries {
            self.forward.insert(entry.clone(), id.to_string());
        }
        if !entries.is_empty() {
            self.reverse.insert(id.to_string(), entries);
        }
    }

    /// Drop every entry pointing at `id`
    pub fn invalidate(&self, id: &str) {
        if let Some((_, entries)) = self.reverse.remove(id) {
            for entry in entries {
                self.forward.remove_if(&entry, |_, owner| owner == id);
            }
        }
    }

    /// Forget every entry of `index`
    pub fn drop_index(&self, index: &str) {
        self.forward.retain(|(name, _), _| *name != index);
        self.reverse.retain(|_, entries| {
            entries.retain(|(name, _)| *name != index);
            !entries.is_empty()
        });
    }

    /// Id whose `index` value equals `value`
    pub fn lookup(&self, index: &'static str, value: &str) -> Option<String> {
        self.forward
            .get(&(index, value.to_string()))
            .map(|id| id.value().clone())
    }

    /// Number of indexed values
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
