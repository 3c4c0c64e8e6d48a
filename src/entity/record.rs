//! Records - Identity + Version + User Fields
//!
//! A [`Record`] wraps a user [`Entity`] together with the identity field and
//! the optimistic-concurrency version field. Records are either frozen
//! (every field read-only) or thawed (a private working copy).

use std::collections::HashMap;
use std::fmt;

use tracing::warn;

use super::field::{Access, Field, FieldAccess};
use super::key::EntityKey;
use crate::error::{Error, Result};

/// Document key holding the identity
pub const ID_FIELD: &str = "_id";

/// Document key holding the version counter
pub const VERSION_FIELD: &str = "version";

/// A user-defined cacheable type.
///
/// Implementors list their custom fields; names must be unique and must not
/// collide with [`ID_FIELD`] or [`VERSION_FIELD`].
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct User {
///     name: Field<String>,
///     age: Field<u32>,
/// }
///
/// impl Default for User {
///     fn default() -> Self {
///         Self { name: Field::new("name"), age: Field::with_default("age", 0) }
///     }
/// }
///
/// impl Entity for User {
///     type Key = String;
///     fn fields(&self) -> Vec<&dyn FieldAccess> { vec![&self.name, &self.age] }
///     fn fields_mut(&mut self) -> Vec<&mut dyn FieldAccess> { vec![&mut self.name, &mut self.age] }
/// }
/// ```
pub trait Entity: Clone + Default + Send + Sync + 'static {
    /// Identity type
    type Key: EntityKey;

    /// Custom fields, excluding id and version
    fn fields(&self) -> Vec<&dyn FieldAccess>;

    /// Mutable custom fields, same order as [`Entity::fields`]
    fn fields_mut(&mut self) -> Vec<&mut dyn FieldAccess>;
}

/// Identity + version + user fields
#[derive(Clone)]
pub struct Record<E: Entity> {
    key: E::Key,
    id: Field<E::Key>,
    version: Field<i64>,
    entity: E,
    read_only: bool,
}

impl<E: Entity> Record<E> {
    /// Bind `entity` to `key`. The record starts thawed at version 0.
    pub(crate) fn assemble(key: E::Key, entity: E) -> Result<Self> {
        let mut record = Self {
            key: key.clone(),
            id: Field::new(ID_FIELD),
            version: Field::with_default(VERSION_FIELD, 0),
            entity,
            read_only: false,
        };
        record.all_fields_map()?;
        record.apply_access(Access::Writable);
        record.id.set(key)?;
        Ok(record)
    }

    /// Identity
    pub fn key(&self) -> &E::Key {
        &self.key
    }

    /// Version counter
    pub fn version(&self) -> i64 {
        self.version.raw().copied().unwrap_or(0)
    }

    /// User fields
    pub fn entity(&self) -> &E {
        &self.entity
    }

    /// Mutable user fields; only reachable on working copies
    pub(crate) fn entity_mut(&mut self) -> &mut E {
        &mut self.entity
    }

    /// Whether every field is currently read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Freeze or thaw every field
    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
        self.apply_access(if read_only {
            Access::ReadOnly
        } else {
            Access::Writable
        });
    }

    pub(crate) fn set_version(&mut self, version: i64) -> Result<()> {
        self.version.set(version)
    }

    /// Custom fields plus id and version
    pub fn all_fields(&self) -> Vec<&dyn FieldAccess> {
        let mut fields: Vec<&dyn FieldAccess> = vec![&self.id, &self.version];
        fields.extend(self.entity.fields());
        fields
    }

    pub(crate) fn all_fields_mut(&mut self) -> Vec<&mut dyn FieldAccess> {
        let mut fields: Vec<&mut dyn FieldAccess> = vec![&mut self.id, &mut self.version];
        fields.extend(self.entity.fields_mut());
        fields
    }

    /// Name → field map. Fails on duplicate names; checked on every call.
    pub fn all_fields_map(&self) -> Result<HashMap<&'static str, &dyn FieldAccess>> {
        let fields = self.all_fields();
        let mut map = HashMap::with_capacity(fields.len());
        for field in fields {
            if map.insert(field.name(), field).is_some() {
                return Err(Error::invariant(format!(
                    "duplicate field name '{}' in {}",
                    field.name(),
                    std::any::type_name::<E>()
                )));
            }
        }
        Ok(map)
    }

    /// Copy every field of `source` into this record by name, keeping the
    /// identity. The record's read-only state is restored afterwards.
    pub(crate) fn merge_from(&mut self, source: &Record<E>) -> Result<()> {
        if source.key != self.key {
            return Err(Error::invariant(format!(
                "cannot merge record {:?} into {:?}",
                source.key, self.key
            )));
        }
        self.all_fields_map()?;
        let was_read_only = self.read_only;
        self.set_read_only(false);
        let result = self.copy_fields(source);
        self.set_read_only(was_read_only);
        result
    }

    fn copy_fields(&mut self, source: &Record<E>) -> Result<()> {
        let sources = source.all_fields_map()?;
        for field in self.all_fields_mut() {
            if field.name() == ID_FIELD {
                continue;
            }
            match sources.get(field.name()) {
                Some(source_field) => field.copy_from(*source_field)?,
                None => {
                    warn!(
                        field = field.name(),
                        value_type = field.value_type(),
                        "Merge source has no value for field, resetting to default"
                    );
                    field.decode(None)?;
                }
            }
        }
        Ok(())
    }

    fn apply_access(&mut self, access: Access) {
        for field in self.all_fields_mut() {
            field.set_access(access);
        }
    }
}

impl<E: Entity> fmt::Debug for Record<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("version", &self.version())
            .field("read_only", &self.read_only)
            .field("fields", &self.all_fields().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
