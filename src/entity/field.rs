//! Fields - Named, Typed, Access-Controlled Value Slots
//!
//! A [`Field`] belongs to exactly one record. Instead of pointing back at its
//! owner, every field carries an [`Access`] token that the owning record flips
//! when it is bound, frozen or thawed. Writes are only possible through
//! `&mut Field`, which the cache hands out only inside working copies.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Access state of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// Not yet attached to a record
    #[default]
    Unbound,
    /// Attached to a frozen (shared) record
    ReadOnly,
    /// Attached to a private working copy
    Writable,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Unbound => write!(f, "unbound"),
            Access::ReadOnly => write!(f, "read-only"),
            Access::Writable => write!(f, "writable"),
        }
    }
}

/// Values that can live in a field
pub trait FieldValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> FieldValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Object-safe view of a field, used for by-name operations
pub trait FieldAccess: Send + Sync {
    /// Field name, unique within its record
    fn name(&self) -> &'static str;

    /// Rust type name of the stored value
    fn value_type(&self) -> &'static str;

    /// Current access state
    fn access(&self) -> Access;

    /// Flip the access token (owning record only)
    fn set_access(&mut self, access: Access);

    /// Encode the current value, `null` when empty
    fn encode(&self) -> Result<Value>;

    /// Load a stored value; `None` means the document had no such key
    fn decode(&mut self, value: Option<Value>) -> Result<()>;

    /// Copy the value of a same-typed field
    fn copy_from(&mut self, source: &dyn FieldAccess) -> Result<()>;

    /// Downcast support for [`FieldAccess::copy_from`]
    fn as_any(&self) -> &dyn Any;
}

/// A named, typed value slot
#[derive(Clone)]
pub struct Field<T: FieldValue> {
    name: &'static str,
    value: Option<T>,
    default: Option<T>,
    access: Access,
}

impl<T: FieldValue> Field<T> {
    /// Create an empty field without a default
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            value: None,
            default: None,
            access: Access::Unbound,
        }
    }

    /// Create a field initialised to `default`
    pub fn with_default(name: &'static str, default: T) -> Self {
        Self {
            name,
            value: Some(default.clone()),
            default: Some(default),
            access: Access::Unbound,
        }
    }

    /// Field name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared default value
    pub fn default_value(&self) -> Option<&T> {
        self.default.as_ref()
    }

    /// Current access state
    pub fn access(&self) -> Access {
        self.access
    }

    /// Read the value. Fails if the field is not bound to a record.
    pub fn get(&self) -> Result<Option<&T>> {
        self.ensure_bound("get")?;
        Ok(self.value.as_ref())
    }

    /// Read the value or fall back to `fallback` when empty
    pub fn get_or<'a>(&'a self, fallback: &'a T) -> Result<&'a T> {
        Ok(self.get()?.unwrap_or(fallback))
    }

    /// Write the value. Fails unless the owning record is writable.
    pub fn set(&mut self, value: T) -> Result<()> {
        self.ensure_writable("set")?;
        self.value = Some(value);
        Ok(())
    }

    /// Empty the slot
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_writable("clear")?;
        self.value = None;
        Ok(())
    }

    /// Edit the value in place (lists, maps, nested values)
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut Option<T>) -> R) -> Result<R> {
        self.ensure_writable("modify")?;
        Ok(f(&mut self.value))
    }

    /// Unchecked read for the owning record
    pub(crate) fn raw(&self) -> Option<&T> {
        self.value.as_ref()
    }

    fn ensure_bound(&self, op: &str) -> Result<()> {
        if self.access == Access::Unbound {
            return Err(Error::invariant(format!(
                "cannot {op} field '{}': not bound to a record",
                self.name
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        self.ensure_bound(op)?;
        if self.access != Access::Writable {
            return Err(Error::invariant(format!(
                "cannot {op} field '{}': record is {}",
                self.name, self.access
            )));
        }
        Ok(())
    }
}

impl<T: FieldValue> FieldAccess for Field<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn access(&self) -> Access {
        self.access
    }

    fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    fn encode(&self) -> Result<Value> {
        match &self.value {
            Some(value) => Ok(serde_json::to_value(value)?),
            None => Ok(Value::Null),
        }
    }

    fn decode(&mut self, value: Option<Value>) -> Result<()> {
        self.value = match value {
            None => self.default.clone(),
            Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value)?),
        };
        Ok(())
    }

    fn copy_from(&mut self, source: &dyn FieldAccess) -> Result<()> {
        let source = source.as_any().downcast_ref::<Field<T>>().ok_or_else(|| {
            Error::invariant(format!(
                "cannot copy '{}' ({}) into '{}' ({})",
                source.name(),
                source.value_type(),
                self.name,
                std::any::type_name::<T>()
            ))
        })?;
        self.ensure_writable("copy into")?;
        self.value = source.value.clone();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: FieldValue + PartialEq> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        // value_type is part of T, so equal types are guaranteed here
        self.name == other.name && self.value == other.value
    }
}

impl<T: FieldValue + Eq> Eq for Field<T> {}

impl<T: FieldValue + Hash> Hash for Field<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
        std::any::type_name::<T>().hash(state);
    }
}

impl<T: FieldValue + fmt::Debug> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("access", &self.access)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
