//! Entity Keys
//!
//! Every cache is bound to one key type. The string form produced by
//! [`EntityKey::to_key_string`] is the canonical identity used for document
//! ids, projections and index lookups.

use std::fmt::Debug;
use std::hash::Hash;

use uuid::Uuid;

use super::field::FieldValue;
use crate::error::{Error, Result};

/// Key codec required by every cache
pub trait EntityKey: FieldValue + Eq + Hash + Debug {
    /// Canonical string form
    fn to_key_string(&self) -> String;

    /// Parse the canonical string form
    fn from_key_string(value: &str) -> Result<Self>;
}

impl EntityKey for String {
    fn to_key_string(&self) -> String {
        self.clone()
    }

    fn from_key_string(value: &str) -> Result<Self> {
        Ok(value.to_string())
    }
}

impl EntityKey for Uuid {
    fn to_key_string(&self) -> String {
        self.hyphenated().to_string()
    }

    fn from_key_string(value: &str) -> Result<Self> {
        Uuid::parse_str(value).map_err(|e| Error::KeyCodec {
            value: value.to_string(),
            reason: e.to_string(),
        })
    }
}

macro_rules! integer_key {
    ($($ty:ty),*) => {
        $(
            impl EntityKey for $ty {
                fn to_key_string(&self) -> String {
                    self.to_string()
                }

                fn from_key_string(value: &str) -> Result<Self> {
                    value.parse::<$ty>().map_err(|e| Error::KeyCodec {
                        value: value.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        )*
    };
}

integer_key!(i64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_key_codec() {
        let id = Uuid::new_v4();
        let encoded = id.to_key_string();
        assert_eq!(Uuid::from_key_string(&encoded).unwrap(), id);
    }

    #[test]
    fn test_integer_key_codec() {
        assert_eq!(i64::from_key_string("-42").unwrap(), -42);
        assert_eq!(77u64.to_key_string(), "77");
    }

    #[test]
    fn test_invalid_key_reports_value() {
        let err = u64::from_key_string("abc").unwrap_err();
        match err {
            Error::KeyCodec { value, .. } => assert_eq!(value, "abc"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
