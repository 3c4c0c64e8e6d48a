//! Document Codec
//!
//! One flat JSON object per entity: every field by name, the identity under
//! [`ID_FIELD`] as its canonical key string, the version under
//! [`VERSION_FIELD`]. Unknown keys are ignored on load and missing keys fall
//! back to the field's declared default.

use serde_json::{Map, Value};

use super::key::EntityKey;
use super::record::{Entity, Record, ID_FIELD};
use crate::error::{Error, Result};

/// Persisted record shape
pub type Document = Map<String, Value>;

/// Serialize a record into a document
pub fn encode<E: Entity>(record: &Record<E>) -> Result<Document> {
    let mut document = Document::new();
    for field in record.all_fields() {
        let value = if field.name() == ID_FIELD {
            Value::String(record.key().to_key_string())
        } else {
            field.encode()?
        };
        document.insert(field.name().to_string(), value);
    }
    Ok(document)
}

/// Rebuild a frozen record from a document
pub fn decode<E: Entity>(document: &Document) -> Result<Record<E>> {
    let key = document_key::<E::Key>(document)?;
    let mut record = Record::assemble(key, E::default())?;
    for field in record.all_fields_mut() {
        if field.name() == ID_FIELD {
            continue;
        }
        field.decode(document.get(field.name()).cloned())?;
    }
    record.set_read_only(true);
    Ok(record)
}

/// Extract and parse the identity of a document
pub fn document_key<K: EntityKey>(document: &Document) -> Result<K> {
    match document.get(ID_FIELD) {
        Some(Value::String(id)) => K::from_key_string(id),
        Some(other) => Err(Error::KeyCodec {
            value: other.to_string(),
            reason: format!("'{ID_FIELD}' must be a string"),
        }),
        None => Err(Error::KeyCodec {
            value: String::new(),
            reason: format!("document has no '{ID_FIELD}'"),
        }),
    }
}

/// Read the version counter of a raw document
pub fn document_version(document: &Document) -> i64 {
    document
        .get(super::record::VERSION_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{user_record, Profile, User};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_encode_flat_shape() {
        let record = user_record("u1", "Alice", 25);
        let doc = encode(&record).unwrap();

        assert_eq!(doc["_id"], json!("u1"));
        assert_eq!(doc["version"], json!(0));
        assert_eq!(doc["name"], json!("Alice"));
        assert_eq!(doc["age"], json!(25));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let mut doc = encode(&user_record("u1", "Alice", 25)).unwrap();
        doc.insert("legacy_flag".into(), json!(true));

        let record: Record<User> = decode(&doc).unwrap();
        assert_eq!(record.entity().name.get().unwrap(), Some(&"Alice".to_string()));
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let doc = json!({ "_id": "u9", "version": 3, "name": "Zed" });
        let record: Record<User> = decode(doc.as_object().unwrap()).unwrap();

        assert_eq!(record.version(), 3);
        assert_eq!(record.entity().age.get().unwrap(), Some(&0));
        assert_eq!(record.entity().tags.get().unwrap(), Some(&Vec::new()));
        assert_eq!(record.entity().profile.get().unwrap(), None);
    }

    #[test]
    fn test_decoded_record_is_frozen() {
        let doc = encode(&user_record("u1", "Alice", 25)).unwrap();
        let mut record: Record<User> = decode(&doc).unwrap();
        assert!(record.is_read_only());
        assert!(record.entity_mut().age.set(1).is_err());
    }

    #[test]
    fn test_missing_id_rejected() {
        let doc = json!({ "version": 1 });
        let err = decode::<User>(doc.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, Error::KeyCodec { .. }));
    }

    #[test]
    fn test_document_version() {
        let doc = json!({ "_id": "a", "version": 12 });
        assert_eq!(document_version(doc.as_object().unwrap()), 12);
    }

    fn fields_equal(a: &Record<User>, b: &Record<User>) -> bool {
        let (a, b) = (a.entity(), b.entity());
        a.name == b.name && a.age == b.age && a.tags == b.tags && a.scores == b.scores && a.profile == b.profile
    }

    proptest! {
        #[test]
        fn prop_round_trip_preserves_fields(
            name in "[a-zA-Z ]{0,16}",
            age in 0u32..150,
            tags in proptest::collection::vec("[a-z]{1,8}", 0..5),
            scores in proptest::collection::hash_map("[a-z]{1,6}", any::<i64>(), 0..5),
            nickname in proptest::option::of("[a-z]{1,8}"),
            version in 0i64..10_000,
        ) {
            let mut record = user_record("rt", &name, age);
            record.entity_mut().tags.set(tags).unwrap();
            record.entity_mut().scores.set(scores.into_iter().collect::<HashMap<_, _>>()).unwrap();
            record.entity_mut().profile.set(Profile { nickname, level: age / 10 }).unwrap();
            record.set_version(version).unwrap();

            let decoded: Record<User> = decode(&encode(&record).unwrap()).unwrap();
            prop_assert_eq!(decoded.key(), record.key());
            prop_assert_eq!(decoded.version(), version);
            prop_assert!(fields_equal(&decoded, &record));
        }
    }
}
