//! Shared fixtures for unit tests

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Field, FieldAccess, Record};

/// Nested value stored in a single field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub nickname: Option<String>,
    pub level: u32,
}

/// Fixture entity covering scalar, list, map and nested fields
#[derive(Clone)]
pub struct User {
    pub name: Field<String>,
    pub age: Field<u32>,
    pub tags: Field<Vec<String>>,
    pub scores: Field<HashMap<String, i64>>,
    pub profile: Field<Profile>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            name: Field::new("name"),
            age: Field::with_default("age", 0),
            tags: Field::with_default("tags", Vec::new()),
            scores: Field::with_default("scores", HashMap::new()),
            profile: Field::new("profile"),
        }
    }
}

impl Entity for User {
    type Key = String;

    fn fields(&self) -> Vec<&dyn FieldAccess> {
        vec![&self.name, &self.age, &self.tags, &self.scores, &self.profile]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldAccess> {
        vec![
            &mut self.name,
            &mut self.age,
            &mut self.tags,
            &mut self.scores,
            &mut self.profile,
        ]
    }
}

/// Thawed record with `name` and `age` set
pub fn user_record(key: &str, name: &str, age: u32) -> Record<User> {
    let mut record = Record::assemble(key.to_string(), User::default()).unwrap();
    record.entity_mut().name.set(name.to_string()).unwrap();
    record.entity_mut().age.set(age).unwrap();
    record
}
