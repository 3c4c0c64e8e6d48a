//! tiercache Integration Tests
//!
//! End-to-end behavior of the cache over the in-memory backend:
//! - Create / read / update / delete correctness
//! - Optimistic concurrency under contention and injected faults
//! - Read-only gating and reference stability
//! - Secondary index lookups
//! - Document round-trips

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde::{Deserialize, Serialize};

use tiercache::backend::{Backend, FaultInjectingBackend, InMemoryBackend};
use tiercache::cache::{Cache, CacheConfig, Index, RetryPolicy};
use tiercache::entity::{codec, Entity, Field, FieldAccess};
use tiercache::Error;

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Address {
    city: String,
    zip: Option<String>,
}

#[derive(Clone)]
struct Account {
    name: Field<String>,
    age: Field<u32>,
    tags: Field<Vec<String>>,
    limits: Field<HashMap<String, i64>>,
    address: Field<Address>,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            name: Field::new("name"),
            age: Field::with_default("age", 0),
            tags: Field::with_default("tags", Vec::new()),
            limits: Field::with_default("limits", HashMap::new()),
            address: Field::new("address"),
        }
    }
}

impl Entity for Account {
    type Key = String;

    fn fields(&self) -> Vec<&dyn FieldAccess> {
        vec![&self.name, &self.age, &self.tags, &self.limits, &self.address]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldAccess> {
        vec![
            &mut self.name,
            &mut self.age,
            &mut self.tags,
            &mut self.limits,
            &mut self.address,
        ]
    }
}

fn key(k: &str) -> String {
    k.to_string()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_delays(
        Duration::from_millis(1),
        Duration::from_millis(1),
        Duration::from_millis(10),
    )
}

fn accounts_over(backend: Arc<dyn Backend>) -> Cache<Account> {
    let config = CacheConfig {
        retry: fast_retry(),
        ..Default::default()
    };
    Cache::with_config("accounts", backend, config).unwrap()
}

fn faulty() -> (Arc<FaultInjectingBackend>, Cache<Account>) {
    let faults = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
    let cache = accounts_over(faults.clone());
    (faults, cache)
}

fn named(name: &'static str, age: u32) -> impl FnOnce(&mut Account) -> tiercache::Result<()> {
    move |account| {
        account.name.set(name.to_string())?;
        account.age.set(age)
    }
}

async fn stored_version(backend: &dyn Backend, id: &str) -> i64 {
    let document = backend.get("accounts", id).await.unwrap().unwrap();
    codec::document_version(&document)
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_scenario_a_create_then_update() {
        let (_, accounts) = faulty();

        let created = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        assert_eq!(created.version(), 0);

        let updated = accounts
            .update(&key("u1"), |account| account.age.set(26))
            .await
            .unwrap();
        assert_eq!(updated.version(), 1);
        assert_eq!(updated.entity().age.get().unwrap(), Some(&26));
        assert_eq!(updated.entity().name.get().unwrap(), Some(&"Alice".to_string()));
    }

    #[tokio::test]
    async fn test_scenario_b_one_stale_version() {
        let (faults, accounts) = faulty();
        let handle = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        let start = handle.version();

        faults.fail_next_cas(1);
        let outcome = accounts
            .update_handle(&handle, |account| account.age.set(26))
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.version, start + 1);
        assert_eq!(handle.version(), start + 1);
        assert_eq!(faults.fault_stats().injected_conflicts, 1);
        assert_eq!(accounts.metrics().cas_conflicts, 1);
    }

    #[tokio::test]
    async fn test_scenario_c_permanent_contention() {
        let (faults, accounts) = faulty();
        let handle = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        let before = stored_version(faults.as_ref(), "u1").await;

        faults.always_fail_cas(true);
        let err = accounts
            .update(&key("u1"), |account| account.age.set(99))
            .await
            .unwrap_err();

        assert_matches!(err, Error::RetryLimitExceeded { attempts: 15, observed_version: 0, .. });
        assert_eq!(stored_version(faults.as_ref(), "u1").await, before);
        assert_eq!(handle.version(), before);
        assert_eq!(handle.entity().age.get().unwrap(), Some(&25));
        assert!(handle.is_valid());
    }

    async fn scenario_d(backend: Arc<dyn Backend>) {
        let accounts = accounts_over(backend);
        let by_name: Index<Account, String> = Index::field(|account: &Account| &account.name);
        accounts.register_index(&by_name).await.unwrap();

        let alice = accounts.create(key("a"), named("Alice", 30)).await.unwrap();
        accounts.create(key("b"), named("Bob", 40)).await.unwrap();

        let found = accounts
            .get_by_index(&by_name, &"Alice".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(found.ptr_eq(&alice));

        // The index is unique whichever side maintains it
        assert_matches!(
            accounts.create(key("c"), named("Alice", 50)).await.map(|_| ()),
            Err(Error::UniqueViolation { owner, .. }) if owner == "a"
        );
        assert!(!accounts.has(&key("c")).await.unwrap());
        assert!(accounts
            .get_by_index(&by_name, &"Carol".to_string())
            .await
            .unwrap()
            .is_none());

        // Resolved through the backend once nothing is cached
        accounts.uncache(&key("b"));
        let bob = accounts
            .get_by_index(&by_name, &"Bob".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob.key(), "b");
    }

    #[tokio::test]
    async fn test_scenario_d_native_index() {
        scenario_d(Arc::new(InMemoryBackend::new())).await;
    }

    #[tokio::test]
    async fn test_scenario_d_mapped_index() {
        scenario_d(Arc::new(InMemoryBackend::without_native_indexes())).await;
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_writers_no_lost_update() {
        let (_, accounts) = faulty();
        let accounts = Arc::new(accounts);
        let handle = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();

        let first = accounts.spawn_update(key("u1"), |account| {
            let age = *account.age.get_or(&0)?;
            account.age.set(age + 1)
        });
        let second = accounts.spawn_update(key("u1"), |account| {
            account.tags.modify(|tags| tags.get_or_insert_with(Vec::new).push("vip".into()))
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(handle.version(), 2);
        assert_eq!(handle.entity().age.get().unwrap(), Some(&26));
        assert_eq!(handle.entity().tags.get().unwrap(), Some(&vec!["vip".to_string()]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_writers_with_injected_conflicts() {
        let faults = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
        faults.set_conflict_rate(0.1);
        let config = CacheConfig {
            retry: fast_retry().with_max_attempts(100),
            ..Default::default()
        };
        let accounts = Arc::new(Cache::<Account>::with_config("accounts", faults.clone(), config).unwrap());

        let handle = accounts.create(key("hot"), named("Hot", 0)).await.unwrap();

        let writers = 8;
        let updates = 10;
        let tasks: Vec<_> = (0..writers)
            .map(|_| {
                let accounts = Arc::clone(&accounts);
                tokio::spawn(async move {
                    for _ in 0..updates {
                        accounts
                            .update(&key("hot"), |account| {
                                let age = *account.age.get_or(&0)?;
                                account.age.set(age + 1)
                            })
                            .await?;
                    }
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let total = (writers * updates) as i64;
        assert_eq!(handle.version(), total);
        assert_eq!(handle.entity().age.get().unwrap(), Some(&(total as u32)));
        assert_eq!(stored_version(faults.as_ref(), "hot").await, total);
    }
}

// =============================================================================
// Correctness properties
// =============================================================================

mod properties {
    use super::*;

    #[tokio::test]
    async fn test_create_correctness() {
        let (_, accounts) = faulty();
        accounts
            .create(key("u1"), |account| {
                account.name.set("Alice".into())?;
                account.tags.set(vec!["a".into(), "b".into()])?;
                account.address.set(Address {
                    city: "Lagos".into(),
                    zip: None,
                })
            })
            .await
            .unwrap();
        accounts.uncache(&key("u1"));

        let read = accounts.read(&key("u1")).await.unwrap().unwrap();
        assert_eq!(read.version(), 0);
        let account = read.entity();
        assert_eq!(account.name.get().unwrap(), Some(&"Alice".to_string()));
        assert_eq!(account.age.get().unwrap(), Some(&0));
        assert_eq!(account.tags.get().unwrap().map(Vec::len), Some(2));
        assert_eq!(account.address.get().unwrap().map(|a| a.city.as_str()), Some("Lagos"));
    }

    #[tokio::test]
    async fn test_update_correctness_from_backend() {
        let (_, accounts) = faulty();
        accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        accounts
            .update(&key("u1"), |account| {
                account.limits.modify(|limits| {
                    limits.get_or_insert_with(HashMap::new).insert("daily".into(), 500);
                })
            })
            .await
            .unwrap();
        accounts.uncache(&key("u1"));

        let read = accounts.read(&key("u1")).await.unwrap().unwrap();
        assert_eq!(read.version(), 1);
        assert_eq!(
            read.entity().limits.get().unwrap().and_then(|l| l.get("daily")),
            Some(&500)
        );
    }

    #[tokio::test]
    async fn test_delete_correctness() {
        let (_, accounts) = faulty();
        let held = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();

        assert!(accounts.delete(&key("u1")).await.unwrap());
        assert!(accounts.read(&key("u1")).await.unwrap().is_none());
        assert!(!held.is_valid());

        let err = accounts
            .update_handle(&held, |account| account.age.set(1))
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[tokio::test]
    async fn test_read_only_gate() {
        let (_, accounts) = faulty();
        let handle = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        let mut copy = handle.entity().clone();

        assert!(copy.name.set("Mallory".into()).unwrap_err().is_invariant_violation());
        assert!(copy.age.set(1).unwrap_err().is_invariant_violation());
        assert!(copy.tags.set(Vec::new()).unwrap_err().is_invariant_violation());
        assert!(copy.limits.clear().unwrap_err().is_invariant_violation());
        assert!(copy
            .address
            .modify(|address| address.take())
            .unwrap_err()
            .is_invariant_violation());
        assert_eq!(handle.entity().name.get().unwrap(), Some(&"Alice".to_string()));
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let (_, accounts) = faulty();
        let handle = accounts.create(key("u1"), named("Alice", 25)).await.unwrap();

        assert!(accounts.cache(&handle));
        assert!(accounts.cache(&handle));
        assert_eq!(accounts.local_size(), 1);
        assert_eq!(accounts.keys().await.unwrap(), vec![key("u1")]);
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let (_, accounts) = faulty();
        accounts.create(key("u1"), named("Alice", 25)).await.unwrap();
        assert_matches!(
            accounts.create(key("u1"), named("Eve", 30)).await,
            Err(Error::DuplicateKey { .. })
        );
    }
}

// =============================================================================
// Documents
// =============================================================================

mod documents {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_every_field_kind() {
        let (_, accounts) = faulty();
        let handle = accounts
            .create(key("u1"), |account| {
                account.name.set("Alice".into())?;
                account.age.set(25)?;
                account.tags.set(vec!["x".into(), "y".into()])?;
                account.limits.set(HashMap::from([("daily".to_string(), 10)]))?;
                account.address.set(Address {
                    city: "Accra".into(),
                    zip: Some("00233".into()),
                })
            })
            .await
            .unwrap();

        let original = handle.snapshot();
        let document = codec::encode(&original).unwrap();
        let decoded = codec::decode::<Account>(&document).unwrap();

        assert_eq!(decoded.key(), original.key());
        assert_eq!(decoded.version(), original.version());
        let (a, b) = (original.entity(), decoded.entity());
        assert!(a.name == b.name);
        assert!(a.age == b.age);
        assert!(a.tags == b.tags);
        assert!(a.limits == b.limits);
        assert!(a.address == b.address);
    }

    #[tokio::test]
    async fn test_forward_compatible_documents() {
        let backend = Arc::new(InMemoryBackend::new());
        let document = json!({
            "_id": "legacy",
            "version": 3,
            "name": "Legacy",
            "retired_field": true
        });
        backend
            .insert("accounts", "legacy", document.as_object().cloned().unwrap())
            .await
            .unwrap();

        let accounts = accounts_over(backend);
        let handle = accounts.read(&key("legacy")).await.unwrap().unwrap();

        assert_eq!(handle.version(), 3);
        assert_eq!(handle.entity().name.get().unwrap(), Some(&"Legacy".to_string()));
        assert_eq!(handle.entity().age.get().unwrap(), Some(&0));
        assert_eq!(handle.entity().address.get().unwrap(), None);
    }
}
