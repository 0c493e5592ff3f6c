//! The storage collaborator behind a session.
//!
//! SQL generation and execution live outside this workspace. The session only
//! needs to fetch a row by key, draw identifiers, and apply inserts, updates
//! and deletes, which is what [`Datastore`] describes. [`InMemoryDatastore`]
//! implements it over a hash map and records what it was asked to do.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::persister::EntityKey;
use crate::value::Value;

/// Persistent form of a property value. Associations are stored by identifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StoredValue {
    Scalar(Value),
    Component(Vec<Value>),
    Reference(Option<Value>),
    References(Vec<Value>),
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// Concrete entity name of the row, which may be a subtype of the key's root.
    pub entity_name: &'static str,
    pub identifier: Value,
    pub version: Value,
    pub values: Vec<StoredValue>,
}

/// Blocking storage operations used by the session.
pub trait Datastore {
    /// Fetch the row stored under `key`. `fetch_profile` names the internal
    /// fetch profile active for this load, if any.
    fn fetch(&mut self, key: &EntityKey, fetch_profile: Option<&str>) -> Result<Option<Row>>;

    /// Draw the next identifier for entities rooted at `root_name`.
    fn generate_identifier(&mut self, root_name: &'static str) -> Result<Value>;

    fn insert(&mut self, key: &EntityKey, row: Row) -> Result<()>;

    /// Replace the row under `key`. When `expected_version` is given the
    /// update only applies if the stored version still equals it.
    /// Returns whether a row was updated.
    fn update(&mut self, key: &EntityKey, row: Row, expected_version: Option<&Value>)
    -> Result<bool>;

    fn delete(&mut self, key: &EntityKey) -> Result<bool>;
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatastoreCounters {
    pub fetches: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

/// Hash-map backed [`Datastore`].
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    rows: HashMap<EntityKey, Row>,
    sequences: HashMap<&'static str, i64>,
    counters: DatastoreCounters,
    fetch_profiles: Vec<Option<String>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row directly, bypassing the counters.
    pub fn seed(&mut self, root_name: &'static str, row: Row) {
        let key = EntityKey::new(root_name, row.identifier.clone());
        self.rows.insert(key, row);
    }

    pub fn row(&self, root_name: &'static str, id: impl Into<Value>) -> Option<&Row> {
        self.rows.get(&EntityKey::new(root_name, id.into()))
    }

    pub fn contains(&self, root_name: &'static str, id: impl Into<Value>) -> bool {
        self.row(root_name, id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn counters(&self) -> DatastoreCounters {
        self.counters
    }

    /// The fetch profile passed to every fetch so far, in call order.
    pub fn fetch_profiles(&self) -> &[Option<String>] {
        &self.fetch_profiles
    }

    /// Snapshot of every stored row as JSON, ordered by key.
    pub fn dump(&self) -> Result<serde_json::Value> {
        let mut rows: Vec<_> = self.rows.iter().collect();
        rows.sort_by_key(|(key, _)| (key.root_name(), key.identifier().to_string()));
        let rows = rows
            .into_iter()
            .map(|(_, row)| serde_json::to_value(row))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(serde_json::Value::Array(rows))
    }
}

impl Datastore for InMemoryDatastore {
    fn fetch(&mut self, key: &EntityKey, fetch_profile: Option<&str>) -> Result<Option<Row>> {
        self.counters.fetches += 1;
        self.fetch_profiles.push(fetch_profile.map(str::to_string));
        tracing::trace!(key = %key, fetch_profile = ?fetch_profile, "Fetching row");
        Ok(self.rows.get(key).cloned())
    }

    fn generate_identifier(&mut self, root_name: &'static str) -> Result<Value> {
        let next = self.sequences.entry(root_name).or_insert(0);
        loop {
            *next += 1;
            let candidate = Value::BigInt(*next);
            if !self
                .rows
                .contains_key(&EntityKey::new(root_name, candidate.clone()))
            {
                return Ok(candidate);
            }
        }
    }

    fn insert(&mut self, key: &EntityKey, row: Row) -> Result<()> {
        if self.rows.contains_key(key) {
            return Err(Error::datastore(format!("duplicate key {key}")));
        }
        self.counters.inserts += 1;
        self.rows.insert(key.clone(), row);
        Ok(())
    }

    fn update(
        &mut self,
        key: &EntityKey,
        row: Row,
        expected_version: Option<&Value>,
    ) -> Result<bool> {
        let Some(existing) = self.rows.get_mut(key) else {
            return Ok(false);
        };
        if let Some(expected) = expected_version {
            if &existing.version != expected {
                return Ok(false);
            }
        }
        self.counters.updates += 1;
        *existing = row;
        Ok(true)
    }

    fn delete(&mut self, key: &EntityKey) -> Result<bool> {
        let removed = self.rows.remove(key).is_some();
        if removed {
            self.counters.deletes += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, version: i64, name: &str) -> Row {
        Row {
            entity_name: "Item",
            identifier: Value::BigInt(id),
            version: Value::BigInt(version),
            values: vec![StoredValue::Scalar(Value::from(name))],
        }
    }

    #[test]
    fn test_generated_identifiers_skip_seeded_rows() {
        let mut store = InMemoryDatastore::new();
        store.seed("Item", row(1, 0, "seeded"));
        assert_eq!(store.generate_identifier("Item").unwrap(), Value::BigInt(2));
        assert_eq!(store.generate_identifier("Item").unwrap(), Value::BigInt(3));
        assert_eq!(store.generate_identifier("Bid").unwrap(), Value::BigInt(1));
    }

    #[test]
    fn test_fetch_records_profile() {
        let mut store = InMemoryDatastore::new();
        store.seed("Item", row(1, 0, "a"));
        let key = EntityKey::new("Item", Value::BigInt(1));
        assert!(store.fetch(&key, Some("merge")).unwrap().is_some());
        assert!(
            store
                .fetch(&EntityKey::new("Item", Value::BigInt(2)), None)
                .unwrap()
                .is_none()
        );
        assert_eq!(store.fetch_profiles(), &[Some("merge".to_string()), None]);
        assert_eq!(store.counters().fetches, 2);
    }

    #[test]
    fn test_versioned_update() {
        let mut store = InMemoryDatastore::new();
        store.seed("Item", row(1, 1, "a"));
        let key = EntityKey::new("Item", Value::BigInt(1));

        let stale = store
            .update(&key, row(1, 2, "b"), Some(&Value::BigInt(0)))
            .unwrap();
        assert!(!stale);
        assert_eq!(store.row("Item", 1_i64).unwrap().version, Value::BigInt(1));

        let applied = store
            .update(&key, row(1, 2, "b"), Some(&Value::BigInt(1)))
            .unwrap();
        assert!(applied);
        assert_eq!(store.counters().updates, 1);
    }

    #[test]
    fn test_insert_duplicate_and_delete() {
        let mut store = InMemoryDatastore::new();
        let key = EntityKey::new("Item", Value::BigInt(5));
        store.insert(&key, row(5, 0, "x")).unwrap();
        assert!(matches!(
            store.insert(&key, row(5, 0, "x")),
            Err(Error::Datastore(_))
        ));
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_dump_is_ordered_json() {
        let mut store = InMemoryDatastore::new();
        store.seed("Item", row(2, 0, "b"));
        store.seed("Item", row(1, 0, "a"));
        let dump = store.dump().unwrap();
        assert_eq!(dump[0]["identifier"]["BigInt"], 1);
        assert_eq!(dump[1]["values"][0]["Scalar"]["Text"], "b");
    }
}
