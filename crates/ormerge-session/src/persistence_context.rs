//! Persistence context: which instances the session manages.
//!
//! Every managed instance has exactly one [`EntityEntry`], and every entity
//! key maps to at most one managed instance. Lookups by instance use the
//! arena handle, so two equal-looking instances are still distinct.

use std::collections::HashMap;

use ormerge_core::{EntityKey, EntityRef, Value};

/// Lifecycle status of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Tracked and live.
    Managed,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted and flushed.
    Gone,
}

/// Bookkeeping for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub entity_name: &'static str,
    pub key: EntityKey,
    pub status: EntryStatus,
    /// Whether a row for this instance exists in the datastore. `false` for
    /// instances saved in this session and not flushed yet.
    pub exists_in_database: bool,
    /// Version as last read from or written to the datastore.
    pub version: Value,
}

impl EntityEntry {
    pub fn identifier(&self) -> &Value {
        self.key.identifier()
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.status, EntryStatus::Deleted | EntryStatus::Gone)
    }
}

/// Entries of every managed instance plus the cascade depth counter.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityRef, EntityEntry>,
    entities_by_key: HashMap<EntityKey, EntityRef>,
    proxies_by_key: HashMap<EntityKey, EntityRef>,
    cascade_level: u32,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing `entity` under its entry's key.
    pub fn add_entry(&mut self, entity: EntityRef, entry: EntityEntry) {
        tracing::trace!(
            entity = %entity,
            key = %entry.key,
            exists_in_database = entry.exists_in_database,
            "Adding persistence context entry"
        );
        self.entities_by_key.insert(entry.key.clone(), entity);
        self.entries.insert(entity, entry);
    }

    pub fn get_entry(&self, entity: EntityRef) -> Option<&EntityEntry> {
        self.entries.get(&entity)
    }

    pub fn get_entry_mut(&mut self, entity: EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity)
    }

    pub fn is_managed(&self, entity: EntityRef) -> bool {
        self.entries.contains_key(&entity)
    }

    /// The managed instance stored under `key`.
    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entities_by_key.get(key).copied()
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<EntityRef> {
        self.proxies_by_key.get(key).copied()
    }

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityRef) {
        self.proxies_by_key.insert(key, proxy);
    }

    /// Stop managing `entity`. Returns its entry.
    pub fn remove_entry(&mut self, entity: EntityRef) -> Option<EntityEntry> {
        let entry = self.entries.remove(&entity)?;
        if self.entities_by_key.get(&entry.key) == Some(&entity) {
            self.entities_by_key.remove(&entry.key);
        }
        Some(entry)
    }

    /// Managed instances in handle order.
    pub fn managed_entities(&self) -> Vec<EntityRef> {
        let mut handles: Vec<EntityRef> = self.entries.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cascade_level(&self) -> u32 {
        self.cascade_level
    }

    pub fn increment_cascade_level(&mut self) -> u32 {
        self.cascade_level += 1;
        self.cascade_level
    }

    pub fn decrement_cascade_level(&mut self) -> u32 {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    /// Restore the depth recorded before a top-level operation.
    pub fn reset_cascade_level(&mut self, level: u32) {
        self.cascade_level = level;
    }

    /// Forget every entry and proxy.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entities_by_key.clear();
        self.proxies_by_key.clear();
        self.cascade_level = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormerge_core::{EntityData, EntityStore};

    fn entry(id: i64) -> EntityEntry {
        EntityEntry {
            entity_name: "Item",
            key: EntityKey::new("Item", Value::BigInt(id)),
            status: EntryStatus::Managed,
            exists_in_database: true,
            version: Value::BigInt(0),
        }
    }

    #[test]
    fn test_entry_lookup_by_handle_and_key() {
        let mut store = EntityStore::new();
        let a = store.insert(EntityData::new("Item", Vec::new()));
        let b = store.insert(EntityData::new("Item", Vec::new()));

        let mut pc = PersistenceContext::new();
        pc.add_entry(a, entry(1));

        assert!(pc.is_managed(a));
        assert!(!pc.is_managed(b));
        assert_eq!(
            pc.get_entity(&EntityKey::new("Item", Value::BigInt(1))),
            Some(a)
        );
        assert_eq!(pc.get_entry(a).unwrap().identifier(), &Value::BigInt(1));
    }

    #[test]
    fn test_remove_entry_clears_key() {
        let mut store = EntityStore::new();
        let a = store.insert(EntityData::new("Item", Vec::new()));
        let mut pc = PersistenceContext::new();
        pc.add_entry(a, entry(1));

        let removed = pc.remove_entry(a).unwrap();
        assert_eq!(removed.status, EntryStatus::Managed);
        assert!(pc.get_entity(&removed.key).is_none());
        assert!(pc.is_empty());
    }

    #[test]
    fn test_cascade_level_counter() {
        let mut pc = PersistenceContext::new();
        assert_eq!(pc.increment_cascade_level(), 1);
        assert_eq!(pc.increment_cascade_level(), 2);
        assert_eq!(pc.decrement_cascade_level(), 1);
        pc.reset_cascade_level(0);
        assert_eq!(pc.cascade_level(), 0);
        assert_eq!(pc.decrement_cascade_level(), 0);
    }

    #[test]
    fn test_deleted_status() {
        let mut e = entry(3);
        assert!(!e.is_deleted());
        e.status = EntryStatus::Deleted;
        assert!(e.is_deleted());
    }
}
