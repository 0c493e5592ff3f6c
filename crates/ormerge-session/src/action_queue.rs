//! Inserts and deletes queued by the session, executed on flush.
//!
//! Updates are not queued: flush finds them by comparing every managed
//! instance against its loaded-state snapshot.

use ormerge_core::{EntityKey, EntityRef};
use serde::Serialize;

/// A saved instance waiting for its row to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInsertAction {
    pub entity: EntityRef,
    pub entity_name: &'static str,
    pub key: EntityKey,
}

/// A deleted instance waiting for its row to be removed.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDeleteAction {
    pub entity: EntityRef,
    pub entity_name: &'static str,
    pub key: EntityKey,
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: Vec<EntityInsertAction>,
    deletions: Vec<EntityDeleteAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, action: EntityInsertAction) {
        tracing::trace!(entity = %action.entity, key = %action.key, "Queueing insert");
        self.insertions.push(action);
    }

    pub fn add_delete(&mut self, action: EntityDeleteAction) {
        tracing::trace!(entity = %action.entity, key = %action.key, "Queueing delete");
        self.deletions.push(action);
    }

    /// Drop the queued insert of `entity`. Returns whether one was queued.
    pub fn remove_insert(&mut self, entity: EntityRef) -> bool {
        let before = self.insertions.len();
        self.insertions.retain(|a| a.entity != entity);
        self.insertions.len() != before
    }

    pub fn has_insert(&self, entity: EntityRef) -> bool {
        self.insertions.iter().any(|a| a.entity == entity)
    }

    pub fn has_delete(&self, entity: EntityRef) -> bool {
        self.deletions.iter().any(|a| a.entity == entity)
    }

    /// Queued inserts in save order.
    pub fn insertions(&self) -> &[EntityInsertAction] {
        &self.insertions
    }

    pub fn deletions(&self) -> &[EntityDeleteAction] {
        &self.deletions
    }

    pub(crate) fn take_insertions(&mut self) -> Vec<EntityInsertAction> {
        std::mem::take(&mut self.insertions)
    }

    pub(crate) fn take_deletions(&mut self) -> Vec<EntityDeleteAction> {
        std::mem::take(&mut self.deletions)
    }

    /// Put back inserts that were taken but not executed, ahead of any queued since.
    pub(crate) fn restore_insertions(&mut self, actions: impl IntoIterator<Item = EntityInsertAction>) {
        let queued = std::mem::take(&mut self.insertions);
        self.insertions.extend(actions);
        self.insertions.extend(queued);
    }

    pub(crate) fn restore_deletions(&mut self, actions: impl IntoIterator<Item = EntityDeleteAction>) {
        let queued = std::mem::take(&mut self.deletions);
        self.deletions.extend(actions);
        self.deletions.extend(queued);
    }

    pub fn len(&self) -> usize {
        self.insertions.len() + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty()
    }

    pub fn clear(&mut self) {
        self.insertions.clear();
        self.deletions.clear();
    }
}

/// Counts of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Managed objects that differ from their snapshot.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new == 0 && self.dirty == 0 && self.deleted == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormerge_core::{EntityData, EntityStore, Value};

    fn insert(store: &mut EntityStore, id: i64) -> EntityInsertAction {
        EntityInsertAction {
            entity: store.insert(EntityData::new("Item", Vec::new())),
            entity_name: "Item",
            key: EntityKey::new("Item", Value::BigInt(id)),
        }
    }

    #[test]
    fn test_insertions_keep_save_order() {
        let mut store = EntityStore::new();
        let mut queue = ActionQueue::new();
        let first = insert(&mut store, 1);
        let second = insert(&mut store, 2);
        queue.add_insert(first.clone());
        queue.add_insert(second.clone());

        assert_eq!(queue.insertions(), &[first, second]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_insert() {
        let mut store = EntityStore::new();
        let mut queue = ActionQueue::new();
        let action = insert(&mut store, 1);
        let entity = action.entity;
        queue.add_insert(action);

        assert!(queue.has_insert(entity));
        assert!(queue.remove_insert(entity));
        assert!(!queue.remove_insert(entity));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_drains() {
        let mut store = EntityStore::new();
        let mut queue = ActionQueue::new();
        let action = insert(&mut store, 1);
        queue.add_delete(EntityDeleteAction {
            entity: action.entity,
            entity_name: action.entity_name,
            key: action.key.clone(),
        });
        queue.add_insert(action);

        let insertions = queue.take_insertions();
        assert_eq!(insertions.len(), 1);
        assert_eq!(queue.take_deletions().len(), 1);
        assert!(queue.is_empty());

        queue.restore_insertions(insertions);
        assert_eq!(queue.insertions().len(), 1);
    }

    #[test]
    fn test_pending_counts() {
        let counts = PendingCounts {
            new: 1,
            dirty: 2,
            deleted: 0,
        };
        assert_eq!(counts.total(), 3);
        assert!(!counts.is_empty());
        assert!(PendingCounts::default().is_empty());
    }
}
