//! Snapshot-based dirty detection for managed instances.
//!
//! Snapshots hold the dehydrated form of an instance (what a row would
//! contain), so references compare by identifier rather than by handle.

use ormerge_core::{EntityRef, StoredValue};
use std::collections::HashMap;
use std::time::Instant;

/// State of an instance as last read from or written to the datastore.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: Vec<StoredValue>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: Vec<StoredValue>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    pub fn values(&self) -> &[StoredValue] {
        &self.values
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Tracks loaded state of the instances a session manages.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    snapshots: HashMap<EntityRef, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn snapshot(&mut self, entity: EntityRef, values: Vec<StoredValue>) {
        tracing::trace!(entity = %entity, properties = values.len(), "Taking snapshot");
        self.snapshots.insert(entity, ObjectSnapshot::new(values));
    }

    /// An instance without a snapshot is always dirty.
    pub fn is_dirty(&self, entity: EntityRef, current: &[StoredValue]) -> bool {
        let Some(snapshot) = self.snapshots.get(&entity) else {
            tracing::trace!(entity = %entity, "No snapshot - treating as dirty");
            return true;
        };
        let dirty = snapshot.values.as_slice() != current;
        tracing::trace!(entity = %entity, dirty, "Dirty check result");
        dirty
    }

    /// Names of the properties whose value differs from the snapshot.
    pub fn changed_properties(
        &self,
        entity: EntityRef,
        current: &[StoredValue],
        names: &[&'static str],
    ) -> Vec<&'static str> {
        let Some(snapshot) = self.snapshots.get(&entity) else {
            return names.to_vec();
        };
        names
            .iter()
            .enumerate()
            .filter(|(i, _)| snapshot.values.get(*i) != current.get(*i))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn has_snapshot(&self, entity: EntityRef) -> bool {
        self.snapshots.contains_key(&entity)
    }

    pub fn get_snapshot(&self, entity: EntityRef) -> Option<&ObjectSnapshot> {
        self.snapshots.get(&entity)
    }

    pub fn clear(&mut self, entity: EntityRef) {
        self.snapshots.remove(&entity);
    }

    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
