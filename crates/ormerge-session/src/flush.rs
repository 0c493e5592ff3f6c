//! Flush: write pending changes to the datastore.
//!
//! Operations are executed in this order:
//! 1. Queued inserts, in save order
//! 2. Updates of managed instances that differ from their snapshot
//! 3. Queued deletes
//!
//! Updates of versioned entities increment the version and only apply when
//! the stored version still equals the version last read.

use ormerge_core::{
    Datastore, EntityPersister, EntityRef, Error, MergeError, MergeErrorKind,
    PersistenceErrorKind, PropertyMetadata, PropertyValue, Result, Row, StoredValue, Value,
};

use crate::Session;
use crate::action_queue::{EntityDeleteAction, EntityInsertAction, PendingCounts};
use crate::persistence_context::EntryStatus;

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    /// Create a new empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of operations performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

impl<D: Datastore> Session<D> {
    /// Execute pending inserts, updates and deletes.
    ///
    /// Refused while a cascade is running. Inserts and deletes that were not
    /// executed because of an error stay queued.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<FlushResult> {
        if self.persistence_context.cascade_level() > 0 {
            return Err(Error::persistence(
                PersistenceErrorKind::FlushDuringCascade,
                "Flush during cascade is dangerous",
            ));
        }

        let mut result = FlushResult::new();

        let mut insertions = self.action_queue.take_insertions().into_iter();
        while let Some(action) = insertions.next() {
            if let Err(e) = self.execute_insert(&action) {
                self.action_queue
                    .restore_insertions(std::iter::once(action).chain(insertions));
                return Err(e);
            }
            result.inserted += 1;
        }

        for entity in self.persistence_context.managed_entities() {
            if self.execute_update(entity)? {
                result.updated += 1;
            }
        }

        let mut deletions = self.action_queue.take_deletions().into_iter();
        while let Some(action) = deletions.next() {
            if let Err(e) = self.execute_delete(&action) {
                self.action_queue
                    .restore_deletions(std::iter::once(action).chain(deletions));
                return Err(e);
            }
            result.deleted += 1;
        }

        // Deleted entries, flushed or never inserted, are no longer managed.
        for entity in self.persistence_context.managed_entities() {
            if self
                .persistence_context
                .get_entry(entity)
                .is_some_and(|e| e.is_deleted())
            {
                self.persistence_context.remove_entry(entity);
                self.change_tracker.clear(entity);
            }
        }

        tracing::debug!(
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }

    /// Pending operations. Dirty instances are found by comparing each
    /// managed instance with its snapshot.
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        let mut dirty = 0;
        for entity in self.persistence_context.managed_entities() {
            let Some(entry) = self.persistence_context.get_entry(entity) else {
                continue;
            };
            if entry.status != EntryStatus::Managed || !entry.exists_in_database {
                continue;
            }
            let persister = self.registry.persister(entry.entity_name)?;
            let row = self.dehydrate(persister.as_ref(), entity)?;
            if self.change_tracker.is_dirty(entity, &row.values) {
                dirty += 1;
            }
        }
        Ok(PendingCounts {
            new: self.action_queue.insertions().len(),
            dirty,
            deleted: self.action_queue.deletions().len(),
        })
    }

    fn execute_insert(&mut self, action: &EntityInsertAction) -> Result<()> {
        let persister = self.registry.persister(action.entity_name)?;
        let row = self.dehydrate(persister.as_ref(), action.entity)?;
        let values = row.values.clone();
        self.datastore.insert(&action.key, row)?;
        if let Some(entry) = self.persistence_context.get_entry_mut(action.entity) {
            entry.exists_in_database = true;
        }
        self.change_tracker.snapshot(action.entity, values);
        self.statistics.entity_insert();
        tracing::trace!(key = %action.key, "Inserted row");
        Ok(())
    }

    /// Returns whether a row was written.
    fn execute_update(&mut self, entity: EntityRef) -> Result<bool> {
        let Some(entry) = self.persistence_context.get_entry(entity) else {
            return Ok(false);
        };
        if entry.status != EntryStatus::Managed || !entry.exists_in_database {
            return Ok(false);
        }
        let (entity_name, key, loaded_version) =
            (entry.entity_name, entry.key.clone(), entry.version.clone());

        let persister = self.registry.persister(entity_name)?;
        let mut row = self.dehydrate(persister.as_ref(), entity)?;
        if !self.change_tracker.is_dirty(entity, &row.values) {
            return Ok(false);
        }

        let versioned = persister.is_versioned();
        if versioned {
            row.version = loaded_version.next_version();
        }
        let version = row.version.clone();
        let values = row.values.clone();
        let expected = versioned.then_some(&loaded_version);
        if !self.datastore.update(&key, row, expected)? {
            self.statistics.optimistic_failure(entity_name);
            tracing::warn!(key = %key, "Optimistic lock failure during flush");
            return Err(MergeError::new(
                MergeErrorKind::StaleState,
                "Row was updated or deleted by another transaction",
            )
            .with_entity(entity_name, Some(key.identifier().clone()))
            .into());
        }

        if versioned {
            persister.set_version(&mut self.store, entity, version.clone())?;
            if let Some(entry) = self.persistence_context.get_entry_mut(entity) {
                entry.version = version;
            }
        }
        self.change_tracker.snapshot(entity, values);
        self.statistics.entity_update();
        tracing::trace!(key = %key, "Updated row");
        Ok(true)
    }

    fn execute_delete(&mut self, action: &EntityDeleteAction) -> Result<()> {
        let versioned = self.registry.persister(action.entity_name)?.is_versioned();
        if !self.datastore.delete(&action.key)? && versioned {
            self.statistics.optimistic_failure(action.entity_name);
            return Err(MergeError::new(
                MergeErrorKind::StaleState,
                "Row was updated or deleted by another transaction",
            )
            .with_entity(action.entity_name, Some(action.key.identifier().clone()))
            .into());
        }
        if let Some(entry) = self.persistence_context.get_entry_mut(action.entity) {
            entry.status = EntryStatus::Gone;
        }
        self.statistics.entity_delete();
        tracing::trace!(key = %action.key, "Deleted row");
        Ok(())
    }

    /// The row `entity` would be stored as.
    pub(crate) fn dehydrate(&self, persister: &dyn EntityPersister, entity: EntityRef) -> Result<Row> {
        let data = self.store.instance(entity)?;
        let snapshot = self.change_tracker.get_snapshot(entity);
        let mut values = Vec::with_capacity(data.values.len());
        for (i, (property, value)) in persister.properties().iter().zip(&data.values).enumerate() {
            values.push(match value {
                PropertyValue::Scalar(v) => StoredValue::Scalar(v.clone()),
                PropertyValue::Component(v) => StoredValue::Component(v.clone()),
                PropertyValue::Reference(reference) => StoredValue::Reference(
                    reference
                        .map(|r| self.reference_identifier(property, r))
                        .transpose()?,
                ),
                // Elements were never fetched, so the stored value is unchanged.
                PropertyValue::Collection(c) if !c.initialized => snapshot
                    .and_then(|s| s.values().get(i).cloned())
                    .unwrap_or(StoredValue::References(Vec::new())),
                PropertyValue::Collection(c) => StoredValue::References(
                    c.elements
                        .iter()
                        .map(|e| self.reference_identifier(property, *e))
                        .collect::<Result<_>>()?,
                ),
            });
        }
        Ok(Row {
            entity_name: data.entity_name,
            identifier: data.identifier.clone(),
            version: data.version.clone(),
            values,
        })
    }

    fn reference_identifier(&self, property: &PropertyMetadata, entity: EntityRef) -> Result<Value> {
        if let Some(proxy) = self.store.proxy(entity) {
            if !proxy.is_initialized() {
                return Ok(proxy.identifier.clone());
            }
        }
        let data = self.store.instance(entity)?;
        if data.identifier.is_null() {
            return Err(Error::persistence(
                PersistenceErrorKind::TransientReference,
                format!(
                    "object references an unsaved transient instance - save the transient \
                     instance before flushing: {} -> {}",
                    property.name, data.entity_name
                ),
            ));
        }
        Ok(data.identifier.clone())
    }
}
