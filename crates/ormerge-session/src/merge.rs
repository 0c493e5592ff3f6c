//! Merge of instances into a session.
//!
//! Merging copies the state of a given instance onto the managed instance
//! with the same identity, loading or creating that managed instance as
//! needed, and cascades to the associations mapped with `merge`.
//!
//! One top-level merge walks a whole object graph. Every instance visited is
//! bound in the session's [`MergeContext`](crate::MergeContext) to the
//! managed instance it resolved to before anything is cascaded from it, so a
//! cycle leads back to an in-progress binding instead of recursing.

use std::sync::Arc;

use ormerge_core::{
    CascadePoint, CollectionValue, Datastore, EntityPersister, EntityRef, Error,
    ForeignKeyDirection, MergeError, MergeErrorKind, PropertyMetadata, PropertyValue, Result,
    Value,
};

use crate::Session;
use crate::cascade::MergeCascade;
use crate::entity_state::EntityState;

/// The internal fetch profile active while a detached instance's row is loaded.
pub const MERGE_FETCH_PROFILE: &str = "merge";

/// Arguments of one merge call.
#[derive(Debug, Clone)]
pub struct MergeEvent<'a> {
    /// Entity name the instance is merged as, if not its own.
    pub entity_name: Option<&'a str>,
    pub original: EntityRef,
    /// Identifier the caller expects the instance to have.
    pub requested_id: Option<Value>,
}

impl<'a> MergeEvent<'a> {
    pub fn new(original: EntityRef) -> Self {
        Self {
            entity_name: None,
            original,
            requested_id: None,
        }
    }

    #[must_use]
    pub fn entity_name(mut self, entity_name: Option<&'a str>) -> Self {
        self.entity_name = entity_name;
        self
    }

    #[must_use]
    pub fn requested_id(mut self, id: Option<Value>) -> Self {
        self.requested_id = id;
        self
    }
}

impl<D: Datastore> Session<D> {
    /// Merge `entity` into the session and return the managed instance.
    pub fn merge(&mut self, entity: EntityRef) -> Result<EntityRef> {
        self.merge_with(None, entity, None)
    }

    /// Merge `entity` as an instance of `entity_name`.
    pub fn merge_entity(&mut self, entity_name: &str, entity: EntityRef) -> Result<EntityRef> {
        self.merge_with(Some(entity_name), entity, None)
    }

    /// Top-level merge.
    ///
    /// The merge context and cascade level are reset when the merge
    /// finishes, whether it succeeded or not. Managed instances modified
    /// before a failure keep their modifications.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn merge_with(
        &mut self,
        entity_name: Option<&str>,
        entity: EntityRef,
        requested_id: Option<Value>,
    ) -> Result<EntityRef> {
        let cascade_level = self.persistence_context.cascade_level();
        let copies_before = self.merge_context.copies_detected();
        self.merge_context.before_operation();
        self.statistics.merge(true);

        let event = MergeEvent::new(entity)
            .entity_name(entity_name)
            .requested_id(requested_id.map(Value::into_identifier));
        let result = self.on_merge(&event);

        self.merge_context.after_operation(&self.store);
        self.persistence_context.reset_cascade_level(cascade_level);
        self.statistics
            .entity_copies(self.merge_context.copies_detected() - copies_before);

        match &result {
            Ok(managed) => tracing::debug!(
                entity = %self.store.info_string(*managed),
                "Merge complete"
            ),
            Err(e) => tracing::debug!(error = %e, "Merge failed"),
        }
        result
    }

    /// Merge reached through a cascade, inside a running top-level merge.
    pub(crate) fn fire_nested_merge(
        &mut self,
        entity: EntityRef,
        entity_name: Option<&str>,
    ) -> Result<EntityRef> {
        self.statistics.merge(false);
        self.on_merge(&MergeEvent::new(entity).entity_name(entity_name))
    }

    fn on_merge(&mut self, event: &MergeEvent<'_>) -> Result<EntityRef> {
        let original = event.original;
        if let Some(proxy) = self.store.proxy(original) {
            if !proxy.is_initialized() {
                tracing::trace!(
                    proxy = %self.store.info_string(original),
                    "Ignoring uninitialized proxy"
                );
                let (entity_name, id) = (proxy.entity_name, proxy.identifier.clone());
                return self.load(entity_name, id);
            }
        }
        let entity = self.store.unproxy(original)?;

        if let Some(managed) = self.merge_context.get(entity) {
            if self.merge_context.is_in_progress(entity) {
                tracing::trace!(
                    entity = %self.store.info_string(entity),
                    "Already in merge process"
                );
                return Ok(managed);
            }
            tracing::trace!(
                entity = %self.store.info_string(entity),
                "Already in merge context; setting in merge process"
            );
            self.merge_context.set_in_progress(entity, true)?;
        }

        let persister = self.persister_for(event.entity_name, entity)?;
        match self.classify(event.entity_name, entity)? {
            EntityState::Detached => self.entity_is_detached(event, persister, entity),
            EntityState::Transient => self.entity_is_transient(event, persister, entity),
            EntityState::Persistent => self.entity_is_persistent(persister, entity),
            EntityState::Deleted => {
                let id = persister.get_identifier(&self.store, entity)?;
                Err(
                    MergeError::new(MergeErrorKind::ObjectDeleted, "deleted instance passed to merge")
                        .with_entity(persister.entity_name(), Some(id))
                        .into(),
                )
            }
        }
    }

    fn entity_is_persistent(
        &mut self,
        persister: Arc<dyn EntityPersister>,
        entity: EntityRef,
    ) -> Result<EntityRef> {
        tracing::trace!(
            entity = %self.store.info_string(entity),
            "Ignoring persistent instance"
        );
        self.merge_context.put(entity, entity, true, &self.store)?;
        self.cascade(
            &MergeCascade,
            CascadePoint::BeforeMerge,
            persister.as_ref(),
            entity,
        )?;
        self.copy_values(persister.as_ref(), entity, entity, None)?;
        Ok(entity)
    }

    fn entity_is_transient(
        &mut self,
        event: &MergeEvent<'_>,
        persister: Arc<dyn EntityPersister>,
        entity: EntityRef,
    ) -> Result<EntityRef> {
        tracing::trace!(
            entity = %self.store.info_string(entity),
            "Merging transient instance"
        );
        let id = persister.get_identifier(&self.store, entity)?;
        let copy = match self.merge_context.get(entity) {
            Some(existing) => {
                persister.set_identifier(&mut self.store, existing, id)?;
                existing
            }
            None => {
                let copy = self.store.insert(persister.instantiate(id));
                self.merge_context.put(entity, copy, true, &self.store)?;
                copy
            }
        };

        // Referenced entities first, so their copies exist before values are copied.
        self.cascade(
            &MergeCascade,
            CascadePoint::BeforeInsertAfterDelete,
            persister.as_ref(),
            entity,
        )?;
        self.copy_values(
            persister.as_ref(),
            entity,
            copy,
            Some(ForeignKeyDirection::FromParent),
        )?;

        match &event.requested_id {
            None => self.save_with_generated_id(copy)?,
            Some(id) => self.save_with_requested_id(copy, id.clone())?,
        };

        self.cascade(
            &MergeCascade,
            CascadePoint::AfterInsertBeforeDelete,
            persister.as_ref(),
            entity,
        )?;
        self.copy_values(
            persister.as_ref(),
            entity,
            copy,
            Some(ForeignKeyDirection::ToParent),
        )?;
        Ok(copy)
    }

    fn entity_is_detached(
        &mut self,
        event: &MergeEvent<'_>,
        persister: Arc<dyn EntityPersister>,
        entity: EntityRef,
    ) -> Result<EntityRef> {
        tracing::trace!(
            entity = %self.store.info_string(entity),
            "Merging detached instance"
        );
        let entity_id = persister.get_identifier(&self.store, entity)?;
        let id = match &event.requested_id {
            None => entity_id,
            Some(requested) => {
                if requested != &entity_id {
                    return Err(MergeError::new(
                        MergeErrorKind::IdentifierMismatch,
                        "merge requested with id not matching id of passed entity",
                    )
                    .with_entity(persister.entity_name(), Some(requested.clone()))
                    .into());
                }
                requested.clone()
            }
        };

        let previous_fetch_profile = self.internal_fetch_profile.replace(MERGE_FETCH_PROFILE);
        let loaded = self.get(persister.entity_name(), id.clone());
        self.internal_fetch_profile = previous_fetch_profile;

        let Some(result) = loaded? else {
            // Assumed detached, but there is no row: the instance was never saved.
            tracing::trace!(
                entity = %self.store.info_string(entity),
                "No row found for detached instance; merging as transient"
            );
            return self.entity_is_transient(event, persister, entity);
        };

        self.merge_context.put(entity, result, true, &self.store)?;
        let target = self.store.unproxy(result)?;
        if target == entity {
            return Err(MergeError::new(MergeErrorKind::AssertionFailure, "entity was not detached")
                .with_entity(persister.entity_name(), Some(id))
                .into());
        }
        if self.store.entity_name(target)? != persister.entity_name() {
            return Err(MergeError::new(
                MergeErrorKind::WrongClass,
                "class of the given object did not match class of persistent copy",
            )
            .with_entity(persister.entity_name(), event.requested_id.clone())
            .into());
        }
        if self.is_version_changed(persister.as_ref(), entity, target)? {
            self.statistics.optimistic_failure(persister.entity_name());
            tracing::warn!(
                entity = %self.store.info_string(target),
                "Optimistic lock failure while merging detached instance"
            );
            return Err(MergeError::new(
                MergeErrorKind::StaleState,
                "Row was updated or deleted by another transaction (or unsaved-value mapping was incorrect)",
            )
            .with_entity(persister.entity_name(), Some(id))
            .into());
        }

        // Cascade first so every unsaved instance has its copy before values are copied.
        self.cascade(
            &MergeCascade,
            CascadePoint::BeforeMerge,
            persister.as_ref(),
            entity,
        )?;
        self.copy_values(persister.as_ref(), entity, target, None)?;
        self.mark_interceptor_dirty(entity, target)?;
        Ok(result)
    }

    /// The version differs and the target's row really exists. An instance
    /// saved earlier in this session can be merged again before flush.
    fn is_version_changed(
        &self,
        persister: &dyn EntityPersister,
        entity: EntityRef,
        target: EntityRef,
    ) -> Result<bool> {
        if !persister.is_versioned() {
            return Ok(false);
        }
        let (Some(target_version), Some(entity_version)) = (
            persister.get_version(&self.store, target)?,
            persister.get_version(&self.store, entity)?,
        ) else {
            return Ok(false);
        };
        let changed = !persister.is_version_same(&target_version, &entity_version);
        Ok(changed && self.exists_in_database(persister, target)?)
    }

    fn exists_in_database(&self, persister: &dyn EntityPersister, entity: EntityRef) -> Result<bool> {
        let entry = match self.persistence_context.get_entry(entity) {
            Some(entry) => Some(entry),
            None => {
                let id = persister.get_identifier(&self.store, entity)?;
                if id.is_null() {
                    None
                } else {
                    self.persistence_context
                        .get_entity(&persister.entity_key(id))
                        .and_then(|managed| self.persistence_context.get_entry(managed))
                }
            }
        };
        Ok(entry.is_some_and(|e| e.exists_in_database))
    }

    /// Carry the source's dirty attributes over to the target when both track them.
    fn mark_interceptor_dirty(&mut self, entity: EntityRef, target: EntityRef) -> Result<()> {
        let Some(attributes) = self
            .store
            .instance(entity)?
            .dirty_tracker
            .as_ref()
            .map(|t| t.attributes().map(str::to_string).collect::<Vec<_>>())
        else {
            return Ok(());
        };
        if let Some(tracker) = self.store.instance_mut(target)?.dirty_tracker.as_mut() {
            tracker.clear();
            for attribute in attributes {
                tracker.track_change(attribute);
            }
        }
        Ok(())
    }

    /// Replace the target's property values with those of `entity`.
    ///
    /// Without a direction every property is replaced. `FromParent` replaces
    /// value types and `FromParent` associations; `ToParent` replaces only
    /// `ToParent` associations. Versions are never copied.
    pub(crate) fn copy_values(
        &mut self,
        persister: &dyn EntityPersister,
        entity: EntityRef,
        target: EntityRef,
        direction: Option<ForeignKeyDirection>,
    ) -> Result<()> {
        let original = persister.get_property_values(&self.store, entity)?;
        let current = persister.get_property_values(&self.store, target)?;
        let mut copied = Vec::with_capacity(current.len());
        for ((property, original), current) in persister.properties().iter().zip(original).zip(current)
        {
            let include = match (direction, property.kind.foreign_key_direction()) {
                (None, _) => true,
                (Some(ForeignKeyDirection::FromParent), None) => true,
                (Some(_), None) => false,
                (Some(direction), Some(association)) => direction == association,
            };
            copied.push(if include {
                self.replace_value(property, original, current)?
            } else {
                current
            });
        }
        persister.set_property_values(&mut self.store, target, copied)
    }

    fn replace_value(
        &mut self,
        property: &PropertyMetadata,
        original: PropertyValue,
        target: PropertyValue,
    ) -> Result<PropertyValue> {
        match original {
            PropertyValue::Scalar(_) | PropertyValue::Component(_) => Ok(original),
            PropertyValue::Reference(reference) => {
                let target = target.as_reference();
                Ok(PropertyValue::Reference(
                    self.replace_reference(property, reference, target)?,
                ))
            }
            PropertyValue::Collection(collection) => {
                if !collection.initialized {
                    return Ok(target);
                }
                let mut elements = Vec::with_capacity(collection.elements.len());
                for element in collection.elements {
                    if let Some(replaced) = self.replace_reference(property, Some(element), None)? {
                        elements.push(replaced);
                    }
                }
                Ok(PropertyValue::Collection(CollectionValue::of(elements)))
            }
        }
    }

    /// Resolve an associated instance to the instance the managed side
    /// should reference.
    fn replace_reference(
        &mut self,
        property: &PropertyMetadata,
        original: Option<EntityRef>,
        target: Option<EntityRef>,
    ) -> Result<Option<EntityRef>> {
        let Some(original) = original else {
            return Ok(None);
        };
        if let Some(managed) = self.merge_context.get(original) {
            return Ok(Some(managed));
        }
        if Some(original) == target {
            return Ok(target);
        }
        if let Some(proxy) = self.store.proxy(original) {
            if !proxy.is_initialized() {
                let (entity_name, id) = (proxy.entity_name, proxy.identifier.clone());
                return self.load(entity_name, id).map(Some);
            }
        }

        let instance = self.store.unproxy(original)?;
        if let Some(managed) = self.merge_context.get(instance) {
            return Ok(Some(managed));
        }
        let persister = self.persister_for(property.kind.target(), instance)?;
        if !self.persistence_context.is_managed(instance)
            && self.is_transient(persister.as_ref(), instance, Some(false))?
        {
            let copy = self.store.insert(persister.instantiate(Value::Null));
            tracing::trace!(
                original = %self.store.info_string(instance),
                copy = %copy,
                property = property.name,
                "Instantiated copy of transient association"
            );
            self.merge_context.put(instance, copy, false, &self.store)?;
            return Ok(Some(copy));
        }

        let id = persister.get_identifier(&self.store, instance)?;
        if id.is_null() {
            return Err(Error::merge(
                MergeErrorKind::AssertionFailure,
                format!(
                    "non-transient entity has a null id: {}",
                    self.store.info_string(instance)
                ),
            ));
        }
        self.load(persister.entity_name(), id).map(Some)
    }
}
