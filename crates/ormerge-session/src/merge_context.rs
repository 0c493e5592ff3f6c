//! Cross-reference table between merge entities and managed entities.
//!
//! One table lives on each session. It is cleared when a top-level merge
//! starts and again when it completes, whether the merge succeeded or not.
//! Within one top-level merge it records which managed entity every visited
//! merge entity resolved to, and whether the merge of that entity is still
//! running (the in-progress flag that stops recursion on cyclic graphs).

use std::collections::HashMap;
use std::fmt;

use ormerge_core::{EntityRef, EntityStore, Error, MergeError, MergeErrorKind, Result};

use crate::copy_observer::{EntityCopyObserver, EntityCopyObserverKind};

/// Builds the session's entity copy observer on first use.
pub type EntityCopyObserverFactory = Box<dyn Fn() -> Box<dyn EntityCopyObserver>>;

/// Binding of one merge entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEntry {
    pub managed: EntityRef,
    pub in_progress: bool,
}

pub struct MergeContext {
    merge_to_managed: HashMap<EntityRef, MergeEntry>,
    /// Most recently bound merge entity per managed entity.
    managed_to_merge: HashMap<EntityRef, EntityRef>,
    observer_factory: EntityCopyObserverFactory,
    observer: Option<Box<dyn EntityCopyObserver>>,
    operation_in_progress: bool,
    copies_detected: u64,
}

impl MergeContext {
    pub fn new(kind: EntityCopyObserverKind) -> Self {
        Self::with_observer_factory(Box::new(move || kind.create()))
    }

    pub fn with_observer_factory(factory: EntityCopyObserverFactory) -> Self {
        Self {
            merge_to_managed: HashMap::new(),
            managed_to_merge: HashMap::new(),
            observer_factory: factory,
            observer: None,
            operation_in_progress: false,
            copies_detected: 0,
        }
    }

    /// Replace the observer factory. An observer that was already created is dropped.
    pub fn set_observer_factory(&mut self, factory: EntityCopyObserverFactory) {
        self.observer_factory = factory;
        self.observer = None;
    }

    fn observer(&mut self) -> &mut Box<dyn EntityCopyObserver> {
        let factory = &self.observer_factory;
        self.observer.get_or_insert_with(|| factory())
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// Start a top-level merge.
    pub fn before_operation(&mut self) {
        self.observer();
        self.merge_to_managed.clear();
        self.managed_to_merge.clear();
        self.operation_in_progress = true;
    }

    /// Finish a top-level merge: report completion to the observer, then clear.
    pub fn after_operation(&mut self, store: &EntityStore) {
        self.observer().top_level_merge_complete(store);
        self.clear();
        self.operation_in_progress = false;
    }

    /// Whether a top-level merge is running on this session.
    pub fn is_operation_in_progress(&self) -> bool {
        self.operation_in_progress
    }

    /// Bind `merge_entity` to `managed`.
    ///
    /// Returns the managed entity previously bound to `merge_entity`, if any.
    /// Rebinding to a different managed entity fails. Binding a new merge
    /// entity to a managed entity that already has one reports an entity copy
    /// to the observer before the binding is stored.
    pub fn put(
        &mut self,
        merge_entity: EntityRef,
        managed: EntityRef,
        in_progress: bool,
        store: &EntityStore,
    ) -> Result<Option<EntityRef>> {
        if let Some(existing) = self.merge_to_managed.get(&merge_entity).copied() {
            if existing.managed != managed {
                return Err(MergeError::new(
                    MergeErrorKind::IllegalArgument,
                    format!(
                        "Error occurred while storing a merge entity {}. It was previously \
                         associated with managed entity {}. Attempted to replace managed entity with {}",
                        store.info_string(merge_entity),
                        store.info_string(existing.managed),
                        store.info_string(managed),
                    ),
                )
                .into());
            }
            if !self.managed_to_merge.contains_key(&managed) {
                return Err(inconsistency(format!(
                    "merge entity {} is bound to {} but the inverse index has no entry for it",
                    store.info_string(merge_entity),
                    store.info_string(managed),
                )));
            }
            self.merge_to_managed.insert(
                merge_entity,
                MergeEntry {
                    managed,
                    in_progress,
                },
            );
            self.managed_to_merge.insert(managed, merge_entity);
            return Ok(Some(existing.managed));
        }

        if let Some(old_merge_entity) = self.managed_to_merge.get(&managed).copied() {
            if !self.merge_to_managed.contains_key(&old_merge_entity) {
                return Err(inconsistency(format!(
                    "inverse index maps {} to {}, which has no forward binding",
                    store.info_string(managed),
                    store.info_string(old_merge_entity),
                )));
            }
            self.copies_detected += 1;
            self.observer()
                .entity_copy_detected(managed, merge_entity, old_merge_entity, store)?;
        }

        tracing::trace!(
            merge_entity = %merge_entity,
            managed = %managed,
            in_progress,
            "Binding merge entity"
        );
        self.merge_to_managed.insert(
            merge_entity,
            MergeEntry {
                managed,
                in_progress,
            },
        );
        self.managed_to_merge.insert(managed, merge_entity);
        Ok(None)
    }

    pub fn get(&self, merge_entity: EntityRef) -> Option<EntityRef> {
        self.merge_to_managed.get(&merge_entity).map(|e| e.managed)
    }

    pub fn contains(&self, merge_entity: EntityRef) -> bool {
        self.merge_to_managed.contains_key(&merge_entity)
    }

    /// Whether `managed` is the target of some binding.
    pub fn contains_managed(&self, managed: EntityRef) -> bool {
        self.managed_to_merge.contains_key(&managed)
    }

    /// `false` when `merge_entity` is not bound.
    pub fn is_in_progress(&self, merge_entity: EntityRef) -> bool {
        self.merge_to_managed
            .get(&merge_entity)
            .is_some_and(|e| e.in_progress)
    }

    pub fn set_in_progress(&mut self, merge_entity: EntityRef, in_progress: bool) -> Result<()> {
        let entry = self.merge_to_managed.get_mut(&merge_entity).ok_or_else(|| {
            inconsistency(format!(
                "set_in_progress called for merge entity {merge_entity} not found in the merge context"
            ))
        })?;
        entry.in_progress = in_progress;
        Ok(())
    }

    /// Empty both indices and reset the observer's per-merge state.
    pub fn clear(&mut self) {
        self.merge_to_managed.clear();
        self.managed_to_merge.clear();
        if let Some(observer) = self.observer.as_mut() {
            observer.clear();
        }
    }

    /// Managed entity to its most recently bound merge entity.
    pub fn invert(&self) -> &HashMap<EntityRef, EntityRef> {
        &self.managed_to_merge
    }

    /// Number of bound merge entities.
    pub fn len(&self) -> usize {
        self.merge_to_managed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merge_to_managed.is_empty()
    }

    /// Bindings ordered by merge entity handle.
    pub fn entries(&self) -> Vec<(EntityRef, MergeEntry)> {
        let mut entries: Vec<_> = self
            .merge_to_managed
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        entries.sort_unstable_by_key(|(k, _)| *k);
        entries
    }

    /// Entity copies reported to the observer over the life of the session.
    pub fn copies_detected(&self) -> u64 {
        self.copies_detected
    }
}

impl Default for MergeContext {
    fn default() -> Self {
        Self::new(EntityCopyObserverKind::default())
    }
}

impl fmt::Debug for MergeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeContext")
            .field("merge_to_managed", &self.merge_to_managed)
            .field("managed_to_merge", &self.managed_to_merge)
            .field("observer", &self.observer)
            .field("operation_in_progress", &self.operation_in_progress)
            .finish_non_exhaustive()
    }
}

fn inconsistency(message: String) -> Error {
    MergeError::new(MergeErrorKind::InternalConsistency, message).into()
}
