//! Entity state classification.
//!
//! A merge decides what to do with an instance from its state relative to
//! the session: managed by it, scheduled for deletion in it, known to the
//! datastore but not managed, or never saved.

use std::fmt;

use ormerge_core::{Datastore, EntityPersister, EntityRef, EntityStore, Result};

use crate::Session;
use crate::persistence_context::EntryStatus;

/// State of an instance relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Never saved.
    Transient,
    /// Saved, but not managed by this session.
    Detached,
    /// Managed by this session.
    Persistent,
    /// Managed and scheduled for deletion, or already deleted.
    Deleted,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Transient => "TRANSIENT",
            EntityState::Detached => "DETACHED",
            EntityState::Persistent => "PERSISTENT",
            EntityState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application hooks consulted by the session.
pub trait Interceptor: fmt::Debug {
    /// Whether `entity` was never saved. `None` leaves the decision to the
    /// mapping's unsaved-value strategies.
    fn is_transient(&self, store: &EntityStore, entity: EntityRef) -> Option<bool> {
        let _ = (store, entity);
        None
    }
}

impl<D: Datastore> Session<D> {
    /// State of `entity` as seen by a merge.
    ///
    /// An instance that is not managed but carries the identifier of a
    /// managed one is `Detached`. Otherwise unsaved-value rules decide, and
    /// an undecided instance is assumed `Detached` without asking the
    /// datastore.
    pub fn classify(&mut self, entity_name: Option<&str>, entity: EntityRef) -> Result<EntityState> {
        let persister = self.persister_for(entity_name, entity)?;
        if self.persistence_context.get_entry(entity).is_none() {
            let id = persister.get_identifier(&self.store, entity)?;
            if !id.is_null() {
                let key = persister.entity_key(id);
                if let Some(managed) = self.persistence_context.get_entity(&key) {
                    if self.persistence_context.get_entry(managed).is_some() {
                        return Ok(EntityState::Detached);
                    }
                }
            }
        }
        self.entity_state(persister.as_ref(), entity, Some(false))
    }

    /// State of `entity`. With `assumed` unset an undecided instance is
    /// looked up in the datastore.
    pub(crate) fn entity_state(
        &mut self,
        persister: &dyn EntityPersister,
        entity: EntityRef,
        assumed: Option<bool>,
    ) -> Result<EntityState> {
        if let Some(entry) = self.persistence_context.get_entry(entity) {
            return Ok(match entry.status {
                EntryStatus::Managed => EntityState::Persistent,
                EntryStatus::Deleted | EntryStatus::Gone => EntityState::Deleted,
            });
        }
        if self.is_transient(persister, entity, assumed)? {
            Ok(EntityState::Transient)
        } else {
            Ok(EntityState::Detached)
        }
    }

    /// Whether `entity` was never saved.
    ///
    /// Asks the interceptor, then the persister's unsaved-value strategies,
    /// then falls back to `assumed`. Without an assumption the datastore is
    /// checked for a row under the instance's key.
    pub fn is_transient(
        &mut self,
        persister: &dyn EntityPersister,
        entity: EntityRef,
        assumed: Option<bool>,
    ) -> Result<bool> {
        if let Some(interceptor) = &self.interceptor {
            if let Some(transient) = interceptor.is_transient(&self.store, entity) {
                return Ok(transient);
            }
        }
        if let Some(transient) = persister.is_transient(&self.store, entity)? {
            return Ok(transient);
        }
        if let Some(assumed) = assumed {
            return Ok(assumed);
        }
        let key = persister.entity_key(persister.get_identifier(&self.store, entity)?);
        tracing::trace!(key = %key, "Probing datastore to decide transience");
        self.statistics.entity_fetch();
        let row = self.datastore.fetch(&key, self.internal_fetch_profile)?;
        Ok(row.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_session, seed_item};
    use ormerge_core::Value;

    #[derive(Debug)]
    struct EverythingIsNew;

    impl Interceptor for EverythingIsNew {
        fn is_transient(&self, _store: &EntityStore, _entity: EntityRef) -> Option<bool> {
            Some(true)
        }
    }

    #[test]
    fn test_unsaved_identifier_is_transient() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        assert_eq!(session.classify(None, item).unwrap(), EntityState::Transient);
    }

    #[test]
    fn test_identifier_and_version_is_detached() {
        let mut session = test_session();
        let item = session.instantiate_with_id("Item", 5_i64).unwrap();
        session.set_version(item, Value::BigInt(1)).unwrap();
        assert_eq!(session.classify(None, item).unwrap(), EntityState::Detached);
    }

    #[test]
    fn test_managed_is_persistent_and_deleted() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");
        let item = session.get("Item", 1_i64).unwrap().unwrap();
        assert_eq!(session.classify(None, item).unwrap(), EntityState::Persistent);

        session.delete(item).unwrap();
        assert_eq!(session.classify(None, item).unwrap(), EntityState::Deleted);
    }

    #[test]
    fn test_copy_of_managed_instance_is_detached() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");
        session.get("Item", 1_i64).unwrap();

        let copy = session.instantiate_with_id("Item", 1_i64).unwrap();
        assert_eq!(session.classify(None, copy).unwrap(), EntityState::Detached);
    }

    #[test]
    fn test_interceptor_is_consulted_first() {
        let mut session = test_session().with_interceptor(Box::new(EverythingIsNew));
        let item = session.instantiate_with_id("Item", 5_i64).unwrap();
        session.set_version(item, Value::BigInt(1)).unwrap();
        assert_eq!(session.classify(None, item).unwrap(), EntityState::Transient);
    }

    #[test]
    fn test_undecided_assigned_identifier_checks_datastore() {
        let mut session = test_session();
        crate::testing::seed_tag(&mut session, "rust");
        let persister = session.registry().persister("Tag").unwrap();

        let known = session.instantiate_with_id("Tag", "rust").unwrap();
        let unknown = session.instantiate_with_id("Tag", "go").unwrap();

        assert!(!session.is_transient(persister.as_ref(), known, None).unwrap());
        assert!(session.is_transient(persister.as_ref(), unknown, None).unwrap());
        assert!(!session.is_transient(persister.as_ref(), unknown, Some(false)).unwrap());
        assert_eq!(session.datastore().counters().fetches, 2);
    }
}
