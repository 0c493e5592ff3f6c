//! Cascade walker.
//!
//! Propagates an operation from an entity to the entities it references,
//! following the cascade styles of the mapping. The walker itself has no
//! cycle protection: a cascaded merge stops at entities whose merge is
//! already in progress, which the merge context tracks.

use ormerge_core::{
    CascadeKind, CascadePoint, Datastore, EntityPersister, EntityRef, PropertyValue, Result,
};

use crate::Session;

/// An operation that can be cascaded to associated entities.
pub trait CascadingAction {
    /// The cascade kind a property must declare for this action to reach it.
    fn kind(&self) -> CascadeKind;

    /// Apply the action to `child`, reached through an association to `entity_name`.
    fn cascade<D: Datastore>(
        &self,
        session: &mut Session<D>,
        child: EntityRef,
        entity_name: &'static str,
    ) -> Result<()>;
}

/// Cascaded merge: the child is merged within the running top-level merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeCascade;

impl CascadingAction for MergeCascade {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Merge
    }

    fn cascade<D: Datastore>(
        &self,
        session: &mut Session<D>,
        child: EntityRef,
        entity_name: &'static str,
    ) -> Result<()> {
        tracing::trace!(child = %child, entity_name, "Cascading merge");
        session.fire_nested_merge(child, Some(entity_name))?;
        Ok(())
    }
}

/// Cascaded delete of managed children.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteCascade;

impl CascadingAction for DeleteCascade {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Delete
    }

    fn cascade<D: Datastore>(
        &self,
        session: &mut Session<D>,
        child: EntityRef,
        entity_name: &'static str,
    ) -> Result<()> {
        let child = session.store.unproxy(child)?;
        if !session.persistence_context.is_managed(child) {
            tracing::trace!(child = %child, entity_name, "Skipping delete of unmanaged child");
            return Ok(());
        }
        session.delete(child)
    }
}

impl<D: Datastore> Session<D> {
    /// Cascade `action` from `entity` at `point`.
    ///
    /// Properties are visited in mapping order. Uninitialized proxies and
    /// collections are skipped since they cannot hold changes.
    pub(crate) fn cascade<A: CascadingAction>(
        &mut self,
        action: &A,
        point: CascadePoint,
        persister: &dyn EntityPersister,
        entity: EntityRef,
    ) -> Result<()> {
        let kind = action.kind();
        if !persister
            .properties()
            .iter()
            .any(|p| p.cascade.does_cascade(kind))
        {
            return Ok(());
        }

        let level = self.persistence_context.increment_cascade_level();
        tracing::trace!(
            entity = %self.store.info_string(entity),
            action = kind.as_str(),
            point = ?point,
            level,
            "Processing cascade"
        );
        let result = self.cascade_properties(action, point, persister, entity);
        self.persistence_context.decrement_cascade_level();
        result
    }

    fn cascade_properties<A: CascadingAction>(
        &mut self,
        action: &A,
        point: CascadePoint,
        persister: &dyn EntityPersister,
        entity: EntityRef,
    ) -> Result<()> {
        let values = persister.get_property_values(&self.store, entity)?;
        for (property, value) in persister.properties().iter().zip(values) {
            if !property.cascade.does_cascade(action.kind()) {
                continue;
            }
            let (Some(target), Some(direction)) =
                (property.kind.target(), property.kind.foreign_key_direction())
            else {
                continue;
            };
            if !direction.cascade_now(point) {
                continue;
            }
            match value {
                PropertyValue::Reference(Some(child)) => {
                    if self.store.is_uninitialized_proxy(child) {
                        tracing::trace!(property = property.name, "Ignoring uninitialized proxy");
                        continue;
                    }
                    action.cascade(self, child, target)?;
                }
                PropertyValue::Collection(collection) => {
                    if !collection.initialized {
                        tracing::trace!(
                            property = property.name,
                            "Ignoring uninitialized collection"
                        );
                        continue;
                    }
                    for child in collection.elements {
                        if self.store.is_uninitialized_proxy(child) {
                            continue;
                        }
                        action.cascade(self, child, target)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_session;
    use ormerge_core::CollectionValue;
    use std::cell::RefCell;

    /// Records every child it is applied to.
    #[derive(Default)]
    struct Recording {
        kind: Option<CascadeKind>,
        visited: RefCell<Vec<(EntityRef, &'static str, u32)>>,
    }

    impl CascadingAction for Recording {
        fn kind(&self) -> CascadeKind {
            self.kind.unwrap_or(CascadeKind::Merge)
        }

        fn cascade<D: Datastore>(
            &self,
            session: &mut Session<D>,
            child: EntityRef,
            entity_name: &'static str,
        ) -> Result<()> {
            self.visited.borrow_mut().push((
                child,
                entity_name,
                session.persistence_context.cascade_level(),
            ));
            Ok(())
        }
    }

    #[test]
    fn test_visits_in_mapping_order_with_direction_filter() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let category = session.instantiate("Category").unwrap();
        let bid1 = session.instantiate("Bid").unwrap();
        let bid2 = session.instantiate("Bid").unwrap();
        session.set_reference(item, "category", Some(category)).unwrap();
        session.set_collection(item, "bids", [bid1, bid2]).unwrap();
        let persister = session.registry().persister("Item").unwrap();

        let action = Recording::default();
        session
            .cascade(&action, CascadePoint::BeforeMerge, persister.as_ref(), item)
            .unwrap();
        assert_eq!(
            *action.visited.borrow(),
            vec![(category, "Category", 1), (bid1, "Bid", 1), (bid2, "Bid", 1)]
        );
        assert_eq!(session.persistence_context.cascade_level(), 0);

        let action = Recording::default();
        session
            .cascade(
                &action,
                CascadePoint::BeforeInsertAfterDelete,
                persister.as_ref(),
                item,
            )
            .unwrap();
        assert_eq!(*action.visited.borrow(), vec![(category, "Category", 1)]);

        let action = Recording::default();
        session
            .cascade(
                &action,
                CascadePoint::AfterInsertBeforeDelete,
                persister.as_ref(),
                item,
            )
            .unwrap();
        assert_eq!(
            *action.visited.borrow(),
            vec![(bid1, "Bid", 1), (bid2, "Bid", 1)]
        );
    }

    #[test]
    fn test_skips_uninitialized_values() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let proxy = session.load("Category", 4).unwrap();
        session.set_reference(item, "category", Some(proxy)).unwrap();
        session
            .set_property(
                item,
                "bids",
                PropertyValue::Collection(CollectionValue::uninitialized()),
            )
            .unwrap();
        let persister = session.registry().persister("Item").unwrap();

        let action = Recording::default();
        session
            .cascade(&action, CascadePoint::BeforeMerge, persister.as_ref(), item)
            .unwrap();
        assert!(action.visited.borrow().is_empty());
    }

    #[test]
    fn test_kind_without_cascading_property_does_nothing() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let category = session.instantiate("Category").unwrap();
        session.set_reference(item, "category", Some(category)).unwrap();
        let persister = session.registry().persister("Item").unwrap();

        let action = Recording {
            kind: Some(CascadeKind::Refresh),
            ..Recording::default()
        };
        session
            .cascade(&action, CascadePoint::BeforeMerge, persister.as_ref(), item)
            .unwrap();
        assert!(action.visited.borrow().is_empty());
    }
}
