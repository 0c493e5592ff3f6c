//! Policies for several representations of one row in a single merge.
//!
//! When two distinct merge entities resolve to the same managed entity, the
//! merge context reports it to the session's [`EntityCopyObserver`]. The
//! observer decides whether the merge fails, proceeds silently, or proceeds
//! and reports a summary when the top-level merge completes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use ormerge_core::{EntityRef, EntityStore, Error, MergeError, MergeErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Notified of entity copies during a merge.
pub trait EntityCopyObserver: fmt::Debug {
    /// `managed` is bound to both `merge_entity` and the previously bound
    /// `old_merge_entity`.
    fn entity_copy_detected(
        &mut self,
        managed: EntityRef,
        merge_entity: EntityRef,
        old_merge_entity: EntityRef,
        store: &EntityStore,
    ) -> Result<()>;

    /// Called once when the outermost merge call finishes.
    fn top_level_merge_complete(&mut self, store: &EntityStore);

    /// Forget per-merge state.
    fn clear(&mut self);
}

/// Built-in observer strategies, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCopyObserverKind {
    /// Entity copies fail the merge.
    #[default]
    Disallow,
    /// Entity copies are merged without notice.
    Allow,
    /// Entity copies are merged and summarized in a warning.
    Log,
}

impl EntityCopyObserverKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityCopyObserverKind::Disallow => "disallow",
            EntityCopyObserverKind::Allow => "allow",
            EntityCopyObserverKind::Log => "log",
        }
    }

    pub fn create(self) -> Box<dyn EntityCopyObserver> {
        match self {
            EntityCopyObserverKind::Disallow => Box::new(EntityCopyNotAllowedObserver),
            EntityCopyObserverKind::Allow => Box::new(EntityCopyAllowedObserver),
            EntityCopyObserverKind::Log => Box::new(EntityCopyLoggedObserver::new()),
        }
    }
}

impl FromStr for EntityCopyObserverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disallow" => Ok(EntityCopyObserverKind::Disallow),
            "allow" => Ok(EntityCopyObserverKind::Allow),
            "log" => Ok(EntityCopyObserverKind::Log),
            other => Err(Error::Config(ormerge_core::ConfigError {
                message: format!(
                    "unknown entity copy observer '{other}' (expected disallow, allow or log)"
                ),
                source: None,
            })),
        }
    }
}

impl fmt::Display for EntityCopyObserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejects every entity copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityCopyNotAllowedObserver;

impl EntityCopyObserver for EntityCopyNotAllowedObserver {
    fn entity_copy_detected(
        &mut self,
        managed: EntityRef,
        merge_entity: EntityRef,
        old_merge_entity: EntityRef,
        store: &EntityStore,
    ) -> Result<()> {
        let managed_info = store.info_string(managed);
        let entity_name = store.entity_name(managed)?;
        let identifier = store.instance(managed).ok().map(|d| d.identifier.clone());
        Err(MergeError::new(
            MergeErrorKind::EntityCopy,
            format!(
                "Multiple representations of the same entity {managed_info} are being merged. \
                 Detached: {}; Detached: {}",
                store.info_string(old_merge_entity),
                store.info_string(merge_entity),
            ),
        )
        .with_entity(entity_name, identifier)
        .into())
    }

    fn top_level_merge_complete(&mut self, _store: &EntityStore) {}

    fn clear(&mut self) {}
}

/// Permits entity copies silently.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityCopyAllowedObserver;

impl EntityCopyObserver for EntityCopyAllowedObserver {
    fn entity_copy_detected(
        &mut self,
        _managed: EntityRef,
        _merge_entity: EntityRef,
        _old_merge_entity: EntityRef,
        _store: &EntityStore,
    ) -> Result<()> {
        Ok(())
    }

    fn top_level_merge_complete(&mut self, _store: &EntityStore) {}

    fn clear(&mut self) {}
}

/// Entity copies seen during one top-level merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityCopySummary {
    /// Number of distinct managed entities with several representations, per entity name.
    pub counts_by_entity: BTreeMap<&'static str, usize>,
    /// Managed entity label with the labels of every representation merged onto it.
    pub details: Vec<(String, Vec<String>)>,
}

impl EntityCopySummary {
    pub fn is_empty(&self) -> bool {
        self.counts_by_entity.is_empty()
    }
}

/// Permits entity copies and logs a summary per top-level merge.
#[derive(Debug, Default)]
pub struct EntityCopyLoggedObserver {
    representations: BTreeMap<EntityRef, BTreeSet<EntityRef>>,
    counts_by_entity: BTreeMap<&'static str, usize>,
    last_summary: Option<EntityCopySummary>,
}

impl EntityCopyLoggedObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies recorded since the last top-level completion.
    pub fn summary(&self, store: &EntityStore) -> EntityCopySummary {
        EntityCopySummary {
            counts_by_entity: self.counts_by_entity.clone(),
            details: self
                .representations
                .iter()
                .map(|(managed, merged)| {
                    (
                        store.info_string(*managed),
                        merged.iter().map(|m| store.info_string(*m)).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Summary emitted by the most recent top-level completion, if it saw copies.
    pub fn last_summary(&self) -> Option<&EntityCopySummary> {
        self.last_summary.as_ref()
    }
}

impl EntityCopyObserver for EntityCopyLoggedObserver {
    fn entity_copy_detected(
        &mut self,
        managed: EntityRef,
        merge_entity: EntityRef,
        old_merge_entity: EntityRef,
        store: &EntityStore,
    ) -> Result<()> {
        tracing::trace!(
            managed = %store.info_string(managed),
            "More than one representation of the same persistent entity being merged"
        );
        let merged = self.representations.entry(managed).or_default();
        let first_copy = merged.is_empty();
        merged.insert(old_merge_entity);
        merged.insert(merge_entity);
        if first_copy {
            *self
                .counts_by_entity
                .entry(store.entity_name(managed)?)
                .or_insert(0) += 1;
        }
        Ok(())
    }

    fn top_level_merge_complete(&mut self, store: &EntityStore) {
        if self.representations.is_empty() {
            self.last_summary = None;
            return;
        }
        let summary = self.summary(store);
        let counts = summary
            .counts_by_entity
            .iter()
            .map(|(name, n)| format!("{name}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let details = summary
            .details
            .iter()
            .map(|(managed, merged)| format!("{managed} <- [{}]", merged.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(
            counts = %counts,
            details = %details,
            "Merged multiple representations of the same persistent entities"
        );
        self.last_summary = Some(summary);
        self.representations.clear();
        self.counts_by_entity.clear();
    }

    fn clear(&mut self) {
        self.representations.clear();
        self.counts_by_entity.clear();
    }
}
