//! Session, unit of work and merge engine for ormerge.
//!
//! `ormerge-session` is the **unit-of-work layer**. A [`Session`] manages
//! entity instances living in an [`EntityStore`] arena: it knows which
//! instance is authoritative for each identity, queues inserts and deletes,
//! detects dirty instances on flush, and merges detached or transient
//! object graphs onto the instances it manages.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one managed instance per entity key, plus lazy proxies.
//! - **Merge**: state classification, cascades, and the merge cross-reference table.
//! - **Flush**: inserts, versioned updates and deletes through a [`Datastore`].
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: No autoflush by default.
//! - **Handles, not pointers**: instances are addressed by [`EntityRef`], so
//!   identity is handle equality and cyclic graphs need no shared ownership.
//! - **Single-threaded**: a session is used by one thread of control at a time.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(InMemoryDatastore::new(), registry);
//!
//! // A detached copy of row Item#1, edited outside the session
//! let detached = session.instantiate_with_id("Item", 1_i64)?;
//! session.set_version(detached, 3_i64)?;
//! session.set_scalar(detached, "name", "desk lamp")?;
//!
//! // Copy its state onto the managed instance, loading it if needed
//! let managed = session.merge(detached)?;
//!
//! // Write the changes
//! session.flush()?;
//! ```

pub mod action_queue;
pub mod cascade;
pub mod change_tracker;
pub mod copy_observer;
pub mod entity_state;
pub mod flush;
pub mod merge;
pub mod merge_context;
pub mod persistence_context;
pub mod statistics;

#[cfg(test)]
mod testing;

pub use action_queue::{ActionQueue, EntityDeleteAction, EntityInsertAction, PendingCounts};
pub use cascade::{CascadingAction, DeleteCascade, MergeCascade};
pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use copy_observer::{
    EntityCopyAllowedObserver, EntityCopyLoggedObserver, EntityCopyNotAllowedObserver,
    EntityCopyObserver, EntityCopyObserverKind, EntityCopySummary,
};
pub use entity_state::{EntityState, Interceptor};
pub use flush::FlushResult;
pub use merge::{MERGE_FETCH_PROFILE, MergeEvent};
pub use merge_context::{EntityCopyObserverFactory, MergeContext, MergeEntry};
pub use persistence_context::{EntityEntry, EntryStatus, PersistenceContext};
pub use statistics::{SessionStats, Statistics};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ormerge_core::{
    CascadePoint, CollectionValue, ConfigError, Datastore, DirtyTracker, EntityKey,
    EntityPersister, EntityRef, EntityStore, Error, IdGeneration, IdentifierGenerationError,
    LazyProxy, MappingErrorKind, MergeError, MergeErrorKind, PersistenceErrorKind,
    PersisterRegistry, PropertyMetadata, PropertyValue, Result, Row, StoredValue, Value,
};
use serde::Deserialize;

// ============================================================================
// Session Configuration
// ============================================================================

/// Setting naming the entity copy observer strategy.
pub const ENTITY_COPY_OBSERVER_SETTING: &str = "ormerge.merge.entity_copy_observer";
/// Setting enabling session statistics.
pub const STATISTICS_ENABLED_SETTING: &str = "ormerge.generate_statistics";
/// Setting enabling auto-flush before loads.
pub const AUTO_FLUSH_SETTING: &str = "ormerge.auto_flush";

/// Configuration for Session behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What a merge does when several instances of one row are merged.
    pub entity_copy_observer: EntityCopyObserverKind,
    /// Whether to collect [`SessionStats`].
    pub statistics_enabled: bool,
    /// Whether `get` flushes pending changes before going to the datastore.
    /// Never happens while a cascade is running.
    pub auto_flush: bool,
}

impl SessionConfig {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document such as `{"entity_copy_observer": "log"}`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Read string settings. Unknown keys are ignored.
    pub fn from_settings(settings: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = settings.get(ENTITY_COPY_OBSERVER_SETTING) {
            config.entity_copy_observer = name.parse()?;
        }
        if let Some(value) = settings.get(STATISTICS_ENABLED_SETTING) {
            config.statistics_enabled = parse_flag(STATISTICS_ENABLED_SETTING, value)?;
        }
        if let Some(value) = settings.get(AUTO_FLUSH_SETTING) {
            config.auto_flush = parse_flag(AUTO_FLUSH_SETTING, value)?;
        }
        Ok(config)
    }

    /// Set the `entity_copy_observer` option (builder pattern).
    #[must_use]
    pub fn entity_copy_observer(mut self, kind: EntityCopyObserverKind) -> Self {
        self.entity_copy_observer = kind;
        self
    }

    /// Set the `statistics_enabled` option (builder pattern).
    #[must_use]
    pub fn statistics_enabled(mut self, value: bool) -> Self {
        self.statistics_enabled = value;
        self
    }

    /// Set the `auto_flush` option (builder pattern).
    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Error::Config(ConfigError {
            message: format!("setting {key} expects a boolean, got '{other}'"),
            source: None,
        })),
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It owns the instances it hands out, tracks which of them are managed,
/// and coordinates merging and flushing changes back to the datastore.
pub struct Session<D: Datastore> {
    pub(crate) datastore: D,
    pub(crate) registry: Arc<PersisterRegistry>,
    pub(crate) store: EntityStore,
    pub(crate) persistence_context: PersistenceContext,
    pub(crate) change_tracker: ChangeTracker,
    pub(crate) action_queue: ActionQueue,
    pub(crate) merge_context: MergeContext,
    pub(crate) interceptor: Option<Box<dyn Interceptor>>,
    /// Fetch profile passed to the datastore by internal loads.
    pub(crate) internal_fetch_profile: Option<&'static str>,
    pub(crate) statistics: Statistics,
    config: SessionConfig,
}

impl<D: Datastore> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.store.len())
            .field("managed", &self.persistence_context.len())
            .field("queued_actions", &self.action_queue.len())
            .field("merge_context", &self.merge_context)
            .field("internal_fetch_profile", &self.internal_fetch_profile)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Datastore> Session<D> {
    /// Create a new session over `datastore`.
    pub fn new(datastore: D, registry: Arc<PersisterRegistry>) -> Self {
        Self::with_config(datastore, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(datastore: D, registry: Arc<PersisterRegistry>, config: SessionConfig) -> Self {
        tracing::debug!(
            entity_copy_observer = %config.entity_copy_observer,
            statistics_enabled = config.statistics_enabled,
            auto_flush = config.auto_flush,
            "Creating session"
        );
        Self {
            datastore,
            registry,
            store: EntityStore::new(),
            persistence_context: PersistenceContext::new(),
            change_tracker: ChangeTracker::new(),
            action_queue: ActionQueue::new(),
            merge_context: MergeContext::new(config.entity_copy_observer),
            interceptor: None,
            internal_fetch_profile: None,
            statistics: Statistics::new(config.statistics_enabled),
            config,
        }
    }

    /// Use a custom entity copy observer. The factory runs on the first merge.
    #[must_use]
    pub fn with_entity_copy_observer_factory(
        mut self,
        factory: impl Fn() -> Box<dyn EntityCopyObserver> + 'static,
    ) -> Self {
        tracing::debug!("Using custom entity copy observer");
        self.merge_context.set_observer_factory(Box::new(factory));
        self
    }

    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Box<dyn Interceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PersisterRegistry> {
        &self.registry
    }

    pub fn datastore(&self) -> &D {
        &self.datastore
    }

    pub fn datastore_mut(&mut self) -> &mut D {
        &mut self.datastore
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }

    pub fn merge_context(&self) -> &MergeContext {
        &self.merge_context
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.persistence_context
    }

    /// Inserts and deletes waiting for the next flush.
    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    pub fn statistics(&self) -> SessionStats {
        self.statistics.snapshot()
    }

    /// Persister of `entity`. A requested entity name must share the
    /// instance's inheritance root.
    pub(crate) fn persister_for(
        &self,
        entity_name: Option<&str>,
        entity: EntityRef,
    ) -> Result<Arc<dyn EntityPersister>> {
        let persister = self.registry.persister(self.store.entity_name(entity)?)?;
        if let Some(name) = entity_name {
            if name != persister.entity_name() {
                let requested = self.registry.persister(name)?;
                if requested.root_entity_name() != persister.root_entity_name() {
                    return Err(Error::mapping(
                        MappingErrorKind::Invalid,
                        format!(
                            "{} is not an instance of entity {name}",
                            self.store.info_string(entity)
                        ),
                    ));
                }
            }
        }
        Ok(persister)
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// A new transient instance without identifier.
    pub fn instantiate(&mut self, entity_name: &str) -> Result<EntityRef> {
        self.instantiate_with_id(entity_name, Value::Null)
    }

    /// A new unmanaged instance carrying `id`, such as a detached copy of a row.
    pub fn instantiate_with_id(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let persister = self.registry.persister(entity_name)?;
        Ok(self.store.insert(persister.instantiate(id.into())))
    }

    fn property_index(
        &self,
        entity: EntityRef,
        property: &str,
    ) -> Result<(Arc<dyn EntityPersister>, usize)> {
        let persister = self.persister_for(None, entity)?;
        let index = persister
            .metadata()
            .property_index(property)
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    format!("unknown property {}.{property}", persister.entity_name()),
                )
            })?;
        Ok((persister, index))
    }

    /// Set one property. Instances tracking dirty attributes record the change.
    pub fn set_property(
        &mut self,
        entity: EntityRef,
        property: &str,
        value: PropertyValue,
    ) -> Result<()> {
        let (persister, index) = self.property_index(entity, property)?;
        let mut values = persister.get_property_values(&self.store, entity)?;
        if let Some(slot) = values.get_mut(index) {
            *slot = value;
        }
        persister.set_property_values(&mut self.store, entity, values)?;
        if let Some(tracker) = self.store.instance_mut(entity)?.dirty_tracker.as_mut() {
            tracker.track_change(property);
        }
        Ok(())
    }

    pub fn set_scalar(&mut self, entity: EntityRef, property: &str, value: impl Into<Value>) -> Result<()> {
        self.set_property(entity, property, PropertyValue::Scalar(value.into()))
    }

    pub fn set_component(&mut self, entity: EntityRef, property: &str, values: Vec<Value>) -> Result<()> {
        self.set_property(entity, property, PropertyValue::Component(values))
    }

    pub fn set_reference(
        &mut self,
        entity: EntityRef,
        property: &str,
        target: Option<EntityRef>,
    ) -> Result<()> {
        self.set_property(entity, property, PropertyValue::Reference(target))
    }

    pub fn set_collection(
        &mut self,
        entity: EntityRef,
        property: &str,
        elements: impl IntoIterator<Item = EntityRef>,
    ) -> Result<()> {
        self.set_property(
            entity,
            property,
            PropertyValue::Collection(CollectionValue::of(elements)),
        )
    }

    pub fn property(&self, entity: EntityRef, property: &str) -> Result<PropertyValue> {
        let (_, index) = self.property_index(entity, property)?;
        self.store
            .instance(entity)?
            .values
            .get(index)
            .cloned()
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::ValueShape,
                    format!("{} has no value for {property}", self.store.info_string(entity)),
                )
            })
    }

    pub fn scalar(&self, entity: EntityRef, property: &str) -> Result<Value> {
        match self.property(entity, property)? {
            PropertyValue::Scalar(v) => Ok(v),
            other => Err(shape_error(property, "a scalar", &other)),
        }
    }

    pub fn reference(&self, entity: EntityRef, property: &str) -> Result<Option<EntityRef>> {
        match self.property(entity, property)? {
            PropertyValue::Reference(r) => Ok(r),
            other => Err(shape_error(property, "a reference", &other)),
        }
    }

    /// Elements of a collection property; empty for an uninitialized collection.
    pub fn collection(&self, entity: EntityRef, property: &str) -> Result<Vec<EntityRef>> {
        match self.property(entity, property)? {
            PropertyValue::Collection(c) => Ok(c.elements),
            other => Err(shape_error(property, "a collection", &other)),
        }
    }

    pub fn identifier(&self, entity: EntityRef) -> Result<Value> {
        self.persister_for(None, entity)?
            .get_identifier(&self.store, entity)
    }

    pub fn set_identifier(&mut self, entity: EntityRef, id: impl Into<Value>) -> Result<()> {
        self.persister_for(None, entity)?
            .set_identifier(&mut self.store, entity, id.into())
    }

    /// Version of `entity`; `Value::Null` for unversioned entities.
    pub fn version(&self, entity: EntityRef) -> Result<Value> {
        Ok(self
            .persister_for(None, entity)?
            .get_version(&self.store, entity)?
            .unwrap_or(Value::Null))
    }

    pub fn set_version(&mut self, entity: EntityRef, version: impl Into<Value>) -> Result<()> {
        self.persister_for(None, entity)?
            .set_version(&mut self.store, entity, version.into())
    }

    /// Make `entity` record the names of the properties set on it.
    pub fn enable_dirty_tracking(&mut self, entity: EntityRef) -> Result<()> {
        let data = self.store.instance_mut(entity)?;
        if data.dirty_tracker.is_none() {
            data.dirty_tracker = Some(DirtyTracker::new());
        }
        Ok(())
    }

    /// Recorded dirty attributes, sorted. Empty without a tracker.
    pub fn dirty_attributes(&self, entity: EntityRef) -> Result<Vec<String>> {
        Ok(self
            .store
            .instance(entity)?
            .dirty_tracker
            .as_ref()
            .map(|t| t.attributes().map(str::to_string).collect())
            .unwrap_or_default())
    }

    // ========================================================================
    // Persistence Context
    // ========================================================================

    /// Whether `entity` is managed by this session.
    pub fn contains(&self, entity: EntityRef) -> bool {
        self.store
            .unproxy(entity)
            .is_ok_and(|e| self.persistence_context.is_managed(e))
    }

    pub fn entry(&self, entity: EntityRef) -> Option<&EntityEntry> {
        let entity = self.store.unproxy(entity).ok()?;
        self.persistence_context.get_entry(entity)
    }

    pub fn entity_name(&self, entity: EntityRef) -> Result<&'static str> {
        self.store.entity_name(entity)
    }

    /// Forget every managed instance and queued action. Instances stay in
    /// the store, detached, and handles held by the caller stay usable.
    pub fn clear(&mut self) {
        tracing::debug!(managed = self.persistence_context.len(), "Clearing session");
        self.persistence_context.clear();
        self.change_tracker.clear_all();
        self.action_queue.clear();
        self.merge_context.clear();
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Get an instance by identifier.
    ///
    /// Served from the persistence context when possible, otherwise fetched
    /// through the datastore with the active internal fetch profile. When a
    /// proxy for the row exists it is initialized and returned instead of
    /// the instance. `None` when there is no row or the instance is deleted.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        let persister = self.registry.persister(entity_name)?;
        let key = persister.entity_key(id.into());
        let Some(instance) = self.get_instance(&key)? else {
            return Ok(None);
        };
        if let Some(proxy) = self.persistence_context.get_proxy(&key) {
            if let Some(p) = self.store.proxy_mut(proxy) {
                p.target = Some(instance);
            }
            return Ok(Some(proxy));
        }
        Ok(Some(instance))
    }

    fn get_instance(&mut self, key: &EntityKey) -> Result<Option<EntityRef>> {
        if let Some(existing) = self.persistence_context.get_entity(key) {
            if self
                .persistence_context
                .get_entry(existing)
                .is_some_and(EntityEntry::is_deleted)
            {
                tracing::trace!(key = %key, "Object was already deleted");
                return Ok(None);
            }
            tracing::trace!(key = %key, "Resolved object in persistence context");
            return Ok(Some(existing));
        }

        if self.config.auto_flush && self.persistence_context.cascade_level() == 0 {
            self.flush()?;
        }

        self.statistics.entity_fetch();
        let Some(row) = self.datastore.fetch(key, self.internal_fetch_profile)? else {
            tracing::trace!(key = %key, "No row found");
            return Ok(None);
        };
        self.hydrate(key, row).map(Some)
    }

    /// Build the managed instance for a fetched row.
    fn hydrate(&mut self, key: &EntityKey, row: Row) -> Result<EntityRef> {
        let persister = self.registry.persister(row.entity_name)?;
        if row.values.len() != persister.properties().len() {
            return Err(Error::mapping(
                MappingErrorKind::ValueShape,
                format!(
                    "row {key} has {} values, entity {} maps {} properties",
                    row.values.len(),
                    persister.entity_name(),
                    persister.properties().len()
                ),
            ));
        }

        let mut data = persister.instantiate(row.identifier.clone());
        data.version = row.version.clone();
        let entity = self.store.insert(data);
        // Registered before references resolve, so a cycle finds this instance.
        self.persistence_context.add_entry(
            entity,
            EntityEntry {
                entity_name: persister.entity_name(),
                key: key.clone(),
                status: EntryStatus::Managed,
                exists_in_database: true,
                version: row.version.clone(),
            },
        );

        let mut values = Vec::with_capacity(row.values.len());
        for (property, stored) in persister.properties().iter().zip(&row.values) {
            values.push(self.hydrate_value(property, stored)?);
        }
        persister.set_property_values(&mut self.store, entity, values)?;

        if let Some(proxy) = self.persistence_context.get_proxy(key) {
            if let Some(p) = self.store.proxy_mut(proxy) {
                p.target = Some(entity);
            }
        }
        self.change_tracker.snapshot(entity, row.values);
        self.statistics.entity_load();
        tracing::debug!(entity = %self.store.info_string(entity), "Loaded instance");
        Ok(entity)
    }

    fn hydrate_value(&mut self, property: &PropertyMetadata, stored: &StoredValue) -> Result<PropertyValue> {
        let target = || {
            property.kind.target().ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::ValueShape,
                    format!("stored association value for non-association {}", property.name),
                )
            })
        };
        Ok(match stored {
            StoredValue::Scalar(v) => PropertyValue::Scalar(v.clone()),
            StoredValue::Component(v) => PropertyValue::Component(v.clone()),
            StoredValue::Reference(None) => PropertyValue::Reference(None),
            StoredValue::Reference(Some(id)) => {
                PropertyValue::Reference(Some(self.load(target()?, id.clone())?))
            }
            StoredValue::References(ids) => {
                let target = target()?;
                let mut elements = Vec::with_capacity(ids.len());
                for id in ids {
                    elements.push(self.load(target, id.clone())?);
                }
                PropertyValue::Collection(CollectionValue::of(elements))
            }
        })
    }

    /// A reference to an instance without touching the datastore: an
    /// existing proxy, the managed instance, or a new uninitialized proxy.
    pub fn load(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let persister = self.registry.persister(entity_name)?;
        let id = id.into().into_identifier();
        let key = persister.entity_key(id.clone());
        if let Some(proxy) = self.persistence_context.get_proxy(&key) {
            return Ok(proxy);
        }
        if let Some(existing) = self.persistence_context.get_entity(&key) {
            return Ok(existing);
        }
        let proxy = self.store.insert_proxy(LazyProxy {
            entity_name: persister.entity_name(),
            identifier: id,
            target: None,
        });
        tracing::trace!(key = %key, proxy = %proxy, "Creating proxy");
        self.persistence_context.add_proxy(key, proxy);
        Ok(proxy)
    }

    /// Fetch and bind the target of a proxy. Plain instances map to themselves.
    pub fn initialize_proxy(&mut self, proxy: EntityRef) -> Result<EntityRef> {
        let Some(p) = self.store.proxy(proxy) else {
            return Ok(proxy);
        };
        if let Some(target) = p.target {
            return Ok(target);
        }
        let (entity_name, id) = (p.entity_name, p.identifier.clone());
        let key = self.registry.persister(entity_name)?.entity_key(id);
        let target = self.get_instance(&key)?.ok_or_else(|| {
            Error::persistence(
                PersistenceErrorKind::ProxyInitialization,
                format!("No row with the given identifier exists: {key}"),
            )
        })?;
        if let Some(p) = self.store.proxy_mut(proxy) {
            p.target = Some(target);
        }
        Ok(target)
    }

    // ========================================================================
    // Saving And Deleting
    // ========================================================================

    /// Make `entity` managed under a new identifier and queue its insert.
    ///
    /// Generated identifiers are drawn from the datastore; assigned ones must
    /// already be set on the instance.
    pub fn save_with_generated_id(&mut self, entity: EntityRef) -> Result<Value> {
        let entity = self.store.unproxy(entity)?;
        let persister = self.persister_for(None, entity)?;
        let id = match persister.metadata().identifier.generation {
            IdGeneration::Generated => self
                .datastore
                .generate_identifier(persister.root_entity_name())?,
            IdGeneration::Assigned => {
                let id = persister.get_identifier(&self.store, entity)?;
                if id.is_null() {
                    return Err(Error::IdentifierGeneration(IdentifierGenerationError {
                        entity_name: persister.entity_name().to_string(),
                        message: "ids for this class must be manually assigned before calling save()"
                            .to_string(),
                    }));
                }
                id
            }
        };
        self.perform_save(persister.as_ref(), entity, id)
    }

    /// Make `entity` managed under `id` and queue its insert.
    pub fn save_with_requested_id(&mut self, entity: EntityRef, id: impl Into<Value>) -> Result<Value> {
        let entity = self.store.unproxy(entity)?;
        let persister = self.persister_for(None, entity)?;
        self.perform_save(persister.as_ref(), entity, id.into())
    }

    fn perform_save(
        &mut self,
        persister: &dyn EntityPersister,
        entity: EntityRef,
        id: Value,
    ) -> Result<Value> {
        let id = id.into_identifier();
        let key = persister.entity_key(id.clone());
        if let Some(existing) = self.persistence_context.get_entity(&key) {
            if existing != entity {
                return Err(MergeError::new(
                    MergeErrorKind::NonUniqueObject,
                    "A different object with the same identifier value was already associated with the session",
                )
                .with_entity(persister.entity_name(), Some(id))
                .into());
            }
            tracing::trace!(key = %key, "Instance already managed");
            return Ok(id);
        }

        persister.set_identifier(&mut self.store, entity, id.clone())?;
        let mut version = persister
            .get_version(&self.store, entity)?
            .unwrap_or(Value::Null);
        if persister.is_versioned() && (version.is_null() || version.is_negative()) {
            version = Value::BigInt(0);
            persister.set_version(&mut self.store, entity, version.clone())?;
        }

        tracing::debug!(entity = %self.store.info_string(entity), "Saving instance");
        self.persistence_context.add_entry(
            entity,
            EntityEntry {
                entity_name: persister.entity_name(),
                key: key.clone(),
                status: EntryStatus::Managed,
                exists_in_database: false,
                version,
            },
        );
        self.action_queue.add_insert(EntityInsertAction {
            entity,
            entity_name: persister.entity_name(),
            key,
        });
        Ok(id)
    }

    /// Schedule a managed instance for deletion, cascading to associations
    /// mapped with `delete`. An instance saved in this session and not yet
    /// flushed is simply never inserted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, entity: EntityRef) -> Result<()> {
        let entity = if self.store.is_uninitialized_proxy(entity) {
            self.initialize_proxy(entity)?
        } else {
            self.store.unproxy(entity)?
        };
        let Some(entry) = self.persistence_context.get_entry(entity) else {
            return Err(Error::persistence(
                PersistenceErrorKind::NotManaged,
                format!(
                    "Instance is not managed by this session: {}",
                    self.store.info_string(entity)
                ),
            ));
        };
        if entry.is_deleted() {
            tracing::trace!(entity = %self.store.info_string(entity), "Object was already deleted");
            return Ok(());
        }
        let persister = self.registry.persister(entry.entity_name)?;

        self.cascade(
            &DeleteCascade,
            CascadePoint::AfterInsertBeforeDelete,
            persister.as_ref(),
            entity,
        )?;

        let Some(entry) = self.persistence_context.get_entry_mut(entity) else {
            return Ok(());
        };
        if entry.is_deleted() {
            return Ok(());
        }
        entry.status = EntryStatus::Deleted;
        let (exists_in_database, key) = (entry.exists_in_database, entry.key.clone());
        if exists_in_database {
            self.action_queue.add_delete(EntityDeleteAction {
                entity,
                entity_name: persister.entity_name(),
                key,
            });
        } else {
            self.action_queue.remove_insert(entity);
        }
        tracing::debug!(entity = %self.store.info_string(entity), "Deleting instance");

        self.cascade(
            &DeleteCascade,
            CascadePoint::BeforeInsertAfterDelete,
            persister.as_ref(),
            entity,
        )
    }
}

fn shape_error(property: &str, expected: &str, actual: &PropertyValue) -> Error {
    let actual = match actual {
        PropertyValue::Scalar(_) => "a scalar",
        PropertyValue::Component(_) => "a component",
        PropertyValue::Reference(_) => "a reference",
        PropertyValue::Collection(_) => "a collection",
    };
    Error::mapping(
        MappingErrorKind::ValueShape,
        format!("property {property} holds {actual}, not {expected}"),
    )
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_session, seed_item};

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.entity_copy_observer, EntityCopyObserverKind::Disallow);
        assert!(!config.statistics_enabled);
        assert!(!config.auto_flush);
    }

    #[test]
    fn test_session_config_from_json() {
        let config = SessionConfig::from_json(r#"{"entity_copy_observer": "log"}"#).unwrap();
        assert_eq!(config.entity_copy_observer, EntityCopyObserverKind::Log);
        assert!(!config.auto_flush);

        let err = SessionConfig::from_json(r#"{"entity_copy_observer": "maybe"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_session_config_from_settings() {
        let mut settings = HashMap::new();
        settings.insert(ENTITY_COPY_OBSERVER_SETTING.to_string(), "allow".to_string());
        settings.insert(STATISTICS_ENABLED_SETTING.to_string(), "true".to_string());
        let config = SessionConfig::from_settings(&settings).unwrap();
        assert_eq!(config.entity_copy_observer, EntityCopyObserverKind::Allow);
        assert!(config.statistics_enabled);

        settings.insert(AUTO_FLUSH_SETTING.to_string(), "sometimes".to_string());
        assert!(SessionConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_get_uses_identity_map() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");

        let first = session.get("Item", 1_i64).unwrap().unwrap();
        let second = session.get("Item", 1_i64).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(session.datastore().counters().fetches, 1);
        assert_eq!(session.statistics().entity_loads, 1);
        assert!(session.get("Item", 2_i64).unwrap().is_none());
    }

    #[test]
    fn test_integer_identifier_width_does_not_matter() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");

        let item = session.get("Item", 1).unwrap().unwrap();
        assert_eq!(session.identifier(item).unwrap(), Value::BigInt(1));
        assert_eq!(session.get("Item", 1_i64).unwrap(), Some(item));
        assert_eq!(session.load("Item", 1).unwrap(), item);

        let fresh = session.instantiate_with_id("Item", 9).unwrap();
        assert_eq!(session.identifier(fresh).unwrap(), Value::BigInt(9));
        assert_eq!(session.datastore().counters().fetches, 1);
    }

    #[test]
    fn test_get_hydrates_references_as_proxies() {
        let mut session = test_session();
        session.datastore_mut().seed(
            "Item",
            Row {
                entity_name: "Item",
                identifier: Value::BigInt(1),
                version: Value::BigInt(1),
                values: vec![
                    StoredValue::Scalar(Value::from("lamp")),
                    StoredValue::Reference(Some(Value::BigInt(7))),
                    StoredValue::References(vec![Value::BigInt(3), Value::BigInt(4)]),
                ],
            },
        );

        let item = session.get("Item", 1_i64).unwrap().unwrap();
        let category = session.reference(item, "category").unwrap().unwrap();
        assert!(session.store().is_uninitialized_proxy(category));
        assert_eq!(session.load("Category", 7_i64).unwrap(), category);
        assert_eq!(session.collection(item, "bids").unwrap().len(), 2);
        assert_eq!(session.datastore().counters().fetches, 1);
    }

    #[test]
    fn test_get_initializes_existing_proxy() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");
        let proxy = session.load("Item", 1_i64).unwrap();
        assert!(session.store().is_uninitialized_proxy(proxy));

        let got = session.get("Item", 1_i64).unwrap().unwrap();
        assert_eq!(got, proxy);
        assert!(!session.store().is_uninitialized_proxy(proxy));
        assert_eq!(session.scalar(proxy, "name").unwrap(), Value::from("lamp"));
    }

    #[test]
    fn test_initialize_proxy_without_row_fails() {
        let mut session = test_session();
        let proxy = session.load("Item", 5_i64).unwrap();
        let err = session.initialize_proxy(proxy).unwrap_err();
        assert!(matches!(
            err,
            Error::Persistence(ref p) if p.kind == PersistenceErrorKind::ProxyInitialization
        ));
    }

    #[test]
    fn test_save_assigns_identifier_and_seeds_version() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let id = session.save_with_generated_id(item).unwrap();

        assert_eq!(id, Value::BigInt(1));
        assert_eq!(session.version(item).unwrap(), Value::BigInt(0));
        let entry = session.entry(item).unwrap();
        assert!(!entry.exists_in_database);
        assert_eq!(entry.status, EntryStatus::Managed);
    }

    #[test]
    fn test_save_assigned_identifier_required() {
        let mut session = test_session();
        let tag = session.instantiate("Tag").unwrap();
        let err = session.save_with_generated_id(tag).unwrap_err();
        assert!(matches!(err, Error::IdentifierGeneration(_)));

        session.set_identifier(tag, "rust").unwrap();
        assert_eq!(session.save_with_generated_id(tag).unwrap(), Value::from("rust"));
    }

    #[test]
    fn test_save_rejects_second_instance_under_key() {
        let mut session = test_session();
        let first = session.instantiate("Item").unwrap();
        let second = session.instantiate("Item").unwrap();
        session.save_with_requested_id(first, 10_i64).unwrap();

        let err = session.save_with_requested_id(second, 10_i64).unwrap_err();
        assert_eq!(err.merge_kind(), Some(MergeErrorKind::NonUniqueObject));
    }

    #[test]
    fn test_delete_unflushed_instance_drops_insert() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        session.save_with_generated_id(item).unwrap();
        session.delete(item).unwrap();

        let counts = session.pending_counts().unwrap();
        assert_eq!(counts.new, 0);
        assert_eq!(counts.deleted, 0);
        assert_eq!(session.flush().unwrap().total(), 0);
        assert!(!session.contains(item));
    }

    #[test]
    fn test_delete_cascades_to_collection() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let bid = session.instantiate("Bid").unwrap();
        session.save_with_generated_id(item).unwrap();
        session.save_with_generated_id(bid).unwrap();
        session.set_collection(item, "bids", [bid]).unwrap();
        session.flush().unwrap();

        session.delete(item).unwrap();
        assert_eq!(session.pending_counts().unwrap().deleted, 2);
        assert_eq!(session.flush().unwrap().deleted, 2);
    }

    #[test]
    fn test_delete_unmanaged_fails() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        let err = session.delete(item).unwrap_err();
        assert!(matches!(
            err,
            Error::Persistence(ref p) if p.kind == PersistenceErrorKind::NotManaged
        ));
    }

    #[test]
    fn test_auto_flush_before_get() {
        let mut session = Session::with_config(
            ormerge_core::InMemoryDatastore::new(),
            crate::testing::registry(),
            SessionConfig::new().auto_flush(true),
        );
        let item = session.instantiate("Item").unwrap();
        session.save_with_generated_id(item).unwrap();

        assert!(session.get("Item", 99_i64).unwrap().is_none());
        assert!(session.datastore().contains("Item", 1_i64));
    }

    #[test]
    fn test_property_accessors_check_shape() {
        let mut session = test_session();
        let item = session.instantiate("Item").unwrap();
        assert!(session.reference(item, "name").is_err());
        assert!(matches!(
            session.set_scalar(item, "colour", "red"),
            Err(Error::Mapping(ref m)) if m.kind == MappingErrorKind::UnknownProperty
        ));
        assert!(matches!(
            session.set_scalar(item, "category", "red"),
            Err(Error::Mapping(ref m)) if m.kind == MappingErrorKind::ValueShape
        ));
    }

    #[test]
    fn test_clear_detaches_everything() {
        let mut session = test_session();
        seed_item(&mut session, 1, 1, "lamp");
        let item = session.get("Item", 1_i64).unwrap().unwrap();
        session.clear();
        assert!(!session.contains(item));
        assert!(session.persistence_context().is_empty());

        // The cleared instance is now detached but still readable.
        assert_eq!(session.scalar(item, "name").unwrap(), Value::from("lamp"));
        let again = session.get("Item", 1_i64).unwrap().unwrap();
        assert_ne!(again, item);
        assert_eq!(session.store().len(), 2);
    }
}
