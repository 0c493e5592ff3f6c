//! ormerge - merge detached and transient object graphs into a live unit of work.
//!
//! ormerge provides:
//!
//! - Mapping metadata for entities, associations and cascade styles
//! - An entity arena addressed by copyable handles, with lazy proxies
//! - A session that classifies instances, merges them, and flushes changes
//! - Pluggable policies for several copies of one row within a merge
//!
//! # Quick Start
//!
//! ```ignore
//! use ormerge::prelude::*;
//!
//! let registry = PersisterRegistry::new()
//!     .with(
//!         EntityMetadata::new("Customer", IdentifierMetadata::generated("id"))
//!             .versioned(VersionMetadata::new("version"))
//!             .property(PropertyMetadata::basic("name"))
//!             .property(
//!                 PropertyMetadata::one_to_many("orders", "Order")
//!                     .cascade(CascadeStyle::parse("merge, delete")?),
//!             ),
//!     )?
//!     .with(
//!         EntityMetadata::new("Order", IdentifierMetadata::generated("id"))
//!             .property(PropertyMetadata::basic("total"))
//!             .property(PropertyMetadata::many_to_one("customer", "Customer")),
//!     )?;
//!
//! let mut session = Session::new(InMemoryDatastore::new(), Arc::new(registry));
//!
//! // A new customer with one order, built outside the session
//! let customer = session.instantiate("Customer")?;
//! let order = session.instantiate("Order")?;
//! session.set_scalar(customer, "name", "Ada")?;
//! session.set_reference(order, "customer", Some(customer))?;
//! session.set_collection(customer, "orders", [order])?;
//!
//! // Merge returns the managed copies; the originals stay untouched
//! let managed = session.merge(customer)?;
//! session.flush()?;
//! ```
//!
//! # Features
//!
//! - **Cycle safe**: every visited instance is bound before cascading from it
//! - **Optimistic locking**: stale detached versions are rejected on merge and flush
//! - **Configurable copy policy**: `disallow`, `allow` or `log`, or a custom observer
//! - **Storage agnostic**: sessions run over any [`Datastore`]

pub use ormerge_core::{
    CascadeKind, CascadePoint, CascadeStyle, CollectionValue, ConfigError, Datastore,
    DatastoreCounters, DatastoreError, DirtyTracker, EntityData, EntityKey, EntityMetadata,
    EntityPersister, EntityRef, EntityStore, Error, ForeignKeyDirection, IdGeneration,
    IdentifierGenerationError, IdentifierMetadata, InMemoryDatastore, LazyProxy, MappingError,
    MappingErrorKind, MergeError, MergeErrorKind, PersistenceError, PersistenceErrorKind,
    PersisterRegistry, PropertyKind, PropertyMetadata, PropertyValue, Result, Row, Slot,
    StandardPersister, StoredValue, UnsavedValue, Value, VersionMetadata,
};

pub use ormerge_session::{
    ActionQueue, AUTO_FLUSH_SETTING, CascadingAction, ChangeTracker, DeleteCascade,
    ENTITY_COPY_OBSERVER_SETTING, EntityCopyAllowedObserver, EntityCopyLoggedObserver,
    EntityCopyNotAllowedObserver, EntityCopyObserver, EntityCopyObserverFactory,
    EntityCopyObserverKind, EntityCopySummary, EntityDeleteAction, EntityEntry,
    EntityInsertAction, EntityState, EntryStatus, FlushResult, Interceptor, MERGE_FETCH_PROFILE,
    MergeCascade, MergeContext, MergeEntry, MergeEvent, ObjectSnapshot, PendingCounts,
    PersistenceContext, STATISTICS_ENABLED_SETTING, Session, SessionConfig, SessionStats,
    Statistics,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ormerge::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::{
        // Mapping
        CascadeKind,
        CascadeStyle,
        EntityMetadata,
        // Arena
        EntityRef,
        // Session
        EntityCopyObserverKind,
        EntityState,
        Error,
        IdentifierMetadata,
        InMemoryDatastore,
        PersisterRegistry,
        PropertyMetadata,
        PropertyValue,
        Result,
        Session,
        SessionConfig,
        Value,
        VersionMetadata,
    };
}
