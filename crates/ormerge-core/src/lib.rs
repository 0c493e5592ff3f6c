//! Core types for ormerge.
//!
//! This crate provides the building blocks the unit of work operates on:
//!
//! - `Value` for identifiers, versions and scalar properties
//! - `EntityMetadata` describing identifiers, versions, associations and cascades
//! - `EntityStore` arena addressed by `EntityRef` handles
//! - `EntityPersister` and the `PersisterRegistry`
//! - `Datastore` trait for the storage collaborator, with an in-memory implementation

pub mod datastore;
pub mod error;
pub mod metadata;
pub mod persister;
pub mod store;
pub mod value;

pub use datastore::{Datastore, DatastoreCounters, InMemoryDatastore, Row, StoredValue};
pub use error::{
    ConfigError, DatastoreError, Error, IdentifierGenerationError, MappingError, MappingErrorKind,
    MergeError, MergeErrorKind, PersistenceError, PersistenceErrorKind, Result,
};
pub use metadata::{
    CascadeKind, CascadePoint, CascadeStyle, EntityMetadata, ForeignKeyDirection, IdGeneration,
    IdentifierMetadata, PropertyKind, PropertyMetadata, UnsavedValue, VersionMetadata,
};
pub use persister::{EntityKey, EntityPersister, PersisterRegistry, StandardPersister};
pub use store::{
    CollectionValue, DirtyTracker, EntityData, EntityRef, EntityStore, LazyProxy, PropertyValue,
    Slot,
};
pub use value::Value;
