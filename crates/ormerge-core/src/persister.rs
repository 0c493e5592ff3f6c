//! Per-entity persisters and the registry that owns them.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, MappingErrorKind, Result};
use crate::metadata::{EntityMetadata, PropertyKind, PropertyMetadata};
use crate::store::{CollectionValue, EntityData, EntityRef, EntityStore, PropertyValue};
use crate::value::Value;

/// Unique key for a persistent row: root entity name plus identifier.
///
/// Subtypes sharing an inheritance root share an identifier space, so the
/// key is built from the root name.
#[derive(Debug, Clone)]
pub struct EntityKey {
    root_name: &'static str,
    identifier: Value,
    id_hash: u64,
}

impl EntityKey {
    pub fn new(root_name: &'static str, identifier: Value) -> Self {
        let identifier = identifier.into_identifier();
        let mut hasher = DefaultHasher::new();
        identifier.hash_into(&mut hasher);
        Self {
            root_name,
            identifier,
            id_hash: hasher.finish(),
        }
    }

    pub fn root_name(&self) -> &'static str {
        self.root_name
    }

    pub fn identifier(&self) -> &Value {
        &self.identifier
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.id_hash == other.id_hash
            && self.root_name == other.root_name
            && self.identifier == other.identifier
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root_name.hash(state);
        self.id_hash.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey[{}#{}]", self.root_name, self.identifier)
    }
}

/// Access to the mapped state of instances of one entity.
///
/// Persisters own no instances; every accessor works on an [`EntityStore`].
pub trait EntityPersister: fmt::Debug + Send + Sync {
    fn metadata(&self) -> &EntityMetadata;

    fn entity_name(&self) -> &'static str {
        self.metadata().name
    }

    fn root_entity_name(&self) -> &'static str {
        self.metadata().root_name
    }

    fn properties(&self) -> &[PropertyMetadata] {
        &self.metadata().properties
    }

    fn has_identifier_property(&self) -> bool;

    fn is_versioned(&self) -> bool {
        self.metadata().version.is_some()
    }

    fn get_identifier(&self, store: &EntityStore, entity: EntityRef) -> Result<Value>;

    fn set_identifier(&self, store: &mut EntityStore, entity: EntityRef, id: Value) -> Result<()>;

    /// `None` for unversioned entities.
    fn get_version(&self, store: &EntityStore, entity: EntityRef) -> Result<Option<Value>>;

    fn set_version(&self, store: &mut EntityStore, entity: EntityRef, version: Value)
    -> Result<()>;

    /// Version equality as defined by the version type. Integer versions
    /// compare by value regardless of width.
    fn is_version_same(&self, a: &Value, b: &Value) -> bool {
        a.clone().into_identifier() == b.clone().into_identifier()
    }

    fn get_property_values(
        &self,
        store: &EntityStore,
        entity: EntityRef,
    ) -> Result<Vec<PropertyValue>>;

    fn set_property_values(
        &self,
        store: &mut EntityStore,
        entity: EntityRef,
        values: Vec<PropertyValue>,
    ) -> Result<()>;

    /// A fresh instance with default property values.
    fn instantiate(&self, id: Value) -> EntityData;

    /// Unsaved-value test: `Some(true)` transient, `Some(false)` saved,
    /// `None` when identifier and version strategies cannot tell.
    fn is_transient(&self, store: &EntityStore, entity: EntityRef) -> Result<Option<bool>>;

    fn entity_key(&self, id: Value) -> EntityKey {
        EntityKey::new(self.root_entity_name(), id)
    }
}

/// Metadata-driven persister used for every mapped entity.
#[derive(Debug, Clone)]
pub struct StandardPersister {
    metadata: EntityMetadata,
}

impl StandardPersister {
    pub fn new(metadata: EntityMetadata) -> Self {
        Self { metadata }
    }

    fn default_value(property: &PropertyMetadata) -> PropertyValue {
        match property.kind {
            PropertyKind::Basic => PropertyValue::Scalar(Value::Null),
            PropertyKind::Component => PropertyValue::Component(Vec::new()),
            PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. } => {
                PropertyValue::Reference(None)
            }
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. } => {
                PropertyValue::Collection(CollectionValue::of([]))
            }
        }
    }

    fn check_shape(&self, values: &[PropertyValue]) -> Result<()> {
        if values.len() != self.metadata.properties.len() {
            return Err(Error::mapping(
                MappingErrorKind::ValueShape,
                format!(
                    "'{}' maps {} properties, got {} values",
                    self.metadata.name,
                    self.metadata.properties.len(),
                    values.len()
                ),
            ));
        }
        for (property, value) in self.metadata.properties.iter().zip(values) {
            let fits = matches!(
                (property.kind, value),
                (PropertyKind::Basic, PropertyValue::Scalar(_))
                    | (PropertyKind::Component, PropertyValue::Component(_))
                    | (
                        PropertyKind::ManyToOne { .. } | PropertyKind::OneToOne { .. },
                        PropertyValue::Reference(_)
                    )
                    | (
                        PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. },
                        PropertyValue::Collection(_)
                    )
            );
            if !fits {
                return Err(Error::mapping(
                    MappingErrorKind::ValueShape,
                    format!(
                        "value for '{}.{}' does not match its mapping",
                        self.metadata.name, property.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl EntityPersister for StandardPersister {
    fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    fn has_identifier_property(&self) -> bool {
        true
    }

    fn get_identifier(&self, store: &EntityStore, entity: EntityRef) -> Result<Value> {
        Ok(store.instance(entity)?.identifier.clone())
    }

    fn set_identifier(&self, store: &mut EntityStore, entity: EntityRef, id: Value) -> Result<()> {
        store.instance_mut(entity)?.identifier = id.into_identifier();
        Ok(())
    }

    fn get_version(&self, store: &EntityStore, entity: EntityRef) -> Result<Option<Value>> {
        if !self.is_versioned() {
            return Ok(None);
        }
        Ok(Some(store.instance(entity)?.version.clone()))
    }

    fn set_version(
        &self,
        store: &mut EntityStore,
        entity: EntityRef,
        version: Value,
    ) -> Result<()> {
        if self.is_versioned() {
            store.instance_mut(entity)?.version = version;
        }
        Ok(())
    }

    fn get_property_values(
        &self,
        store: &EntityStore,
        entity: EntityRef,
    ) -> Result<Vec<PropertyValue>> {
        let values = store.instance(entity)?.values.clone();
        self.check_shape(&values)?;
        Ok(values)
    }

    fn set_property_values(
        &self,
        store: &mut EntityStore,
        entity: EntityRef,
        values: Vec<PropertyValue>,
    ) -> Result<()> {
        self.check_shape(&values)?;
        store.instance_mut(entity)?.values = values;
        Ok(())
    }

    fn instantiate(&self, id: Value) -> EntityData {
        let mut data = EntityData::new(
            self.metadata.name,
            self.metadata
                .properties
                .iter()
                .map(Self::default_value)
                .collect(),
        );
        data.identifier = id.into_identifier();
        data
    }

    fn is_transient(&self, store: &EntityStore, entity: EntityRef) -> Result<Option<bool>> {
        let data = store.instance(entity)?;
        if data.identifier.is_null() {
            return Ok(Some(true));
        }
        if let Some(version) = &self.metadata.version {
            if let Some(unsaved) = version.unsaved_value.is_unsaved(&data.version) {
                return Ok(Some(unsaved));
            }
        }
        Ok(self
            .metadata
            .identifier
            .unsaved_value
            .is_unsaved(&data.identifier))
    }
}

/// All persisters of a mapping, keyed by entity name.
#[derive(Debug, Default)]
pub struct PersisterRegistry {
    persisters: HashMap<&'static str, Arc<dyn EntityPersister>>,
}

impl PersisterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metadata-driven persister after validating its metadata.
    pub fn register(&mut self, metadata: EntityMetadata) -> Result<()> {
        metadata.validate()?;
        self.register_persister(Arc::new(StandardPersister::new(metadata)))
    }

    pub fn register_persister(&mut self, persister: Arc<dyn EntityPersister>) -> Result<()> {
        let name = persister.entity_name();
        if self.persisters.contains_key(name) {
            return Err(Error::mapping(
                MappingErrorKind::Invalid,
                format!("entity '{name}' is already registered"),
            ));
        }
        tracing::debug!(entity = name, root = persister.root_entity_name(), "Registered persister");
        self.persisters.insert(name, persister);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, metadata: EntityMetadata) -> Result<Self> {
        self.register(metadata)?;
        Ok(self)
    }

    pub fn persister(&self, entity_name: &str) -> Result<Arc<dyn EntityPersister>> {
        self.persisters.get(entity_name).cloned().ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                format!("no persister for entity '{entity_name}'"),
            )
        })
    }

    pub fn contains(&self, entity_name: &str) -> bool {
        self.persisters.contains_key(entity_name)
    }

    pub fn len(&self) -> usize {
        self.persisters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persisters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{IdentifierMetadata, UnsavedValue, VersionMetadata};

    fn item_metadata() -> EntityMetadata {
        EntityMetadata::new("Item", IdentifierMetadata::generated("id"))
            .versioned(VersionMetadata::new("version"))
            .property(PropertyMetadata::basic("name"))
            .property(PropertyMetadata::many_to_one("category", "Category"))
            .property(PropertyMetadata::one_to_many("bids", "Bid"))
    }

    #[test]
    fn test_entity_key_equality() {
        let a = EntityKey::new("Item", Value::BigInt(1));
        let b = EntityKey::new("Item", Value::BigInt(1));
        let c = EntityKey::new("Item", Value::Int(1));
        let d = EntityKey::new("Bid", Value::BigInt(1));
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(c.identifier(), &Value::BigInt(1));
        assert_ne!(a, d);

        let mut map = HashMap::new();
        map.insert(a, "first");
        assert_eq!(map.get(&b), Some(&"first"));
    }

    #[test]
    fn test_integer_versions_compare_by_value() {
        let persister = StandardPersister::new(item_metadata());
        assert!(persister.is_version_same(&Value::Int(3), &Value::BigInt(3)));
        assert!(!persister.is_version_same(&Value::Int(3), &Value::BigInt(4)));
        assert!(!persister.is_version_same(&Value::from("3"), &Value::BigInt(3)));

        let mut store = EntityStore::new();
        let item = store.insert(persister.instantiate(Value::Null));
        persister.set_identifier(&mut store, item, Value::Int(8)).unwrap();
        assert_eq!(persister.get_identifier(&store, item).unwrap(), Value::BigInt(8));
    }

    #[test]
    fn test_instantiate_defaults() {
        let persister = StandardPersister::new(item_metadata());
        let data = persister.instantiate(Value::BigInt(4));
        assert_eq!(data.identifier, Value::BigInt(4));
        assert_eq!(
            data.values,
            vec![
                PropertyValue::Scalar(Value::Null),
                PropertyValue::Reference(None),
                PropertyValue::Collection(CollectionValue::of([])),
            ]
        );
    }

    #[test]
    fn test_is_transient_rules() {
        let persister = StandardPersister::new(item_metadata());
        let mut store = EntityStore::new();

        let fresh = store.insert(persister.instantiate(Value::Null));
        assert_eq!(persister.is_transient(&store, fresh).unwrap(), Some(true));

        // id set, version null: the version strategy decides
        let unversioned = store.insert(persister.instantiate(Value::BigInt(2)));
        assert_eq!(persister.is_transient(&store, unversioned).unwrap(), Some(true));

        let saved = store.insert(persister.instantiate(Value::BigInt(3)));
        persister
            .set_version(&mut store, saved, Value::BigInt(1))
            .unwrap();
        assert_eq!(persister.is_transient(&store, saved).unwrap(), Some(false));
    }

    #[test]
    fn test_assigned_identifier_is_undecided() {
        let persister = StandardPersister::new(EntityMetadata::new(
            "Country",
            IdentifierMetadata::assigned("code"),
        ));
        let mut store = EntityStore::new();
        let e = store.insert(persister.instantiate(Value::from("NO")));
        assert_eq!(persister.is_transient(&store, e).unwrap(), None);

        let explicit = StandardPersister::new(EntityMetadata::new(
            "Country",
            IdentifierMetadata::assigned("code").unsaved_value(UnsavedValue::Value(Value::from("??"))),
        ));
        assert_eq!(explicit.is_transient(&store, e).unwrap(), Some(false));
    }

    #[test]
    fn test_set_property_values_checks_shape() {
        let persister = StandardPersister::new(item_metadata());
        let mut store = EntityStore::new();
        let e = store.insert(persister.instantiate(Value::Null));
        let err = persister
            .set_property_values(&mut store, e, vec![PropertyValue::Scalar(Value::Null)])
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));

        let err = persister
            .set_property_values(
                &mut store,
                e,
                vec![
                    PropertyValue::Reference(None),
                    PropertyValue::Reference(None),
                    PropertyValue::Collection(CollectionValue::of([])),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PersisterRegistry::new().with(item_metadata()).unwrap();
        assert!(registry.contains("Item"));
        assert_eq!(registry.persister("Item").unwrap().entity_name(), "Item");
        assert!(registry.persister("Ghost").unwrap_err().is_unknown_entity());

        let mut registry = registry;
        assert!(registry.register(item_metadata()).is_err());
    }
}
