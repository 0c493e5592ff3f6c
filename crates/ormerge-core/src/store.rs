//! Entity arena.
//!
//! Domain objects live in an [`EntityStore`] and are addressed by
//! [`EntityRef`] handles. Two handles are the same object exactly when they
//! are equal, regardless of the values the objects hold, which gives the
//! merge engine reference identity without relying on `PartialEq` of the
//! entity contents.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, PersistenceErrorKind, Result};
use crate::value::Value;

/// Handle to an object in an [`EntityStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(usize);

impl EntityRef {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// A collection-valued association.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionValue {
    pub elements: Vec<EntityRef>,
    /// Uninitialized collections were never fetched; their elements are unknown.
    pub initialized: bool,
}

impl CollectionValue {
    pub fn of(elements: impl IntoIterator<Item = EntityRef>) -> Self {
        Self {
            elements: elements.into_iter().collect(),
            initialized: true,
        }
    }

    pub fn uninitialized() -> Self {
        Self {
            elements: Vec::new(),
            initialized: false,
        }
    }
}

/// The value of one mapped property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(Value),
    Component(Vec<Value>),
    Reference(Option<EntityRef>),
    Collection(CollectionValue),
}

impl PropertyValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<EntityRef> {
        match self {
            PropertyValue::Reference(r) => *r,
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionValue> {
        match self {
            PropertyValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Every entity handle this value points at.
    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            PropertyValue::Reference(Some(r)) => vec![*r],
            PropertyValue::Collection(c) => c.elements.clone(),
            _ => Vec::new(),
        }
    }
}

/// Set of attribute names changed since the tracker was last cleared.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirtyTracker {
    attributes: BTreeSet<String>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_change(&mut self, attribute: impl Into<String>) {
        self.attributes.insert(attribute.into());
    }

    pub fn clear(&mut self) {
        self.attributes.clear();
    }

    pub fn is_dirty(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// An entity instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    pub entity_name: &'static str,
    /// `Value::Null` until an identifier is assigned.
    pub identifier: Value,
    /// `Value::Null` for unversioned entities and unsaved versions.
    pub version: Value,
    /// Property values in metadata declaration order.
    pub values: Vec<PropertyValue>,
    /// Present when the instance tracks its own dirty attributes.
    pub dirty_tracker: Option<DirtyTracker>,
}

impl EntityData {
    pub fn new(entity_name: &'static str, values: Vec<PropertyValue>) -> Self {
        Self {
            entity_name,
            identifier: Value::Null,
            version: Value::Null,
            values,
            dirty_tracker: None,
        }
    }
}

/// A lazily loaded stand-in for an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct LazyProxy {
    pub entity_name: &'static str,
    pub identifier: Value,
    /// The loaded instance, once initialized.
    pub target: Option<EntityRef>,
}

impl LazyProxy {
    pub fn is_initialized(&self) -> bool {
        self.target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Instance(EntityData),
    Proxy(LazyProxy),
}

/// Arena owning every entity instance and proxy of a session.
///
/// Slots are never reclaimed, so a handle stays valid for the life of the
/// store. Clearing a session detaches its instances but keeps them here;
/// drop the session to release them.
#[derive(Debug, Default)]
pub struct EntityStore {
    slots: Vec<Slot>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, data: EntityData) -> EntityRef {
        self.push(Slot::Instance(data))
    }

    pub fn insert_proxy(&mut self, proxy: LazyProxy) -> EntityRef {
        self.push(Slot::Proxy(proxy))
    }

    fn push(&mut self, slot: Slot) -> EntityRef {
        let handle = EntityRef(self.slots.len());
        self.slots.push(slot);
        handle
    }

    pub fn slot(&self, entity: EntityRef) -> Result<&Slot> {
        self.slots.get(entity.index()).ok_or_else(|| unknown(entity))
    }

    pub fn slot_mut(&mut self, entity: EntityRef) -> Result<&mut Slot> {
        self.slots
            .get_mut(entity.index())
            .ok_or_else(|| unknown(entity))
    }

    /// The instance behind `entity`, following an initialized proxy.
    pub fn instance(&self, entity: EntityRef) -> Result<&EntityData> {
        let target = self.unproxy(entity)?;
        match self.slot(target)? {
            Slot::Instance(data) => Ok(data),
            Slot::Proxy(p) => Err(uninitialized(p)),
        }
    }

    pub fn instance_mut(&mut self, entity: EntityRef) -> Result<&mut EntityData> {
        let target = self.unproxy(entity)?;
        match self.slot_mut(target)? {
            Slot::Instance(data) => Ok(data),
            Slot::Proxy(p) => Err(uninitialized(p)),
        }
    }

    pub fn proxy(&self, entity: EntityRef) -> Option<&LazyProxy> {
        match self.slots.get(entity.index()) {
            Some(Slot::Proxy(p)) => Some(p),
            _ => None,
        }
    }

    pub fn proxy_mut(&mut self, entity: EntityRef) -> Option<&mut LazyProxy> {
        match self.slots.get_mut(entity.index()) {
            Some(Slot::Proxy(p)) => Some(p),
            _ => None,
        }
    }

    pub fn is_uninitialized_proxy(&self, entity: EntityRef) -> bool {
        self.proxy(entity).is_some_and(|p| !p.is_initialized())
    }

    /// Resolve an initialized proxy to its target; other handles map to themselves.
    pub fn unproxy(&self, entity: EntityRef) -> Result<EntityRef> {
        match self.slot(entity)? {
            Slot::Proxy(LazyProxy {
                target: Some(target),
                ..
            }) => Ok(*target),
            _ => Ok(entity),
        }
    }

    /// Entity name of an instance or proxy.
    pub fn entity_name(&self, entity: EntityRef) -> Result<&'static str> {
        match self.slot(entity)? {
            Slot::Instance(data) => Ok(data.entity_name),
            Slot::Proxy(p) => Ok(p.entity_name),
        }
    }

    /// Human readable `[Name#id]` label, used in log and error messages.
    pub fn info_string(&self, entity: EntityRef) -> String {
        match self.slots.get(entity.index()) {
            Some(Slot::Instance(data)) => info_string(data.entity_name, &data.identifier),
            Some(Slot::Proxy(p)) => info_string(p.entity_name, &p.identifier),
            None => format!("[unknown {entity}]"),
        }
    }
}

/// `[Name#id]`, or `[Name#<null>]` without an identifier.
pub fn info_string(entity_name: &str, identifier: &Value) -> String {
    if identifier.is_null() {
        format!("[{entity_name}#<null>]")
    } else {
        format!("[{entity_name}#{identifier}]")
    }
}

fn unknown(entity: EntityRef) -> Error {
    Error::persistence(
        PersistenceErrorKind::UnknownInstance,
        format!("no instance at {entity}"),
    )
}

fn uninitialized(proxy: &LazyProxy) -> Error {
    Error::persistence(
        PersistenceErrorKind::ProxyInitialization,
        format!(
            "proxy {} is not initialized",
            info_string(proxy.entity_name, &proxy.identifier)
        ),
    )
}
