//! Entity mapping metadata.
//!
//! Metadata is bound elsewhere (derive macros, configuration files); this
//! module only describes the shape the merge engine consumes: identifier and
//! version strategies, the ordered property list, association targets,
//! cascade styles and foreign-key directions.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, MappingErrorKind, Result};
use crate::value::Value;

/// Entity and property names: dotted identifiers such as `Order` or `sales.Order`.
const NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$";

fn name_regex() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(NAME_PATTERN))
        .as_ref()
        .map_err(|e| Error::mapping(MappingErrorKind::Invalid, format!("invalid name pattern: {e}")))
}

/// Check that `name` is usable as an entity or property name.
pub fn validate_name(name: &str) -> Result<()> {
    if name_regex()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::mapping(
            MappingErrorKind::Invalid,
            format!("'{name}' is not a valid mapping name"),
        ))
    }
}

/// How identifiers are assigned on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdGeneration {
    /// Drawn from the datastore's sequence at save time.
    #[default]
    Generated,
    /// Supplied by the application before save.
    Assigned,
}

/// Strategy deciding whether an identifier or version value marks an
/// instance as never saved.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum UnsavedValue {
    /// Always unsaved.
    Any,
    /// Never unsaved.
    None,
    /// Unsaved exactly when the value is null.
    Null,
    /// A null value is unsaved; anything else is undecided.
    #[default]
    Undefined,
    /// Null or strictly negative values are unsaved (versions only).
    Negative,
    /// Unsaved exactly when the value equals this one.
    Value(Value),
}

impl UnsavedValue {
    /// `Some(true)` if `value` marks an unsaved instance, `Some(false)` if it
    /// marks a saved one, `None` if this strategy cannot tell.
    pub fn is_unsaved(&self, value: &Value) -> Option<bool> {
        match self {
            UnsavedValue::Any => Some(true),
            UnsavedValue::None => Some(false),
            UnsavedValue::Null => Some(value.is_null()),
            UnsavedValue::Undefined => {
                if value.is_null() {
                    Some(true)
                } else {
                    None
                }
            }
            UnsavedValue::Negative => Some(value.is_null() || value.is_negative()),
            UnsavedValue::Value(marker) => Some(value == marker),
        }
    }
}

/// Identifier property mapping.
#[derive(Debug, Clone)]
pub struct IdentifierMetadata {
    pub name: &'static str,
    pub generation: IdGeneration,
    pub unsaved_value: UnsavedValue,
}

impl IdentifierMetadata {
    /// A generated identifier; unsaved while null.
    pub fn generated(name: &'static str) -> Self {
        Self {
            name,
            generation: IdGeneration::Generated,
            unsaved_value: UnsavedValue::Null,
        }
    }

    /// An application-assigned identifier; saved state is undecided unless null.
    pub fn assigned(name: &'static str) -> Self {
        Self {
            name,
            generation: IdGeneration::Assigned,
            unsaved_value: UnsavedValue::Undefined,
        }
    }

    pub fn unsaved_value(mut self, unsaved: UnsavedValue) -> Self {
        self.unsaved_value = unsaved;
        self
    }
}

/// Version property mapping.
#[derive(Debug, Clone)]
pub struct VersionMetadata {
    pub name: &'static str,
    pub unsaved_value: UnsavedValue,
}

impl VersionMetadata {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            unsaved_value: UnsavedValue::Undefined,
        }
    }

    pub fn unsaved_value(mut self, unsaved: UnsavedValue) -> Self {
        self.unsaved_value = unsaved;
        self
    }
}

/// Which side of an association holds the foreign key, from the point of
/// view of the owning entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignKeyDirection {
    /// The key points from this entity to the associated one (many-to-one).
    /// The associated entity must exist first.
    FromParent,
    /// The key lives on the associated side (collections). The owner must
    /// exist first.
    ToParent,
}

impl ForeignKeyDirection {
    /// Whether an association in this direction cascades at `point`.
    pub const fn cascade_now(self, point: CascadePoint) -> bool {
        match (self, point) {
            (ForeignKeyDirection::ToParent, CascadePoint::BeforeInsertAfterDelete) => false,
            (ForeignKeyDirection::FromParent, CascadePoint::AfterInsertBeforeDelete) => false,
            _ => true,
        }
    }
}

/// The moment in an operation at which a cascade runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadePoint {
    /// Before values are copied onto an existing managed instance.
    BeforeMerge,
    /// Before the owner is inserted: cascades to the entities it references.
    BeforeInsertAfterDelete,
    /// After the owner is inserted: cascades to its collections.
    AfterInsertBeforeDelete,
    /// After insert, reached through a collection element.
    AfterInsertBeforeDeleteViaCollection,
}

/// A single operation an association may cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeKind {
    Merge,
    Persist,
    SaveUpdate,
    Delete,
    Refresh,
    Evict,
    Lock,
    Replicate,
    DeleteOrphan,
}

impl CascadeKind {
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeKind::Merge => "merge",
            CascadeKind::Persist => "persist",
            CascadeKind::SaveUpdate => "save-update",
            CascadeKind::Delete => "delete",
            CascadeKind::Refresh => "refresh",
            CascadeKind::Evict => "evict",
            CascadeKind::Lock => "lock",
            CascadeKind::Replicate => "replicate",
            CascadeKind::DeleteOrphan => "delete-orphan",
        }
    }
}

impl FromStr for CascadeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(CascadeKind::Merge),
            "persist" => Ok(CascadeKind::Persist),
            "save-update" | "save_update" => Ok(CascadeKind::SaveUpdate),
            "delete" | "remove" => Ok(CascadeKind::Delete),
            "refresh" => Ok(CascadeKind::Refresh),
            "evict" | "detach" => Ok(CascadeKind::Evict),
            "lock" => Ok(CascadeKind::Lock),
            "replicate" => Ok(CascadeKind::Replicate),
            "delete-orphan" | "delete_orphan" => Ok(CascadeKind::DeleteOrphan),
            other => Err(Error::mapping(
                MappingErrorKind::Invalid,
                format!("unknown cascade style '{other}'"),
            )),
        }
    }
}

/// The set of operations an association cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeStyle(u16);

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle(0);

    /// Every operation except orphan removal.
    pub const ALL: CascadeStyle = CascadeStyle(
        CascadeKind::Merge.bit()
            | CascadeKind::Persist.bit()
            | CascadeKind::SaveUpdate.bit()
            | CascadeKind::Delete.bit()
            | CascadeKind::Refresh.bit()
            | CascadeKind::Evict.bit()
            | CascadeKind::Lock.bit()
            | CascadeKind::Replicate.bit(),
    );

    pub const MERGE: CascadeStyle = CascadeStyle(CascadeKind::Merge.bit());

    /// Parse a comma separated mapping string such as `"all, delete-orphan"`.
    pub fn parse(mapping: &str) -> Result<Self> {
        let mut style = CascadeStyle::NONE;
        for part in mapping.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            style = match part.to_ascii_lowercase().as_str() {
                "none" => style,
                "all" => style.union(CascadeStyle::ALL),
                "all-delete-orphan" => style
                    .union(CascadeStyle::ALL)
                    .with(CascadeKind::DeleteOrphan),
                other => style.with(other.parse()?),
            };
        }
        Ok(style)
    }

    #[must_use]
    pub const fn with(self, kind: CascadeKind) -> Self {
        CascadeStyle(self.0 | kind.bit())
    }

    #[must_use]
    pub const fn union(self, other: CascadeStyle) -> Self {
        CascadeStyle(self.0 | other.0)
    }

    pub const fn does_cascade(self, kind: CascadeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub const fn has_orphan_delete(self) -> bool {
        self.does_cascade(CascadeKind::DeleteOrphan)
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for CascadeStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CascadeStyle::parse(s)
    }
}

/// What a property holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// A single scalar column.
    Basic,
    /// A value-typed composite of scalars.
    Component,
    ManyToOne {
        target: &'static str,
    },
    /// `constrained` one-to-ones carry the foreign key on this side.
    OneToOne {
        target: &'static str,
        constrained: bool,
    },
    OneToMany {
        target: &'static str,
    },
    ManyToMany {
        target: &'static str,
    },
}

impl PropertyKind {
    pub const fn is_association(self) -> bool {
        !matches!(self, PropertyKind::Basic | PropertyKind::Component)
    }

    pub const fn is_collection(self) -> bool {
        matches!(
            self,
            PropertyKind::OneToMany { .. } | PropertyKind::ManyToMany { .. }
        )
    }

    /// The associated entity name, for associations.
    pub const fn target(self) -> Option<&'static str> {
        match self {
            PropertyKind::Basic | PropertyKind::Component => None,
            PropertyKind::ManyToOne { target }
            | PropertyKind::OneToOne { target, .. }
            | PropertyKind::OneToMany { target }
            | PropertyKind::ManyToMany { target } => Some(target),
        }
    }

    /// Foreign-key direction of an association; `None` for value types.
    pub const fn foreign_key_direction(self) -> Option<ForeignKeyDirection> {
        match self {
            PropertyKind::Basic | PropertyKind::Component => None,
            PropertyKind::ManyToOne { .. }
            | PropertyKind::OneToOne {
                constrained: true, ..
            } => Some(ForeignKeyDirection::FromParent),
            PropertyKind::OneToOne {
                constrained: false, ..
            }
            | PropertyKind::OneToMany { .. }
            | PropertyKind::ManyToMany { .. } => Some(ForeignKeyDirection::ToParent),
        }
    }
}

/// One mapped property, in declaration order.
#[derive(Debug, Clone)]
pub struct PropertyMetadata {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub cascade: CascadeStyle,
}

impl PropertyMetadata {
    pub const fn basic(name: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Basic,
            cascade: CascadeStyle::NONE,
        }
    }

    pub const fn component(name: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::Component,
            cascade: CascadeStyle::NONE,
        }
    }

    pub const fn many_to_one(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::ManyToOne { target },
            cascade: CascadeStyle::NONE,
        }
    }

    pub const fn one_to_one(name: &'static str, target: &'static str, constrained: bool) -> Self {
        Self {
            name,
            kind: PropertyKind::OneToOne {
                target,
                constrained,
            },
            cascade: CascadeStyle::NONE,
        }
    }

    pub const fn one_to_many(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::OneToMany { target },
            cascade: CascadeStyle::NONE,
        }
    }

    pub const fn many_to_many(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: PropertyKind::ManyToMany { target },
            cascade: CascadeStyle::NONE,
        }
    }

    /// Set the cascade style.
    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }
}

/// Mapping of one entity.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub name: &'static str,
    /// Inheritance root; entity keys are built from it.
    pub root_name: &'static str,
    pub identifier: IdentifierMetadata,
    pub version: Option<VersionMetadata>,
    pub properties: Vec<PropertyMetadata>,
}

impl EntityMetadata {
    pub fn new(name: &'static str, identifier: IdentifierMetadata) -> Self {
        Self {
            name,
            root_name: name,
            identifier,
            version: None,
            properties: Vec::new(),
        }
    }

    /// Declare this entity a subtype of `root`.
    pub fn subclass_of(mut self, root: &'static str) -> Self {
        self.root_name = root;
        self
    }

    pub fn versioned(mut self, version: VersionMetadata) -> Self {
        self.version = Some(version);
        self
    }

    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Validate names and reject duplicate properties.
    pub fn validate(&self) -> Result<()> {
        validate_name(self.name)?;
        validate_name(self.root_name)?;
        validate_name(self.identifier.name)?;
        if let Some(version) = &self.version {
            validate_name(version.name)?;
        }
        for (i, property) in self.properties.iter().enumerate() {
            validate_name(property.name)?;
            if let Some(target) = property.kind.target() {
                validate_name(target)?;
            }
            if self.properties[..i].iter().any(|p| p.name == property.name) {
                return Err(Error::mapping(
                    MappingErrorKind::Invalid,
                    format!(
                        "property '{}' declared twice on '{}'",
                        property.name, self.name
                    ),
                ));
            }
        }
        Ok(())
    }
}
