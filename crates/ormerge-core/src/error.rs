//! Error types for merge, cascade and unit-of-work operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all ormerge operations.
#[derive(Debug)]
pub enum Error {
    /// Merge failures (deleted instance, stale state, entity copies, ...)
    Merge(MergeError),
    /// Mapping errors (unknown entity or property, invalid metadata)
    Mapping(MappingError),
    /// An assigned identifier was required but not supplied
    IdentifierGeneration(IdentifierGenerationError),
    /// Unit-of-work misuse (flush during cascade, unknown handle)
    Persistence(PersistenceError),
    /// Failures raised by the storage collaborator
    Datastore(DatastoreError),
    /// Configuration errors
    Config(ConfigError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// A failed merge, with the entity it concerns.
#[derive(Debug, Clone)]
pub struct MergeError {
    pub kind: MergeErrorKind,
    pub entity_name: Option<String>,
    pub identifier: Option<Value>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeErrorKind {
    /// Merge attempted on an instance scheduled for deletion
    ObjectDeleted,
    /// Requested identifier differs from the instance's own identifier
    IdentifierMismatch,
    /// Optimistic version check failed against an existing row
    StaleState,
    /// Loaded instance belongs to a different entity than the merged one
    WrongClass,
    /// The merge cross-reference indices disagree
    InternalConsistency,
    /// Several representations of one row were merged and the policy refuses it
    EntityCopy,
    /// A supposedly detached instance turned out to be the managed one
    AssertionFailure,
    /// A second instance was saved under an already-managed key
    NonUniqueObject,
    /// A merge entity was rebound to a different managed entity
    IllegalArgument,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// No persister registered under the entity name
    UnknownEntity,
    /// Property name or index not declared in the metadata
    UnknownProperty,
    /// Metadata rejected at registration
    Invalid,
    /// A property value does not have the shape its mapping declares
    ValueShape,
}

#[derive(Debug, Clone)]
pub struct IdentifierGenerationError {
    pub entity_name: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct PersistenceError {
    pub kind: PersistenceErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceErrorKind {
    /// Flush requested while a cascade is running
    FlushDuringCascade,
    /// Handle does not address a live arena slot
    UnknownInstance,
    /// Operation requires a managed instance
    NotManaged,
    /// Lazy proxy could not be initialized
    ProxyInitialization,
    /// A flushed instance references an instance that was never saved
    TransientReference,
}

#[derive(Debug)]
pub struct DatastoreError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MergeError {
    pub fn new(kind: MergeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity_name: None,
            identifier: None,
            message: message.into(),
        }
    }

    /// Attach the entity name and identifier the failure concerns.
    pub fn with_entity(mut self, entity_name: impl Into<String>, identifier: Option<Value>) -> Self {
        self.entity_name = Some(entity_name.into());
        self.identifier = identifier;
        self
    }
}

impl Error {
    /// Shorthand for a merge failure without entity context.
    pub fn merge(kind: MergeErrorKind, message: impl Into<String>) -> Self {
        Error::Merge(MergeError::new(kind, message))
    }

    pub fn mapping(kind: MappingErrorKind, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            kind,
            message: message.into(),
        })
    }

    pub fn persistence(kind: PersistenceErrorKind, message: impl Into<String>) -> Self {
        Error::Persistence(PersistenceError {
            kind,
            message: message.into(),
        })
    }

    pub fn datastore(message: impl Into<String>) -> Self {
        Error::Datastore(DatastoreError {
            message: message.into(),
            source: None,
        })
    }

    /// The merge failure kind, if this is a merge error.
    pub fn merge_kind(&self) -> Option<MergeErrorKind> {
        match self {
            Error::Merge(m) => Some(m.kind),
            _ => None,
        }
    }

    /// Is this an optimistic locking failure?
    pub fn is_stale_state(&self) -> bool {
        self.merge_kind() == Some(MergeErrorKind::StaleState)
    }

    /// Was this raised by a disallowing entity copy policy?
    pub fn is_entity_copy(&self) -> bool {
        self.merge_kind() == Some(MergeErrorKind::EntityCopy)
    }

    /// Is this a mapping lookup failure for an unknown entity name?
    pub fn is_unknown_entity(&self) -> bool {
        matches!(self, Error::Mapping(m) if m.kind == MappingErrorKind::UnknownEntity)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Merge(e) => write!(f, "Merge error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::IdentifierGeneration(e) => write!(
                f,
                "Identifier generation error for '{}': {}",
                e.entity_name, e.message
            ),
            Error::Persistence(e) => write!(f, "Persistence error: {}", e.message),
            Error::Datastore(e) => write!(f, "Datastore error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Datastore(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity_name, &self.identifier) {
            (Some(name), Some(id)) => write!(f, "{} [{}#{}]", self.message, name, id),
            (Some(name), None) => write!(f, "{} [{}]", self.message, name),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for MergeError {}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DatastoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<MergeError> for Error {
    fn from(err: MergeError) -> Self {
        Error::Merge(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<DatastoreError> for Error {
    fn from(err: DatastoreError) -> Self {
        Error::Datastore(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for ormerge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_kind_helpers() {
        let stale = Error::merge(MergeErrorKind::StaleState, "row was updated by another transaction");
        assert!(stale.is_stale_state());
        assert!(!stale.is_entity_copy());
        assert_eq!(stale.merge_kind(), Some(MergeErrorKind::StaleState));

        let copy = Error::merge(MergeErrorKind::EntityCopy, "copies");
        assert!(copy.is_entity_copy());

        let custom = Error::Custom("boom".to_string());
        assert_eq!(custom.merge_kind(), None);
    }

    #[test]
    fn test_merge_error_display_includes_entity() {
        let err = Error::Merge(
            MergeError::new(MergeErrorKind::ObjectDeleted, "deleted instance passed to merge")
                .with_entity("Order", Some(Value::BigInt(7))),
        );
        assert_eq!(
            err.to_string(),
            "Merge error: deleted instance passed to merge [Order#7]"
        );
    }

    #[test]
    fn test_serde_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Serde(_)));
    }

    #[test]
    fn test_unknown_entity_flag() {
        let err = Error::mapping(MappingErrorKind::UnknownEntity, "no persister for 'Ghost'");
        assert!(err.is_unknown_entity());
        assert_eq!(err.to_string(), "Mapping error: no persister for 'Ghost'");
    }
}
