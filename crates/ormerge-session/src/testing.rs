//! Shared mapping and fixtures for unit tests.

use std::sync::Arc;

use ormerge_core::{
    CascadeKind, CascadeStyle, EntityMetadata, IdentifierMetadata, InMemoryDatastore,
    PersisterRegistry, PropertyMetadata, Row, StoredValue, Value, VersionMetadata,
};

use crate::{Session, SessionConfig};

/// Category 1..n Item 1..n Bid, plus Tag with an assigned identifier.
///
/// `Item.category` and `Item.bids` cascade merge and delete.
pub(crate) fn registry() -> Arc<PersisterRegistry> {
    let cascade = CascadeStyle::MERGE.with(CascadeKind::Delete);
    let mut registry = PersisterRegistry::new();
    registry
        .register(
            EntityMetadata::new("Category", IdentifierMetadata::generated("id"))
                .property(PropertyMetadata::basic("name")),
        )
        .unwrap();
    registry
        .register(
            EntityMetadata::new("Item", IdentifierMetadata::generated("id"))
                .versioned(VersionMetadata::new("version"))
                .property(PropertyMetadata::basic("name"))
                .property(PropertyMetadata::many_to_one("category", "Category").cascade(cascade))
                .property(PropertyMetadata::one_to_many("bids", "Bid").cascade(cascade)),
        )
        .unwrap();
    registry
        .register(
            EntityMetadata::new("Bid", IdentifierMetadata::generated("id"))
                .property(PropertyMetadata::basic("amount"))
                .property(PropertyMetadata::many_to_one("item", "Item")),
        )
        .unwrap();
    registry
        .register(
            EntityMetadata::new("Tag", IdentifierMetadata::assigned("label"))
                .property(PropertyMetadata::basic("description")),
        )
        .unwrap();
    Arc::new(registry)
}

/// A session over an empty datastore with statistics enabled.
pub(crate) fn test_session() -> Session<InMemoryDatastore> {
    Session::with_config(
        InMemoryDatastore::new(),
        registry(),
        SessionConfig::new().statistics_enabled(true),
    )
}

/// Store row `Item#id` without category or bids.
pub(crate) fn seed_item(session: &mut Session<InMemoryDatastore>, id: i64, version: i64, name: &str) {
    session.datastore_mut().seed(
        "Item",
        Row {
            entity_name: "Item",
            identifier: Value::BigInt(id),
            version: Value::BigInt(version),
            values: vec![
                StoredValue::Scalar(Value::from(name)),
                StoredValue::Reference(None),
                StoredValue::References(Vec::new()),
            ],
        },
    );
}

pub(crate) fn seed_tag(session: &mut Session<InMemoryDatastore>, label: &str) {
    session.datastore_mut().seed(
        "Tag",
        Row {
            entity_name: "Tag",
            identifier: Value::from(label),
            version: Value::Null,
            values: vec![StoredValue::Scalar(Value::Null)],
        },
    );
}
