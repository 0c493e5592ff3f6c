use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use ormerge::prelude::*;
use ormerge::{
    ENTITY_COPY_OBSERVER_SETTING, EntityCopyObserver, EntityStore, MergeErrorKind, Row,
    StoredValue,
};

/// Author 1..n Book, cascading merge both ways.
fn registry() -> Arc<PersisterRegistry> {
    let registry = PersisterRegistry::new()
        .with(
            EntityMetadata::new("Author", IdentifierMetadata::generated("id"))
                .versioned(VersionMetadata::new("version"))
                .property(PropertyMetadata::basic("name"))
                .property(PropertyMetadata::one_to_many("books", "Book").cascade(CascadeStyle::MERGE)),
        )
        .unwrap()
        .with(
            EntityMetadata::new("Book", IdentifierMetadata::generated("id"))
                .versioned(VersionMetadata::new("version"))
                .property(PropertyMetadata::basic("title"))
                .property(PropertyMetadata::many_to_one("author", "Author").cascade(CascadeStyle::MERGE)),
        )
        .unwrap();
    Arc::new(registry)
}

fn seed(session: &mut Session<InMemoryDatastore>) {
    session.datastore_mut().seed(
        "Author",
        Row {
            entity_name: "Author",
            identifier: Value::BigInt(1),
            version: Value::BigInt(1),
            values: vec![
                StoredValue::Scalar(Value::from("Le Guin")),
                StoredValue::References(vec![Value::BigInt(1), Value::BigInt(2)]),
            ],
        },
    );
    for (id, title) in [(1, "The Dispossessed"), (2, "The Lathe of Heaven")] {
        session.datastore_mut().seed(
            "Book",
            Row {
                entity_name: "Book",
                identifier: Value::BigInt(id),
                version: Value::BigInt(1),
                values: vec![
                    StoredValue::Scalar(Value::from(title)),
                    StoredValue::Reference(Some(Value::BigInt(1))),
                ],
            },
        );
    }
}

fn detached(session: &mut Session<InMemoryDatastore>, entity_name: &str, id: i64) -> EntityRef {
    let entity = session.instantiate_with_id(entity_name, id).unwrap();
    session.set_version(entity, 1_i64).unwrap();
    entity
}

/// A detached author whose second book points at another detached copy of
/// the same author. Returns the author to merge.
fn graph_with_two_author_copies(session: &mut Session<InMemoryDatastore>) -> EntityRef {
    let author = detached(session, "Author", 1);
    let author_copy = detached(session, "Author", 1);
    let first = detached(session, "Book", 1);
    let second = detached(session, "Book", 2);
    session.set_scalar(author, "name", "Ursula K. Le Guin").unwrap();
    session.set_scalar(author_copy, "name", "U. K. Le Guin").unwrap();
    session.set_scalar(first, "title", "The Dispossessed").unwrap();
    session.set_scalar(second, "title", "The Lathe of Heaven").unwrap();
    session.set_collection(author, "books", [first, second]).unwrap();
    session.set_reference(first, "author", Some(author)).unwrap();
    session.set_reference(second, "author", Some(author_copy)).unwrap();
    author
}

fn session_with(config: SessionConfig) -> Session<InMemoryDatastore> {
    let mut session = Session::with_config(InMemoryDatastore::new(), registry(), config);
    seed(&mut session);
    session
}

#[test]
fn disallow_observer_rejects_two_copies_of_one_row() {
    let mut session = session_with(SessionConfig::new());
    let author = graph_with_two_author_copies(&mut session);

    let err = session.merge(author).unwrap_err();
    assert!(err.is_entity_copy());
    assert_eq!(err.merge_kind(), Some(MergeErrorKind::EntityCopy));
    assert!(err.to_string().contains("Multiple representations"));
    assert!(session.merge_context().is_empty());
}

#[test]
fn allow_observer_merges_every_copy() {
    let mut session = session_with(
        SessionConfig::new()
            .entity_copy_observer(EntityCopyObserverKind::Allow)
            .statistics_enabled(true),
    );
    let author = graph_with_two_author_copies(&mut session);

    let managed = session.merge(author).unwrap();
    // The outermost copy is applied last.
    assert_eq!(session.scalar(managed, "name").unwrap(), Value::from("Ursula K. Le Guin"));
    let books = session.collection(managed, "books").unwrap();
    assert_eq!(books.len(), 2);
    for book in books {
        assert_eq!(session.reference(book, "author").unwrap(), Some(managed));
    }
    assert_eq!(session.statistics().entity_copies_detected, 1);
}

#[test]
fn log_observer_merges_and_counts_copies() {
    let mut session = session_with(
        SessionConfig::from_json(r#"{"entity_copy_observer": "log", "statistics_enabled": true}"#)
            .unwrap(),
    );
    let author = graph_with_two_author_copies(&mut session);

    session.merge(author).unwrap();
    assert_eq!(session.statistics().entity_copies_detected, 1);

    // A later merge starts from a clean table.
    let again = graph_with_two_author_copies(&mut session);
    session.merge(again).unwrap();
    assert_eq!(session.statistics().entity_copies_detected, 2);
}

#[test]
fn observer_strategy_from_settings() {
    let mut settings = HashMap::new();
    settings.insert(ENTITY_COPY_OBSERVER_SETTING.to_string(), "ALLOW".to_string());
    let config = SessionConfig::from_settings(&settings).unwrap();
    assert_eq!(config.entity_copy_observer, EntityCopyObserverKind::Allow);

    let mut session = session_with(config);
    let author = graph_with_two_author_copies(&mut session);
    assert!(session.merge(author).is_ok());

    settings.insert(ENTITY_COPY_OBSERVER_SETTING.to_string(), "sometimes".to_string());
    assert!(matches!(SessionConfig::from_settings(&settings), Err(Error::Config(_))));
}

type Copies = Rc<RefCell<Vec<(EntityRef, EntityRef, EntityRef)>>>;

#[derive(Debug)]
struct Recording {
    copies: Copies,
    completed: Rc<Cell<usize>>,
}

impl EntityCopyObserver for Recording {
    fn entity_copy_detected(
        &mut self,
        managed: EntityRef,
        merge_entity: EntityRef,
        old_merge_entity: EntityRef,
        _store: &EntityStore,
    ) -> Result<()> {
        self.copies
            .borrow_mut()
            .push((managed, merge_entity, old_merge_entity));
        Ok(())
    }

    fn top_level_merge_complete(&mut self, _store: &EntityStore) {
        self.completed.set(self.completed.get() + 1);
    }

    fn clear(&mut self) {}
}

#[test]
fn custom_observer_factory_is_created_lazily_once() {
    let copies: Copies = Rc::default();
    let completed = Rc::new(Cell::new(0));
    let created = Rc::new(Cell::new(0));

    let factory = {
        let (copies, completed, created) = (copies.clone(), completed.clone(), created.clone());
        move || -> Box<dyn EntityCopyObserver> {
            created.set(created.get() + 1);
            Box::new(Recording {
                copies: copies.clone(),
                completed: completed.clone(),
            })
        }
    };
    let mut session = session_with(SessionConfig::new()).with_entity_copy_observer_factory(factory);
    assert_eq!(created.get(), 0);

    let author = graph_with_two_author_copies(&mut session);
    let managed = session.merge(author).unwrap();
    assert_eq!(created.get(), 1);
    assert_eq!(completed.get(), 1);

    let recorded = copies.borrow().clone();
    assert_eq!(recorded.len(), 1);
    let (copy_managed, merge_entity, old_merge_entity) = recorded[0];
    assert_eq!(session.store().unproxy(copy_managed).unwrap(), session.store().unproxy(managed).unwrap());
    assert_eq!(old_merge_entity, author);
    assert_ne!(merge_entity, author);

    let plain = session.instantiate("Book").unwrap();
    session.merge(plain).unwrap();
    assert_eq!(created.get(), 1);
    assert_eq!(completed.get(), 2);
}
