use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tetherdb::{
    ConnectionId, EngineState, Error, Event, Key, KeyPath, MemoryBackingStore, Output, Result, TransactionMode,
    Upgrade, Value,
};

fn setup() -> (Rc<RefCell<MemoryBackingStore>>, EngineState) {
    let host = Rc::new(RefCell::new(MemoryBackingStore::new()));
    let engine = EngineState::new(MemoryBackingStore::loopback(&host));
    (host, engine)
}

fn open_with<F>(engine: &mut EngineState, name: &str, version: u64, upgrade: F) -> ConnectionId
where
    F: FnOnce(&mut EngineState, &Upgrade) -> Result<()> + 'static,
{
    let request = engine.open(name, Some(version), Some(Box::new(upgrade))).unwrap();
    engine.run_until_idle().unwrap();
    match engine.take_outcome(request) {
        Some(Ok(Output::Connection(connection))) => connection,
        other => panic!("open of {} failed: {:?}", name, other),
    }
}

fn with_books(engine: &mut EngineState, upgrade: &Upgrade) -> Result<()> {
    let mut books = engine.create_object_store(upgrade.transaction, "books", Some(KeyPath::from("isbn")), false)?;
    books.put(Value::object([("isbn", Value::from("1")), ("title", Value::from("Dune"))]), None)?;
    Ok(())
}

#[test]
fn test_upgrade_reports_versions_and_writes_records() {
    let (host, mut engine) = setup();
    let versions = Rc::new(Cell::new((u64::MAX, 0)));
    let seen = Rc::clone(&versions);
    let conn = open_with(&mut engine, "shelf", 3, move |engine, upgrade| {
        seen.set((upgrade.old_version, upgrade.new_version));
        with_books(engine, upgrade)
    });

    assert_eq!(versions.get(), (0, 3));
    assert_eq!(engine.connection_version(conn), Some(3));
    assert_eq!(host.borrow().version("shelf"), Some(3));
    assert!(host.borrow().get("shelf", "books", &Key::from("1")).is_some());

    let events = engine.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::UpgradeNeeded { old_version: 0, new_version: 3, .. })));
}

#[test]
fn test_open_without_version_uses_current() {
    let (_host, mut engine) = setup();
    let first = open_with(&mut engine, "shelf", 2, with_books);
    engine.close(first).unwrap();
    engine.run_until_idle().unwrap();

    let request = engine.open("shelf", None, None).unwrap();
    engine.run_until_idle().unwrap();
    let conn = match engine.take_outcome(request) {
        Some(Ok(Output::Connection(conn))) => conn,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(engine.connection_version(conn), Some(2));
    assert_eq!(engine.object_store_names(conn).unwrap(), vec!["books".to_string()]);
}

#[test]
fn test_lower_version_is_rejected() {
    let (_host, mut engine) = setup();
    open_with(&mut engine, "shelf", 2, with_books);

    let request = engine.open("shelf", Some(1), None).unwrap();
    engine.run_until_idle().unwrap();
    assert!(matches!(engine.take_outcome(request), Some(Err(Error::Version(_)))));
    assert!(matches!(engine.open("shelf", Some(0), None), Err(Error::Type(_))));
}

#[test]
fn test_failed_upgrade_leaves_nothing_behind() {
    let (host, mut engine) = setup();
    let request = engine
        .open(
            "shelf",
            Some(1),
            Some(Box::new(|engine, upgrade| {
                with_books(engine, upgrade)?;
                Err(Error::Type("refusing to upgrade".into()))
            })),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    assert!(matches!(engine.take_outcome(request), Some(Err(Error::Abort(_)))));
    assert_eq!(host.borrow().version("shelf"), None);

    let conn = open_with(&mut engine, "shelf", 1, |_, _| Ok(()));
    assert!(engine.object_store_names(conn).unwrap().is_empty());
}

#[test]
fn test_upgrade_waits_for_blocking_connection() {
    let (host, mut engine) = setup();
    let old = open_with(&mut engine, "shelf", 1, with_books);
    engine.take_events();

    let request = engine
        .open(
            "shelf",
            Some(2),
            Some(Box::new(|engine, upgrade| {
                engine.create_object_store(upgrade.transaction, "authors", None, true)?;
                Ok(())
            })),
        )
        .unwrap();
    engine.run_until_idle().unwrap();
    assert!(!engine.is_settled(request));

    let events = engine.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::VersionChange { connection, old_version: 1, new_version: Some(2) } if *connection == old
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Blocked { old_version: 1, new_version: Some(2), .. }
    )));

    engine.close(old).unwrap();
    engine.run_until_idle().unwrap();
    let conn = match engine.take_outcome(request) {
        Some(Ok(Output::Connection(conn))) => conn,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(host.borrow().version("shelf"), Some(2));
    assert_eq!(
        engine.object_store_names(conn).unwrap(),
        vec!["authors".to_string(), "books".to_string()]
    );
    assert!(matches!(
        engine.transaction(old, &["books"], TransactionMode::ReadOnly),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_versionchange_handler_can_close_connection() {
    let (_host, mut engine) = setup();
    let old = open_with(&mut engine, "shelf", 1, with_books);
    engine
        .on_versionchange(
            old,
            Box::new(|engine, connection, _, _| {
                engine.close(connection).unwrap();
            }),
        )
        .unwrap();

    open_with(&mut engine, "shelf", 2, |_, _| Ok(()));
    assert!(!engine
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::Blocked { .. })));
}

#[test]
fn test_rename_and_delete_store_in_upgrade() {
    let (host, mut engine) = setup();
    let first = open_with(&mut engine, "shelf", 1, |engine, upgrade| {
        with_books(engine, upgrade)?;
        engine.create_object_store(upgrade.transaction, "scratch", None, false)?;
        Ok(())
    });
    engine.close(first).unwrap();

    let conn = open_with(&mut engine, "shelf", 2, |engine, upgrade| {
        engine.object_store(upgrade.transaction, "books")?.rename("novels")?;
        engine.delete_object_store(upgrade.transaction, "scratch")?;
        Ok(())
    });
    assert_eq!(engine.object_store_names(conn).unwrap(), vec!["novels".to_string()]);
    assert!(host.borrow().get("shelf", "novels", &Key::from("1")).is_some());

    let txn = engine.transaction(conn, &["novels"], TransactionMode::ReadOnly).unwrap();
    let count = engine.object_store(txn, "novels").unwrap().count(None).unwrap();
    engine.run_until_idle().unwrap();
    assert_eq!(engine.take_outcome(count), Some(Ok(Output::Count(1))));
}

#[test]
fn test_delete_database() {
    let (host, mut engine) = setup();
    let conn = open_with(&mut engine, "shelf", 1, with_books);
    engine.take_events();

    let request = engine.delete_database("shelf").unwrap();
    engine.run_until_idle().unwrap();
    assert!(!engine.is_settled(request));
    assert!(engine.take_events().iter().any(|e| matches!(
        e,
        Event::VersionChange { old_version: 1, new_version: None, .. }
    )));

    engine.close(conn).unwrap();
    engine.run_until_idle().unwrap();
    assert_eq!(engine.take_outcome(request), Some(Ok(Output::Unit)));
    assert_eq!(host.borrow().version("shelf"), None);
    assert!(engine.databases().unwrap().is_empty());
}
