use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tetherdb::{
    ConnectionId, Disposition, EngineState, Error, Event, IndexFlags, Key, KeyPath, MemoryBackingStore, Output,
    RequestId, Result, TransactionMode, TransactionState, Upgrade, Value,
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

fn settled(engine: &mut EngineState, request: RequestId) -> Output {
    match engine.take_outcome(request) {
        Some(Ok(output)) => output,
        other => panic!("request {:?} did not succeed: {:?}", request, other),
    }
}

fn counters(engine: &mut EngineState) -> ConnectionId {
    open_with(engine, "counters", 1, |engine, upgrade| {
        engine.create_object_store(upgrade.transaction, "ticks", None, true)?;
        let mut users = engine.create_object_store(upgrade.transaction, "users", Some(KeyPath::from("id")), false)?;
        users.create_index("by_email", "email", IndexFlags::UNIQUE)?;
        Ok(())
    })
}

fn user(id: i32, email: &str) -> Value {
    Value::object([("id", Value::from(id)), ("email", Value::from(email))])
}

#[test]
fn test_abort_restores_key_generator() {
    let (host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let mut ticks = engine.object_store(txn, "ticks").unwrap();
    ticks.put(Value::from("a"), None).unwrap();
    ticks.put(Value::from("b"), None).unwrap();
    engine.run_until_idle().unwrap();

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let put = engine.object_store(txn, "ticks").unwrap().put(Value::from("c"), None).unwrap();
    engine
        .set_callback(
            put,
            Box::new(move |engine, _, _| {
                engine.abort(txn).unwrap();
                Disposition::Default
            }),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    assert_eq!(settled(&mut engine, put), Output::Key(Key::from(3)));
    assert_eq!(engine.transaction_state(txn), Some(TransactionState::Finished));
    assert_eq!(engine.transaction_error(txn), None);
    assert!(engine
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::Abort { transaction, error: None } if *transaction == txn)));
    assert_eq!(host.borrow().keys("counters", "ticks"), vec![Key::from(1), Key::from(2)]);

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let put = engine.object_store(txn, "ticks").unwrap().put(Value::from("c"), None).unwrap();
    engine.run_until_idle().unwrap();
    assert_eq!(settled(&mut engine, put), Output::Key(Key::from(3)));
}

#[test]
fn test_failed_add_aborts_transaction() {
    let (host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    engine.object_store(txn, "users").unwrap().put(user(1, "a@x"), None).unwrap();
    engine.run_until_idle().unwrap();
    engine.take_events();

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    let mut users = engine.object_store(txn, "users").unwrap();
    let fresh = users.put(user(2, "b@x"), None).unwrap();
    let duplicate = users.add(user(1, "c@x"), None).unwrap();
    let never_run = users.put(user(3, "d@x"), None).unwrap();
    engine.run_until_idle().unwrap();

    assert_eq!(settled(&mut engine, fresh), Output::Key(Key::from(2)));
    assert!(matches!(engine.take_outcome(duplicate), Some(Err(Error::Constraint(_)))));
    assert!(matches!(engine.take_outcome(never_run), Some(Err(Error::Abort(_)))));
    assert!(matches!(engine.transaction_error(txn), Some(Error::Constraint(_))));

    let events = engine.take_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Error { request, error: Error::Constraint(_) } if *request == duplicate)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Abort { transaction, error: Some(Error::Constraint(_)) } if *transaction == txn)));
    assert_eq!(host.borrow().keys("counters", "users"), vec![Key::from(1)]);
}

#[test]
fn test_handled_error_keeps_transaction_alive() {
    let (host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    engine.object_store(txn, "users").unwrap().put(user(1, "a@x"), None).unwrap();
    engine.run_until_idle().unwrap();

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    let mut users = engine.object_store(txn, "users").unwrap();
    let taken = users.add(user(9, "a@x"), None).unwrap();
    let fresh = users.add(user(9, "z@x"), None).unwrap();
    engine
        .set_callback(taken, Box::new(|_, _, _| Disposition::Handled))
        .unwrap();
    engine.run_until_idle().unwrap();

    assert!(matches!(engine.take_outcome(taken), Some(Err(Error::Constraint(_)))));
    assert_eq!(settled(&mut engine, fresh), Output::Key(Key::from(9)));
    assert_eq!(engine.transaction_error(txn), None);
    assert_eq!(host.borrow().keys("counters", "users"), vec![Key::from(1), Key::from(9)]);
}

#[test]
fn test_transactions_on_one_database_run_serially() {
    let (_host, mut engine) = setup();
    let conn = counters(&mut engine);

    let first = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let second = engine.transaction(conn, &["users"], TransactionMode::ReadOnly).unwrap();
    engine.object_store(first, "ticks").unwrap().put(Value::from("a"), None).unwrap();
    let read = engine.object_store(second, "users").unwrap().count(None).unwrap();

    let first_done = Rc::new(Cell::new(false));
    let seen = Rc::clone(&first_done);
    engine
        .set_callback(
            read,
            Box::new(move |engine, _, _| {
                seen.set(engine.transaction_state(first) == Some(TransactionState::Finished));
                Disposition::Default
            }),
        )
        .unwrap();
    engine.run_until_idle().unwrap();

    assert!(first_done.get());
    assert_eq!(settled(&mut engine, read), Output::Count(0));
}

#[test]
fn test_requests_need_an_active_transaction() {
    let (_host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    assert_eq!(engine.transaction_state(txn), Some(TransactionState::Active));
    assert!(engine.tick().unwrap());
    assert_eq!(engine.transaction_state(txn), Some(TransactionState::Inactive));
    assert!(matches!(
        engine.object_store(txn, "ticks").unwrap().put(Value::from("late"), None),
        Err(Error::TransactionInactive(_))
    ));
    engine.run_until_idle().unwrap();
    assert_eq!(engine.transaction_state(txn), Some(TransactionState::Finished));
    assert!(matches!(engine.object_store(txn, "ticks"), Err(Error::InvalidState(_))));
}

#[test]
fn test_commit_runs_queued_requests_then_refuses_new_ones() {
    let (host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let put = engine.object_store(txn, "ticks").unwrap().put(Value::from("a"), None).unwrap();
    engine.commit(txn).unwrap();
    assert_eq!(engine.transaction_state(txn), Some(TransactionState::Committing));
    assert!(matches!(
        engine.object_store(txn, "ticks").unwrap().put(Value::from("b"), None),
        Err(Error::TransactionInactive(_))
    ));
    assert!(matches!(engine.abort(txn), Err(Error::InvalidState(_))));
    engine.run_until_idle().unwrap();

    assert_eq!(settled(&mut engine, put), Output::Key(Key::from(1)));
    assert_eq!(host.borrow().keys("counters", "ticks"), vec![Key::from(1)]);
    assert!(engine
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::Complete { transaction } if *transaction == txn)));
}

#[test]
fn test_abort_before_start_fails_queued_requests() {
    let (host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["ticks"], TransactionMode::ReadWrite).unwrap();
    let put = engine.object_store(txn, "ticks").unwrap().put(Value::from("a"), None).unwrap();
    engine.abort(txn).unwrap();
    assert!(matches!(engine.take_outcome(put), Some(Err(Error::Abort(_)))));
    engine.run_until_idle().unwrap();
    assert!(host.borrow().keys("counters", "ticks").is_empty());
}

#[test]
fn test_unique_index_checks_remote_rows() {
    let (_host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    engine.object_store(txn, "users").unwrap().put(user(1, "a@x"), None).unwrap();
    engine.run_until_idle().unwrap();

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    let mut users = engine.object_store(txn, "users").unwrap();
    let overwrite = users.put(user(1, "a@x"), None).unwrap();
    let clash = users.put(user(2, "a@x"), None).unwrap();
    engine.run_until_idle().unwrap();

    assert_eq!(settled(&mut engine, overwrite), Output::Key(Key::from(1)));
    assert!(matches!(engine.take_outcome(clash), Some(Err(Error::Constraint(_)))));
}

#[test]
fn test_schema_changes_need_an_upgrade() {
    let (_host, mut engine) = setup();
    let conn = counters(&mut engine);

    let txn = engine.transaction(conn, &["users"], TransactionMode::ReadWrite).unwrap();
    assert!(matches!(
        engine.create_object_store(txn, "extra", None, false),
        Err(Error::InvalidState(_))
    ));
    let mut users = engine.object_store(txn, "users").unwrap();
    assert!(matches!(
        users.create_index("by_name", "name", IndexFlags::empty()),
        Err(Error::InvalidState(_))
    ));
    engine.run_until_idle().unwrap();
}

#[test]
fn test_upgrade_validates_schema_calls() {
    let (_host, mut engine) = setup();
    let checked = Rc::new(Cell::new(false));
    let flag = Rc::clone(&checked);
    open_with(&mut engine, "checks", 1, move |engine, upgrade| {
        let txn = upgrade.transaction;
        engine.create_object_store(txn, "items", None, false)?;
        assert!(matches!(
            engine.create_object_store(txn, "items", None, false),
            Err(Error::Constraint(_))
        ));
        assert!(matches!(
            engine.create_object_store(txn, "empty_path", Some(KeyPath::from("")), true),
            Err(Error::InvalidAccess(_))
        ));
        assert!(matches!(
            engine.create_object_store(txn, "bad_path", Some(KeyPath::from("1x")), false),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(engine.delete_object_store(txn, "nope"), Err(Error::NotFound(_))));
        flag.set(true);
        Ok(())
    });
    assert!(checked.get());
}
