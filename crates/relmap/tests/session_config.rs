//! Mappings and session settings loaded from JSON, and how the settings
//! change session behavior.

use asupersync::runtime::RuntimeBuilder;
use relmap::prelude::*;
use std::sync::Mutex;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn run<T>(f: impl std::future::Future<Output = T>) -> T {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f)
}

const MAPPING: &str = r#"[
    {"name": "Shelf", "table": "shelf",
     "columns": [
        {"name": "id", "primary_key": true, "auto_increment": true, "nullable": false},
        {"name": "label", "nullable": false}
     ],
     "relationships": [{
        "name": "books", "target": "Book", "kind": "OneToMany", "uselist": true,
        "foreign_key": ["shelf_id"], "cascade": "all, delete-orphan",
        "back_populates": "shelf"
     }]},
    {"name": "Book", "table": "book",
     "columns": [
        {"name": "id", "primary_key": true, "auto_increment": true, "nullable": false},
        {"name": "title"},
        {"name": "shelf_id", "nullable": false}
     ],
     "relationships": [{
        "name": "shelf", "target": "Shelf", "kind": "ManyToOne", "uselist": false,
        "foreign_key": ["shelf_id"], "back_populates": "books"
     }]}
]"#;

fn session_with(config: SessionConfig) -> (Session<MemoryConnection>, MemoryConnection) {
    let mapper = Arc::new(MapperRegistry::from_json(MAPPING).unwrap());
    let conn = MemoryConnection::new(mapper.as_ref());
    (Session::with_config(conn.clone(), mapper, config), conn)
}

#[test]
fn config_deserializes_with_defaults_for_missing_fields() {
    let config: SessionConfig =
        serde_json::from_str(r#"{"autoflush": true, "identity_conflict": "warn"}"#).unwrap();
    assert!(config.autoflush);
    assert!(config.autobegin);
    assert!(config.expire_on_commit);
    assert_eq!(config.identity_conflict, relmap::IdentityConflictPolicy::Warn);
    assert_eq!(
        config.unloaded_collections,
        relmap::UnloadedCollectionPolicy::DeferToDatabase
    );
}

#[test]
fn json_mapping_drives_a_parent_child_flush() {
    let (mut session, conn) = session_with(SessionConfig::default());
    let cx = Cx::for_testing();
    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Fiction").unwrap();
    for title in ["Dune", "Kindred"] {
        let book = session.new_instance("Book").unwrap();
        session.set(book, "title", title).unwrap();
        session.append(shelf, "books", book).unwrap();
    }
    session.add(shelf).unwrap();
    assert_eq!(session.new_instances().len(), 3);

    run(async {
        unwrap_outcome(session.commit(&cx).await);
    });
    assert_eq!(conn.row_count("shelf"), 1);
    assert_eq!(conn.row_count("book"), 2);
}

#[test]
fn autoflush_writes_pending_work_before_lookup() {
    let (mut session, conn) = session_with(SessionConfig::default().autoflush(true));
    let cx = Cx::for_testing();
    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Poetry").unwrap();
    session.add(shelf).unwrap();

    run(async {
        let missing = unwrap_outcome(session.get(&cx, "Shelf", &[Value::BigInt(99)]).await);
        assert!(missing.is_none());
    });
    assert_eq!(conn.row_count("shelf"), 1);
    assert_eq!(session.state(shelf).unwrap(), InstanceState::Persistent);
}

#[test]
fn without_autoflush_lookup_leaves_pending_work_alone() {
    let (mut session, conn) = session_with(SessionConfig::default());
    let cx = Cx::for_testing();
    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Poetry").unwrap();
    session.add(shelf).unwrap();

    run(async {
        unwrap_outcome(session.get(&cx, "Shelf", &[Value::BigInt(99)]).await);
    });
    assert_eq!(conn.row_count("shelf"), 0);
    assert_eq!(session.state(shelf).unwrap(), InstanceState::Pending);
}

#[test]
fn commit_keeps_state_loaded_when_expiry_is_off() {
    let (mut session, _conn) = session_with(SessionConfig::default().expire_on_commit(false));
    let cx = Cx::for_testing();
    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Drama").unwrap();
    session.add(shelf).unwrap();

    run(async {
        unwrap_outcome(session.commit(&cx).await);
    });
    let instance = session.instance(shelf).unwrap();
    assert!(instance.is_loaded("label"));
    assert!(!instance.is_modified());
}

#[test]
fn after_flush_hook_sees_counts() {
    let (mut session, _conn) = session_with(SessionConfig::default());
    let cx = Cx::for_testing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    session.on_after_flush(move |result| {
        sink.lock().unwrap().push(result.inserted);
        Ok(())
    });

    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Essays").unwrap();
    session.add(shelf).unwrap();
    run(async {
        unwrap_outcome(session.flush(&cx).await);
    });
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[test]
fn rollback_hook_runs_after_state_is_restored() {
    let (mut session, _conn) = session_with(SessionConfig::default());
    let cx = Cx::for_testing();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    session.on_after_rollback(move || {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    let shelf = session.new_instance("Shelf").unwrap();
    session.set(shelf, "label", "Maps").unwrap();
    session.add(shelf).unwrap();
    run(async {
        unwrap_outcome(session.flush(&cx).await);
        unwrap_outcome(session.rollback(&cx).await);
    });
    assert_eq!(*calls.lock().unwrap(), 1);
    assert_eq!(session.state(shelf).unwrap(), InstanceState::Transient);
}
