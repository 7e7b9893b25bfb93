//! Pipelined commands against the scripted server.

use std::sync::Arc;

use mariadb_client::testing::{FakeServer, Reply};
use mariadb_client::{BatchOutcome, Command, Completion, Connection, Error, Value};

fn connect(server: &FakeServer) -> Connection {
    Connection::connect(Arc::new(server.configuration()), server.address()).unwrap()
}

#[test]
fn test_pipeline_returns_results_in_order() {
    let server = FakeServer::start();
    server.on_query("SELECT name", Reply::rows(&["name"], &[&[Some("ada")]]));
    server.on_query("INSERT", Reply::ok(1, 42));
    let conn = connect(&server);

    let mut results = conn
        .execute_pipeline(&[
            Command::query("INSERT INTO people (name) VALUES ('ada')"),
            Command::query("SELECT name FROM people"),
            Command::Ping,
        ])
        .unwrap();
    assert_eq!(results.len(), 3);
    match &results[0][0] {
        Completion::Update(ok) => assert_eq!(ok.last_insert_id, 42),
        other => panic!("unexpected completion: {other:?}"),
    }
    let rows = results.remove(1).remove(0).into_result_set().unwrap().into_rows();
    assert_eq!(rows[0].get::<String>(0).unwrap(), "ada");
}

#[test]
fn test_transient_failure_mid_pipeline() {
    let server = FakeServer::start();
    server.on_query("SELECT 2", Reply::Disconnect);
    let conn = connect(&server);

    let err = conn
        .execute_pipeline(&[
            Command::query("SELECT 1"),
            Command::query("SELECT 2"),
            Command::query("SELECT 3"),
        ])
        .unwrap_err();
    let Error::Batch(batch) = &err else {
        panic!("expected a batch error, got {err:?}");
    };
    assert_eq!(
        batch.outcomes,
        vec![
            BatchOutcome::Succeeded,
            BatchOutcome::Failed,
            BatchOutcome::Discarded
        ]
    );
    assert_eq!(batch.failed_index(), Some(1));
    assert!(batch.cause.is_transient());
    assert!(err.is_transient());
    assert!(conn.is_closed());
}

#[test]
fn test_server_error_mid_pipeline_drains_the_rest() {
    let server = FakeServer::start();
    server.on_query("BROKEN", Reply::error(1146, "42S02", "Table 'shop.nope' doesn't exist"));
    let conn = connect(&server);

    let err = conn
        .execute_pipeline(&[
            Command::query("BROKEN SELECT"),
            Command::query("SELECT 2"),
        ])
        .unwrap_err();
    let Error::Batch(batch) = &err else {
        panic!("expected a batch error, got {err:?}");
    };
    assert_eq!(batch.outcomes, vec![BatchOutcome::Failed, BatchOutcome::Discarded]);
    assert_eq!(err.code(), Some(1146));
    assert_eq!(err.sqlstate(), "42S02");

    // the second response was drained; the connection stays in sync
    assert!(!conn.is_closed());
    conn.ping().unwrap();
    assert_eq!(server.queries().last().map(String::as_str), Some("SELECT 2"));
}

#[test]
fn test_sequential_fallback_without_pipelining() {
    let server = FakeServer::start();
    let config = server.configuration().pipelining(false);
    let conn = Connection::connect(Arc::new(config), server.address()).unwrap();

    let results = conn
        .execute_pipeline(&[Command::query("SELECT 1"), Command::query("SELECT 2")])
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[test]
fn test_failed_pipeline_releases_cached_statements() {
    let server = FakeServer::start();
    server.on_query("UPDATE audit", Reply::error(1205, "HY000", "Lock wait timeout exceeded"));
    let conn = connect(&server);
    let insert = conn.prepare("INSERT INTO t VALUES (?)").unwrap();
    let audit = conn.prepare("UPDATE audit SET n = ?").unwrap();
    assert!(insert.is_cached() && audit.is_cached());

    let err = conn
        .execute_pipeline(&[
            Command::execute("INSERT INTO t VALUES (?)", vec![Value::Int(1)]),
            Command::execute("UPDATE audit SET n = ?", vec![Value::Int(2)]),
            Command::execute("INSERT INTO t VALUES (?)", vec![Value::Int(3)]),
        ])
        .unwrap_err();
    let Error::Batch(batch) = &err else {
        panic!("expected a batch error, got {err:?}");
    };
    assert_eq!(batch.failed_index(), Some(1));
    assert_eq!(err.code(), Some(1205));

    for statement in [&insert, &audit] {
        assert_eq!(statement.use_count(), 0, "{}", statement.sql());
        assert!(statement.is_cached(), "{}", statement.sql());
    }
    conn.ping().unwrap();
    assert_eq!(server.prepare_count(), 2);
    assert_eq!(server.execute_count(), 3);
    assert_eq!(server.close_count(), 0);
}
