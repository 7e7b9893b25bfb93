//! Failover scenarios against scripted servers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mariadb_client::testing::{FakeServer, Reply};
use mariadb_client::{Command, Configuration, ExecuteOptions, HaMode, HostAddress};
use mariadb_core::{Error, Value};
use mariadb_ha::{DenyList, Failover};

fn sequential(servers: &[&FakeServer]) -> Configuration {
    servers[0]
        .configuration()
        .hosts(servers.iter().map(|s| s.address()).collect())
        .ha_mode(HaMode::Sequential)
        .retries_all_down(0)
        .deny_timeout(Duration::from_secs(60))
}

fn replication(primary: &FakeServer, replica: &FakeServer) -> Configuration {
    primary
        .configuration()
        .hosts(vec![primary.address(), replica.replica_address()])
        .ha_mode(HaMode::Replication)
        .retries_all_down(0)
        .deny_timeout(Duration::from_millis(200))
}

fn connect(config: Configuration) -> Failover {
    Failover::with_deny_list(config, Arc::new(DenyList::new())).unwrap()
}

/// Statements logged from the first `BEGIN` on.
fn transaction_log(server: &FakeServer) -> Vec<String> {
    let log = server.queries();
    let start = log.iter().position(|q| q == "BEGIN").unwrap_or(log.len());
    log[start..].to_vec()
}

#[test]
fn test_transaction_replayed_after_primary_loss() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    b.on_query("SELECT id", Reply::rows(&["id"], &[&[Some("1")], &[Some("2")]]));
    let db = connect(sequential(&[&a, &b]).transaction_replay(true));

    db.query("BEGIN").unwrap();
    db.query("INSERT INTO t VALUES (1)").unwrap();
    db.query("INSERT INTO t VALUES (2)").unwrap();
    assert!(db.is_in_transaction());

    a.set_down(true);
    a.kill_connections();

    let rs = db
        .query("SELECT id FROM t")
        .unwrap()
        .remove(0)
        .into_result_set()
        .unwrap();
    assert_eq!(rs.len(), 2);
    assert_eq!(db.current_host(), Some(b.address()));
    assert_eq!(
        transaction_log(&b),
        vec![
            "BEGIN",
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (2)",
            "SELECT id FROM t",
        ]
    );
    assert!(db.is_in_transaction());
    db.commit().unwrap();
    assert!(!db.is_in_transaction());
}

#[test]
fn test_prepared_statements_replayed_on_new_host() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    let db = connect(sequential(&[&a, &b]).transaction_replay(true));

    db.query("BEGIN").unwrap();
    let single = db.prepare("INSERT INTO t VALUES (?)").unwrap();
    let insert_one = |n: i32| Command::ExecuteStatement {
        statement: single.clone(),
        params: vec![Value::Int(n)],
    };
    db.execute(&insert_one(1), &ExecuteOptions::default()).unwrap();
    db.execute_sql("INSERT INTO t VALUES (?, ?)", vec![Value::Int(2), Value::Int(3)])
        .unwrap();

    a.kill_connections();
    db.ping().unwrap();

    assert_eq!(db.current_host(), Some(b.address()));
    assert_eq!(
        transaction_log(&b),
        vec!["BEGIN", "INSERT INTO t VALUES (?)", "INSERT INTO t VALUES (?, ?)"]
    );
    assert_eq!(b.prepare_count(), 2);
    assert_eq!(b.execute_count(), 2);

    // the handle from the lost session runs on the statement prepared by replay
    db.execute(&insert_one(4), &ExecuteOptions::default()).unwrap();
    assert_eq!(b.prepare_count(), 2);
    assert_eq!(b.execute_count(), 3);
    assert!(db.is_in_transaction());
}

#[test]
fn test_streaming_rows_lost_with_connection() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    a.on_query("SELECT n", Reply::truncated(&["n"], &[&[Some("1")], &[Some("2")]]));
    let db = connect(sequential(&[&a, &b]));

    let mut rs = db
        .execute(&Command::query("SELECT n FROM t"), &ExecuteOptions::streaming(1))
        .unwrap()
        .remove(0)
        .into_result_set()
        .unwrap();
    assert_eq!(rs.len(), 1);
    assert!(db.fetch_more(&mut rs).unwrap());
    assert_eq!(rs.len(), 2);

    let err = db.fetch_more(&mut rs).unwrap_err();
    assert!(err.is_transient(), "{err:?}");
    assert_eq!(db.current_host(), Some(b.address()));
    db.ping().unwrap();
    assert!(matches!(db.fetch_more(&mut rs), Err(Error::State(_))));
}

#[test]
fn test_streaming_through_failover_handle() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    a.on_query("SELECT n", Reply::rows(&["n"], &[&[Some("1")], &[Some("2")], &[Some("3")]]));
    let db = connect(sequential(&[&a, &b]));

    let mut rs = db
        .execute(&Command::query("SELECT n FROM t"), &ExecuteOptions::streaming(2))
        .unwrap()
        .remove(0)
        .into_result_set()
        .unwrap();
    assert_eq!(rs.len(), 2);
    assert!(db.fetch_more(&mut rs).unwrap());
    assert!(!rs.is_streaming());
    assert_eq!(rs.into_rows().len(), 3);
    assert_eq!(db.current_host(), Some(a.address()));
}

#[test]
fn test_transaction_lost_without_replay() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    let db = connect(sequential(&[&a, &b]));

    db.query("BEGIN").unwrap();
    db.query("INSERT INTO t VALUES (1)").unwrap();
    a.kill_connections();

    let err = db.query("INSERT INTO t VALUES (2)").unwrap_err();
    assert!(matches!(err, Error::TransactionLost(_)), "{err:?}");
    assert_eq!(err.sqlstate(), "25S03");

    // connectivity itself recovered
    assert_eq!(db.current_host(), Some(b.address()));
    assert!(!db.is_in_transaction());
    db.ping().unwrap();
    assert!(transaction_log(&b).is_empty());
}

#[test]
fn test_commit_failure_is_reported() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    a.on_query("COMMIT", Reply::Disconnect);
    let db = connect(sequential(&[&a, &b]).transaction_replay(true));

    db.query("BEGIN").unwrap();
    db.query("UPDATE t SET n = 1").unwrap();
    let err = db.commit().unwrap_err();
    assert!(matches!(err, Error::TransactionLost(_)), "{err:?}");

    // nothing was replayed on the new host
    assert_eq!(db.current_host(), Some(b.address()));
    assert!(transaction_log(&b).is_empty());
    db.ping().unwrap();
}

#[test]
fn test_second_transient_failure_propagates() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    a.on_query("SELECT 1", Reply::Disconnect);
    b.on_query("SELECT 1", Reply::Disconnect);
    let db = connect(sequential(&[&a, &b]));

    let err = db.query("SELECT 1").unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[test]
fn test_read_only_switches_to_replica() {
    let primary = FakeServer::start();
    let replica = FakeServer::start();
    let db = connect(replication(&primary, &replica));
    assert_eq!(db.current_host(), Some(primary.address()));

    db.set_read_only(true).unwrap();
    assert_eq!(db.current_host(), Some(replica.replica_address()));

    db.query("BEGIN").unwrap();
    let err = db.set_read_only(true).unwrap_err();
    assert!(matches!(err, Error::State(_)), "{err:?}");
    db.rollback().unwrap();

    db.set_read_only(false).unwrap();
    assert_eq!(db.current_host(), Some(primary.address()));
}

#[test]
fn test_replica_outage_falls_back_to_primary() {
    let primary = FakeServer::start();
    let replica = FakeServer::start();
    replica.set_down(true);
    let db = connect(replication(&primary, &replica));

    db.set_read_only(true).unwrap();
    assert_eq!(db.current_host(), Some(primary.address()));
    assert!(
        primary
            .queries()
            .iter()
            .any(|q| q == "SET SESSION TRANSACTION READ ONLY")
    );

    // checked again on the first call after the retry time
    replica.set_down(false);
    thread::sleep(Duration::from_millis(300));
    db.ping().unwrap();
    assert_eq!(db.current_host(), Some(replica.replica_address()));
}

#[test]
fn test_denied_host_selectable_after_cool_down() {
    let a = FakeServer::start();
    let b = FakeServer::start();
    let deny = Arc::new(DenyList::new());
    let config = sequential(&[&a, &b]).deny_timeout(Duration::from_millis(300));

    let first = Failover::with_deny_list(config.clone(), deny.clone()).unwrap();
    a.kill_connections();
    first.ping().unwrap();
    assert_eq!(first.current_host(), Some(b.address()));

    let second = Failover::with_deny_list(config.clone(), deny.clone()).unwrap();
    assert_eq!(second.current_host(), Some(b.address()));

    thread::sleep(Duration::from_millis(400));
    let third = Failover::with_deny_list(config, deny.clone()).unwrap();
    assert_eq!(third.current_host(), Some(a.address()));
    assert!(!deny.is_denied(&a.address()));
}

#[test]
fn test_all_hosts_down_at_connect() {
    let a = FakeServer::start();
    a.set_down(true);
    let deny = Arc::new(DenyList::new());
    let err = Failover::with_deny_list(sequential(&[&a]), deny.clone()).unwrap_err();
    assert!(err.is_connection_error(), "{err:?}");
    assert!(!err.is_transient());
    assert!(deny.is_denied(&a.address()));
    assert!(!deny.is_denied(&HostAddress::new("127.0.0.1", 1)));
}
