use std::thread;
use std::time::{Duration, Instant};

use x07_ext_db_stmt::{CancelReason, Error, StmtConfig};

mod common;

use common::{connect, wait_until};

fn reason(err: Error) -> CancelReason {
    match err {
        Error::Cancelled { reason, .. } => reason,
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn query_timeout_cancels_a_slow_statement() {
    common::init_tracing();
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    stmt.set_query_timeout(Duration::from_millis(50)).unwrap();

    let started = Instant::now();
    let err = stmt.execute_query_sql("SELECT SLEEP(5)").unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(server.cancels(), 1);
    assert!(!stmt.is_executing());

    stmt.set_query_timeout(Duration::ZERO).unwrap();
    assert!(stmt.execute_sql("SELECT 1").unwrap());
}

#[test]
fn default_timeout_comes_from_config() {
    let (_server, conn) = connect(StmtConfig {
        default_query_timeout_ms: 40,
        ..StmtConfig::default()
    });
    let stmt = conn.create_statement().unwrap();
    assert_eq!(stmt.query_timeout(), Duration::from_millis(40));
    let err = stmt.execute_sql("SELECT SLEEP(5)").unwrap_err();
    assert_eq!(reason(err), CancelReason::Timeout);
}

#[test]
fn fast_statement_beats_its_deadline() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.prepare("INSERT INTO t (v) VALUES (?)").unwrap();
    stmt.set_query_timeout(Duration::from_millis(30)).unwrap();
    stmt.set_param(1, "a").unwrap();
    assert_eq!(stmt.execute_update().unwrap(), 1);

    thread::sleep(Duration::from_millis(80));
    assert_eq!(server.cancels(), 0);
    assert_eq!(server.table_ids(), vec![1]);
}

#[test]
fn explicit_cancel_is_distinguishable_from_timeout() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    let runner = stmt.clone();
    let worker = thread::spawn(move || runner.execute_sql("SELECT SLEEP(5)"));

    wait_until(|| server.is_running());
    stmt.cancel();
    stmt.cancel();
    let err = worker.join().unwrap().unwrap_err();
    assert_eq!(reason(err), CancelReason::Explicit);
    assert_eq!(server.cancels(), 1);
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    assert!(stmt.execute_sql("SELECT 1").unwrap());
    stmt.cancel();
    assert_eq!(server.cancels(), 0);
    assert!(stmt.execute_sql("SELECT 1").unwrap());
}

#[test]
fn cancel_on_closed_connection_is_a_no_op() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    conn.close();
    stmt.cancel();
    assert_eq!(server.cancels(), 0);
}

#[test]
fn closing_the_connection_cancels_in_flight_work() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    let runner = stmt.clone();
    let worker = thread::spawn(move || runner.execute_sql("SELECT SLEEP(5)"));

    wait_until(|| server.is_running());
    conn.close();
    let err = worker.join().unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    assert!(stmt.is_closed());
}

#[test]
fn timeout_against_a_dead_transport_skips_the_wire_cancel() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    stmt.set_query_timeout(Duration::from_millis(20)).unwrap();
    server.disconnect();
    let err = stmt.execute_sql("SELECT 1").unwrap_err();
    assert!(matches!(err, Error::Communications { .. }), "{err:?}");
    thread::sleep(Duration::from_millis(60));
    assert_eq!(server.cancels(), 0);
}

#[test]
fn batch_is_cancelled_by_timeout() {
    let (_server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    stmt.set_query_timeout(Duration::from_millis(50)).unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('a')").unwrap();
    stmt.add_batch_sql("SELECT SLEEP(5)").unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('c')").unwrap();
    let err = stmt.execute_batch().unwrap_err();
    assert_eq!(reason(err), CancelReason::Timeout);
}
