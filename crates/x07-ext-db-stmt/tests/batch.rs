use proptest::prelude::*;
use x07_ext_db_stmt::{
    Connection, Error, StatementHandle, StmtConfig, Value, EXECUTE_FAILED, SUCCESS_NO_INFO,
};

mod common;

use common::{connect, key_column, rewrite_config, Call, POISON};

const INSERT_V: &str = "INSERT INTO t (v) VALUES (?)";
const UPSERT: &str = "INSERT INTO t (id, v) VALUES (?, ?) ON DUPLICATE KEY UPDATE v = VALUES(v)";

fn config(rewrite: bool, continue_on_error: bool) -> StmtConfig {
    StmtConfig {
        rewrite_batched_statements: rewrite,
        continue_batch_on_error: continue_on_error,
        ..StmtConfig::default()
    }
}

fn queue_values(conn: &Connection, values: &[&str]) -> StatementHandle {
    let stmt = conn.prepare(INSERT_V).unwrap();
    for v in values {
        stmt.set_param(1, *v).unwrap();
        stmt.add_batch().unwrap();
    }
    stmt
}

fn partial_failure(err: Error) -> x07_ext_db_stmt::BatchFailure {
    match err {
        Error::BatchPartialFailure(f) => f,
        other => panic!("expected batch partial failure, got {other:?}"),
    }
}

#[test]
fn five_row_auto_increment_batch_gives_keys_one_to_five() {
    common::init_tracing();
    for rewrite in [false, true] {
        let (server, conn) = connect(config(rewrite, true));
        let stmt = queue_values(&conn, &["a", "b", "c", "d", "e"]);

        let counts = stmt.execute_batch().unwrap();
        let expected = if rewrite {
            vec![SUCCESS_NO_INFO; 5]
        } else {
            vec![1; 5]
        };
        assert_eq!(counts, expected, "rewrite={rewrite}");
        assert_eq!(key_column(&stmt.generated_keys().unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(server.executes(), if rewrite { 1 } else { 5 });
        assert_eq!(server.table_ids(), vec![1, 2, 3, 4, 5]);
    }
}

#[test]
fn upsert_batch_reports_keys_only_for_inserted_rows() {
    for rewrite in [false, true] {
        let (server, conn) = connect(config(rewrite, true));
        server.seed_row(2, "old");
        server.seed_row(4, "old");

        let stmt = conn.prepare(UPSERT).unwrap();
        for id in 1..=5i64 {
            stmt.set_param(1, id).unwrap();
            stmt.set_param(2, format!("v{id}")).unwrap();
            stmt.add_batch().unwrap();
        }
        let counts = stmt.execute_batch().unwrap();
        if rewrite {
            assert_eq!(counts, vec![SUCCESS_NO_INFO; 5]);
        } else {
            assert_eq!(counts, vec![1, 2, 1, 2, 1]);
        }
        assert_eq!(key_column(&stmt.generated_keys().unwrap()), vec![1, 3, 5]);
        assert_eq!(server.table_value(4), Some(Value::from("v4")));
    }
}

#[test]
fn continue_on_error_runs_every_item() {
    let (server, conn) = connect(config(false, true));
    let stmt = queue_values(&conn, &["a", "b", POISON, "d", "e"]);

    let failure = partial_failure(stmt.execute_batch().unwrap_err());
    assert_eq!(failure.counts, vec![1, 1, EXECUTE_FAILED, 1, 1]);
    assert_eq!(failure.failures.len(), 1);
    assert_eq!(failure.failures[0].index, 2);
    assert!(matches!(
        failure.failures[0].error,
        Error::Server {
            code: 1366,
            batch_index: Some(2),
            ..
        }
    ));
    assert_eq!(server.executes(), 5);
    assert_eq!(key_column(&stmt.generated_keys().unwrap()), vec![1, 2, 3, 4]);
}

#[test]
fn stop_on_error_marks_the_rest_failed() {
    let (server, conn) = connect(config(false, false));
    let stmt = queue_values(&conn, &["a", "b", POISON, "d", "e"]);

    let failure = partial_failure(stmt.execute_batch().unwrap_err());
    assert_eq!(
        failure.counts,
        vec![1, 1, EXECUTE_FAILED, EXECUTE_FAILED, EXECUTE_FAILED]
    );
    assert_eq!(failure.failures.len(), 1);
    assert_eq!(server.executes(), 3);
    assert_eq!(server.table_ids(), vec![1, 2]);
}

#[test]
fn failed_merged_statement_fails_all_of_its_items() {
    let (server, conn) = connect(config(true, true));
    let stmt = queue_values(&conn, &["a", POISON, "c"]);

    let failure = partial_failure(stmt.execute_batch().unwrap_err());
    assert_eq!(failure.counts, vec![EXECUTE_FAILED; 3]);
    assert_eq!(failure.failures[0].index, 0);
    assert!(server.table_ids().is_empty());
}

#[test]
fn literal_items_run_one_by_one() {
    let (server, conn) = connect(rewrite_config());
    let stmt = conn.create_statement().unwrap();
    for _ in 0..3 {
        stmt.add_batch_sql("INSERT INTO t (v) VALUES ('x')").unwrap();
    }
    assert_eq!(stmt.execute_batch().unwrap(), vec![1, 1, 1]);
    assert_eq!(key_column(&stmt.generated_keys().unwrap()), vec![1, 2, 3]);
    let queries = server
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Query(_)))
        .count();
    assert_eq!(queries, 3);
    assert!(server.prepares().is_empty());
}

#[test]
fn parameter_batch_on_plain_statement_is_rejected() {
    let (_server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    assert!(matches!(stmt.add_batch(), Err(Error::IllegalArgument(_))));
}

#[test]
fn communications_failure_aborts_even_when_continuing() {
    let (server, conn) = connect(config(false, true));
    server.fail_communications_on("'lost'");
    let stmt = conn.create_statement().unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('a')").unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('lost')").unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('c')").unwrap();

    let err = stmt.execute_batch().unwrap_err();
    assert!(matches!(err, Error::Communications { .. }), "{err:?}");
    let queries = server
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Query(_)))
        .count();
    assert_eq!(queries, 2);
}

#[test]
fn packet_budget_splits_rewritten_batch() {
    let (server, conn) = connect(StmtConfig {
        rewrite_batched_statements: true,
        max_packet_bytes: 1024,
        ..StmtConfig::default()
    });
    let wide = "w".repeat(200);
    let stmt = conn.prepare(INSERT_V).unwrap();
    for _ in 0..10 {
        stmt.set_param(1, wide.as_str()).unwrap();
        stmt.add_batch().unwrap();
    }
    let counts = stmt.execute_batch().unwrap();
    assert_eq!(counts.len(), 10);
    assert_eq!(server.executes(), 3);
    assert_eq!(
        key_column(&stmt.generated_keys().unwrap()),
        (1..=10).collect::<Vec<u64>>()
    );
}

#[test]
fn merged_statements_are_reused_through_the_cache() {
    let (server, conn) = connect(StmtConfig {
        rewrite_batched_statements: true,
        cache_prepared_statements: true,
        ..StmtConfig::default()
    });
    let stmt = conn.prepare(INSERT_V).unwrap();
    for round in 0..2 {
        for i in 0..3 {
            stmt.set_param(1, format!("{round}-{i}")).unwrap();
            stmt.add_batch().unwrap();
        }
        stmt.execute_batch().unwrap();
    }
    assert_eq!(
        server.prepares(),
        vec![
            INSERT_V.to_string(),
            "INSERT INTO t (v) VALUES (?), (?), (?)".to_string()
        ]
    );
    assert!(conn.cache_stats().unwrap().hits >= 1);
}

#[test]
fn empty_batch_returns_no_counts() {
    let (server, conn) = connect(rewrite_config());
    let stmt = conn.prepare(INSERT_V).unwrap();
    assert!(stmt.execute_batch().unwrap().is_empty());
    assert!(key_column(&stmt.generated_keys().unwrap()).is_empty());
    assert_eq!(server.executes(), 0);
}

#[test]
fn clear_batch_drops_queued_items() {
    let (server, conn) = connect(StmtConfig::default());
    let stmt = queue_values(&conn, &["a", "b"]);
    assert_eq!(stmt.batch_len(), 2);
    stmt.clear_batch().unwrap();
    assert!(stmt.execute_batch().unwrap().is_empty());
    assert_eq!(server.executes(), 0);
}

#[test]
fn strict_truncation_fails_the_item() {
    let (server, conn) = connect(StmtConfig::default());
    server.set_column_width(4);
    let stmt = queue_values(&conn, &["ok", "far too long"]);
    let failure = partial_failure(stmt.execute_batch().unwrap_err());
    assert_eq!(failure.counts, vec![1, EXECUTE_FAILED]);
    assert!(matches!(failure.failures[0].error, Error::Truncation { .. }));
    assert!(stmt.warnings().unwrap().iter().any(|w| w.code == 1265));
}

#[test]
fn result_producing_batch_item_is_an_item_failure() {
    let (_server, conn) = connect(StmtConfig::default());
    let stmt = conn.create_statement().unwrap();
    stmt.add_batch_sql("SELECT 1").unwrap();
    stmt.add_batch_sql("INSERT INTO t (v) VALUES ('a')").unwrap();
    let failure = partial_failure(stmt.execute_batch().unwrap_err());
    assert_eq!(failure.counts, vec![EXECUTE_FAILED, 1]);
}

#[test]
fn missing_parameter_is_rejected_before_queueing() {
    let (_server, conn) = connect(StmtConfig::default());
    let stmt = conn.prepare(UPSERT).unwrap();
    stmt.set_param(1, 1).unwrap();
    assert!(matches!(stmt.add_batch(), Err(Error::IllegalArgument(_))));
    assert!(matches!(stmt.set_param(3, 1), Err(Error::IllegalArgument(_))));
    assert!(matches!(stmt.set_param(0, 1), Err(Error::IllegalArgument(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn counts_and_keys_match_item_count(
        n in 0usize..40,
        rewrite in any::<bool>(),
        width in 1usize..200,
    ) {
        let (_server, conn) = connect(StmtConfig {
            rewrite_batched_statements: rewrite,
            max_packet_bytes: 1024,
            ..StmtConfig::default()
        });
        let value = "x".repeat(width);
        let stmt = conn.prepare(INSERT_V).unwrap();
        for _ in 0..n {
            stmt.set_param(1, value.as_str()).unwrap();
            stmt.add_batch().unwrap();
        }
        let counts = stmt.execute_batch().unwrap();
        prop_assert_eq!(counts.len(), n);
        let keys = key_column(&stmt.generated_keys().unwrap());
        prop_assert_eq!(keys, (1..=n as u64).collect::<Vec<_>>());
    }

    #[test]
    fn failures_never_change_count_length(
        n in 1usize..20,
        bad in 0usize..20,
        rewrite in any::<bool>(),
        keep_going in any::<bool>(),
    ) {
        let bad = bad % n;
        let (_server, conn) = connect(config(rewrite, keep_going));
        let stmt = conn.prepare(INSERT_V).unwrap();
        for i in 0..n {
            if i == bad {
                stmt.set_param(1, POISON).unwrap();
            } else {
                stmt.set_param(1, "fine").unwrap();
            }
            stmt.add_batch().unwrap();
        }
        match stmt.execute_batch() {
            Err(Error::BatchPartialFailure(f)) => {
                prop_assert_eq!(f.counts.len(), n);
                prop_assert_eq!(f.counts[bad], EXECUTE_FAILED);
                prop_assert!(!f.failures.is_empty());
            }
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
    }
}
