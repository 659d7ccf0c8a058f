//! Crash recovery: committed work survives a restart, losers vanish.
//!
//! A "crash" is dropping the dispatcher (losing every in-memory
//! counter, session and lock) and reopening over the same data root;
//! recovery replays the WAL before the new instance serves requests.

use quilldb::{Dispatcher, Outcome};
use tempfile::TempDir;

fn query(d: &Dispatcher, sql: &str) -> Vec<Vec<String>> {
    let out = d.execute("test", sql).unwrap();
    match out.last().unwrap() {
        Outcome::Rows(out) => out.rows.iter().map(|r| r.values.clone()).collect(),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[test]
fn test_committed_survive_active_vanish() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key, name char[8])")
            .unwrap();
        // Committed by autocommit.
        d.execute("a", "INSERT INTO t VALUES(4,'dee')").unwrap();
        // Transaction B: applied to the heap but never committed.
        d.execute("b", "BEGIN").unwrap();
        d.execute("b", "INSERT INTO t VALUES(5,'eve')").unwrap();
        // Crash: drop the engine with B still active.
    }

    let d = Dispatcher::open(dir.path()).unwrap();
    let data = query(&d, "SELECT id FROM t ORDER BY id");
    assert_eq!(data, vec![vec!["4"]]);
}

#[test]
fn test_uncommitted_update_rolls_back_on_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key, name char[8])")
            .unwrap();
        d.execute("a", "INSERT INTO t VALUES(1,'aaa')").unwrap();
        d.execute("b", "BEGIN").unwrap();
        d.execute("b", "UPDATE t SET name='zzz' WHERE id=1").unwrap();
    }

    let d = Dispatcher::open(dir.path()).unwrap();
    assert_eq!(
        query(&d, "SELECT name FROM t WHERE id=1"),
        vec![vec!["aaa"]]
    );
}

#[test]
fn test_uncommitted_delete_reappears_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key)").unwrap();
        d.execute("a", "INSERT INTO t VALUES(1),(2)").unwrap();
        d.execute("b", "BEGIN").unwrap();
        d.execute("b", "DELETE FROM t WHERE id=2").unwrap();
    }

    let d = Dispatcher::open(dir.path()).unwrap();
    assert_eq!(
        query(&d, "SELECT id FROM t ORDER BY id"),
        vec![vec!["1"], vec!["2"]]
    );
}

#[test]
fn test_recovery_is_idempotent_across_restarts() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key)").unwrap();
        d.execute("a", "INSERT INTO t VALUES(1)").unwrap();
        d.execute("a", "BEGIN; INSERT INTO t VALUES(2); COMMIT")
            .unwrap();
    }
    for _ in 0..3 {
        let d = Dispatcher::open(dir.path()).unwrap();
        assert_eq!(
            query(&d, "SELECT id FROM t ORDER BY id"),
            vec![vec!["1"], vec!["2"]]
        );
    }
}

#[test]
fn test_new_txn_ids_do_not_collide_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key)").unwrap();
        for i in 0..5 {
            d.execute("a", &format!("INSERT INTO t VALUES({i})")).unwrap();
        }
    }

    // The reopened engine keeps accepting writes; replay after a
    // second crash must not confuse old and new transactions.
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "INSERT INTO t VALUES(100)").unwrap();
    }
    let d = Dispatcher::open(dir.path()).unwrap();
    assert_eq!(query(&d, "SELECT COUNT(*) FROM t"), vec![vec!["6"]]);
}

#[test]
fn test_checkpoint_truncates_and_bounds_replay() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key)").unwrap();
        d.execute("a", "INSERT INTO t VALUES(1)").unwrap();
        d.execute("a", "CHECKPOINT").unwrap();
        d.execute("a", "INSERT INTO t VALUES(2)").unwrap();
    }

    // The WAL was truncated at the checkpoint; its backup remains.
    let wal = dir.path().join("default").join("default.wal");
    let bak = dir.path().join("default").join("default.wal.bak");
    assert!(bak.is_file());
    let wal_len = std::fs::metadata(&wal).unwrap().len();
    let bak_len = std::fs::metadata(&bak).unwrap().len();
    assert!(wal_len < bak_len);

    let d = Dispatcher::open(dir.path()).unwrap();
    assert_eq!(
        query(&d, "SELECT id FROM t ORDER BY id"),
        vec![vec!["1"], vec!["2"]]
    );
}

#[test]
fn test_savepoint_rollback_survives_crash() {
    let dir = TempDir::new().unwrap();
    {
        let d = Dispatcher::open(dir.path()).unwrap();
        d.execute("a", "CREATE TABLE t (id int primary key)").unwrap();
        d.execute(
            "a",
            "BEGIN; INSERT INTO t VALUES(1); SAVEPOINT s; INSERT INTO t VALUES(2); \
             ROLLBACK TO SAVEPOINT s; COMMIT",
        )
        .unwrap();
    }

    let d = Dispatcher::open(dir.path()).unwrap();
    assert_eq!(query(&d, "SELECT id FROM t"), vec![vec!["1"]]);
}
