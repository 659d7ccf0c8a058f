//! Primary-key, unique-index and foreign-key enforcement.

use quilldb::{Dispatcher, ErrorKind, Outcome};
use tempfile::TempDir;

fn open() -> (TempDir, Dispatcher) {
    let dir = TempDir::new().unwrap();
    let d = Dispatcher::open(dir.path()).unwrap();
    (dir, d)
}

fn query(d: &Dispatcher, sql: &str) -> Vec<Vec<String>> {
    let out = d.execute("test", sql).unwrap();
    match out.last().unwrap() {
        Outcome::Rows(out) => out.rows.iter().map(|r| r.values.clone()).collect(),
        other => panic!("expected rows, got {other:?}"),
    }
}

fn setup_parent_child(d: &Dispatcher) {
    d.execute("test", "CREATE TABLE parent(id int primary key)")
        .unwrap();
    d.execute(
        "test",
        "CREATE TABLE child(pid int, CONSTRAINT fk FOREIGN KEY(pid) REFERENCES parent(id))",
    )
    .unwrap();
    d.execute("test", "INSERT INTO parent VALUES(1)").unwrap();
    d.execute("test", "INSERT INTO child VALUES(1)").unwrap();
}

#[test]
fn test_fk_restrict_on_delete() {
    let (_dir, d) = open();
    setup_parent_child(&d);

    let err = d
        .execute("test", "DELETE FROM parent WHERE id=1")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(query(&d, "SELECT COUNT(*) FROM parent"), vec![vec!["1"]]);
    assert_eq!(query(&d, "SELECT COUNT(*) FROM child"), vec![vec!["1"]]);
}

#[test]
fn test_fk_cascade_on_delete() {
    let (_dir, d) = open();
    setup_parent_child(&d);
    d.execute("test", "INSERT INTO parent VALUES(2)").unwrap();
    d.execute("test", "INSERT INTO child VALUES(2)").unwrap();

    d.execute("test", "DELETE FROM parent WHERE id=1 CASCADE")
        .unwrap();
    assert_eq!(query(&d, "SELECT id FROM parent"), vec![vec!["2"]]);
    assert_eq!(query(&d, "SELECT pid FROM child"), vec![vec!["2"]]);
}

#[test]
fn test_fk_set_null_on_delete() {
    let (_dir, d) = open();
    setup_parent_child(&d);

    d.execute("test", "DELETE FROM parent WHERE id=1 SET NULL")
        .unwrap();
    assert_eq!(query(&d, "SELECT COUNT(*) FROM parent"), vec![vec!["0"]]);
    assert_eq!(query(&d, "SELECT pid FROM child"), vec![vec!["NULL"]]);
}

#[test]
fn test_fk_set_null_rejected_for_not_null_column() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE parent(id int primary key)")
        .unwrap();
    d.execute(
        "test",
        "CREATE TABLE child(pid int NOT NULL, \
         CONSTRAINT fk FOREIGN KEY(pid) REFERENCES parent(id))",
    )
    .unwrap();
    d.execute("test", "INSERT INTO parent VALUES(1)").unwrap();
    d.execute("test", "INSERT INTO child VALUES(1)").unwrap();

    let err = d
        .execute("test", "DELETE FROM parent WHERE id=1 SET NULL")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(query(&d, "SELECT COUNT(*) FROM child"), vec![vec!["1"]]);
}

#[test]
fn test_fk_checked_on_insert_and_update() {
    let (_dir, d) = open();
    setup_parent_child(&d);

    let err = d.execute("test", "INSERT INTO child VALUES(7)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = d
        .execute("test", "UPDATE child SET pid=7 WHERE pid=1")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // NULL foreign keys are allowed.
    d.execute("test", "INSERT INTO child VALUES(NULL)").unwrap();
    d.execute("test", "UPDATE child SET pid=1 WHERE pid=NULL")
        .unwrap();
}

#[test]
fn test_fk_validation_at_create() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE parent(id int primary key)")
        .unwrap();

    // Unknown referenced table.
    let err = d
        .execute(
            "test",
            "CREATE TABLE c1(pid int, FOREIGN KEY(pid) REFERENCES ghost(id))",
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Referenced column set must be unique on the referenced side.
    d.execute("test", "CREATE TABLE plain(x int)").unwrap();
    let err = d
        .execute(
            "test",
            "CREATE TABLE c2(pid int, FOREIGN KEY(pid) REFERENCES plain(x))",
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Type mismatch.
    let err = d
        .execute(
            "test",
            "CREATE TABLE c3(pid char[4], FOREIGN KEY(pid) REFERENCES parent(id))",
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_add_foreign_key_validates_existing_rows() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE parent(id int primary key)")
        .unwrap();
    d.execute("test", "CREATE TABLE child(pid int)").unwrap();
    d.execute("test", "INSERT INTO parent VALUES(1)").unwrap();
    d.execute("test", "INSERT INTO child VALUES(9)").unwrap();

    let err = d
        .execute(
            "test",
            "ALTER TABLE child ADD CONSTRAINT fk FOREIGN KEY(pid) REFERENCES parent(id)",
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    d.execute("test", "UPDATE child SET pid=1 WHERE pid=9").unwrap();
    d.execute(
        "test",
        "ALTER TABLE child ADD CONSTRAINT fk FOREIGN KEY(pid) REFERENCES parent(id)",
    )
    .unwrap();
    d.execute("test", "ALTER TABLE child DROP FOREIGN KEY fk")
        .unwrap();
    d.execute("test", "INSERT INTO child VALUES(42)").unwrap();
}

#[test]
fn test_drop_table_referential_actions() {
    let (_dir, d) = open();
    setup_parent_child(&d);

    // Default is RESTRICT.
    let err = d.execute("test", "DROP TABLE parent").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    d.execute("test", "DROP TABLE parent CASCADE").unwrap();
    assert_eq!(query(&d, "SELECT COUNT(*) FROM child"), vec![vec!["0"]]);
    let err = d.execute("test", "SELECT * FROM parent").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The referring constraint went away with the table.
    d.execute("test", "INSERT INTO child VALUES(123)").unwrap();
}

#[test]
fn test_unique_index_rejects_duplicates() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE t (id int primary key, email char[16])")
        .unwrap();
    d.execute("test", "INSERT INTO t VALUES(1,'a@x'),(2,'a@x')")
        .unwrap();

    // Existing duplicates block unique index creation.
    let err = d
        .execute("test", "CREATE UNIQUE INDEX uniq_email ON t(email)")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    d.execute("test", "DELETE FROM t WHERE id=2").unwrap();
    d.execute("test", "CREATE UNIQUE INDEX uniq_email ON t(email)")
        .unwrap();

    d.execute("test", "DROP INDEX uniq_email ON t").unwrap();
    let err = d.execute("test", "DROP INDEX uniq_email ON t").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_pk_uniqueness_within_batch() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE t (id int primary key)")
        .unwrap();
    let err = d
        .execute("test", "INSERT INTO t VALUES(1),(1)")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(query(&d, "SELECT COUNT(*) FROM t"), vec![vec!["0"]]);
}

#[test]
fn test_not_null_enforced_on_insert() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE t (id int primary key, name char[8] NOT NULL)")
        .unwrap();
    let err = d
        .execute("test", "INSERT INTO t VALUES(1, NULL)")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // Omitting a non-nullable column from the column list fails too.
    let err = d.execute("test", "INSERT INTO t (id) VALUES(1)").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    d.execute("test", "INSERT INTO t (name, id) VALUES('a', 1)")
        .unwrap();
    assert_eq!(query(&d, "SELECT name FROM t WHERE id=1"), vec![vec!["a"]]);
}

#[test]
fn test_update_cannot_duplicate_pk() {
    let (_dir, d) = open();
    d.execute("test", "CREATE TABLE t (id int primary key)")
        .unwrap();
    d.execute("test", "INSERT INTO t VALUES(1),(2)").unwrap();
    let err = d
        .execute("test", "UPDATE t SET id=1 WHERE id=2")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_drop_database_restrict_blocked_by_fks() {
    let (_dir, d) = open();
    d.execute("test", "CREATE DATABASE shop").unwrap();
    d.execute("test", "USE shop").unwrap();
    setup_parent_child(&d);

    let err = d.execute("test", "DROP DATABASE shop").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    d.execute("test", "DROP DATABASE shop CASCADE").unwrap();
    let err = d.execute("test", "SELECT * FROM parent").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
