//! Tests for the client recovery store: schema creation and migration,
//! grace-period state transitions, reclaim checks, and crash-safety of the
//! exclusive transactions.

use rusqlite::{params, Connection, TransactionBehavior};
use tempfile::TempDir;

use super::*;

// =============================================================================
// Test helpers
// =============================================================================

fn open_fresh() -> (TempDir, ClientStore, EpochPair) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, epochs) = ClientStore::open(dir.path()).expect("open fresh store");
    (dir, store, epochs)
}

/// Second connection to the same database, standing in for another process
/// inspecting (or racing) the store.
fn raw_conn(dir: &TempDir) -> Connection {
    Connection::open(dir.path().join(DB_FILENAME)).expect("open raw connection")
}

fn table_exists(conn: &Connection, name: &str) -> bool {
    let count: i64 = conn
        .query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .expect("query sqlite_master");
    count == 1
}

fn bucket_rows(conn: &Connection, name: &str) -> Vec<Vec<u8>> {
    let mut stmt = conn
        .prepare(&format!("SELECT id FROM \"{name}\" ORDER BY id"))
        .expect("prepare bucket scan");
    let rows = stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))
        .expect("scan bucket");
    rows.map(Result::unwrap).collect()
}

fn schema_version(conn: &Connection) -> String {
    conn.query_row(
        "SELECT value FROM parameters WHERE key = 'version'",
        [],
        |row| row.get(0),
    )
    .expect("read schema version")
}

fn fabricate_legacy(dir: &TempDir, version: &str, ids: &[&[u8]]) {
    let conn = raw_conn(dir);
    conn.execute_batch(
        "CREATE TABLE parameters (key TEXT PRIMARY KEY, value TEXT);
         CREATE TABLE clients (id BLOB PRIMARY KEY, time INTEGER);",
    )
    .expect("create legacy schema");
    conn.execute(
        "INSERT INTO parameters VALUES ('version', ?1)",
        params![version],
    )
    .expect("stamp legacy version");
    for id in ids {
        conn.execute(
            "INSERT INTO clients (id, time) VALUES (?1, 0)",
            params![*id],
        )
        .expect("seed legacy client");
    }
}

// =============================================================================
// Schema creation and reopen
// =============================================================================

#[test]
fn first_start_creates_schema() {
    let (dir, _store, epochs) = open_fresh();

    assert_eq!(epochs, EpochPair { current: 1, recovery: 0 });
    assert!(dir.path().join(DB_FILENAME).exists());

    let conn = raw_conn(&dir);
    assert_eq!(schema_version(&conn), LATEST_SCHEMA_VERSION.to_string());
    assert!(table_exists(&conn, "rec-0000000000000001"));
    assert!(bucket_rows(&conn, "rec-0000000000000001").is_empty());
}

#[test]
fn reopen_preserves_epochs() {
    let (dir, store, _) = open_fresh();
    drop(store);

    let (_store, epochs) = ClientStore::open(dir.path()).expect("reopen");
    assert_eq!(epochs, EpochPair { current: 1, recovery: 0 });
}

#[test]
fn open_refuses_non_directory_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file_path = dir.path().join("not-a-dir");
    std::fs::write(&file_path, b"x").expect("create file");

    let err = ClientStore::open(&file_path).expect_err("open must fail");
    assert!(matches!(err, StoreError::NotADirectory { .. }));
}

// =============================================================================
// Client records
// =============================================================================

#[test]
fn insert_is_idempotent() {
    let (dir, store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"alice").unwrap();
    store.insert_client(epochs.current, b"alice").unwrap();

    let conn = raw_conn(&dir);
    assert_eq!(
        bucket_rows(&conn, "rec-0000000000000001"),
        vec![b"alice".to_vec()]
    );
}

#[test]
fn remove_of_absent_client_succeeds() {
    let (_dir, store, epochs) = open_fresh();
    store.remove_client(epochs.current, b"ghost").unwrap();
}

#[test]
fn remove_deletes_the_record() {
    let (dir, store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"alice").unwrap();
    store.remove_client(epochs.current, b"alice").unwrap();

    let conn = raw_conn(&dir);
    assert!(bucket_rows(&conn, "rec-0000000000000001").is_empty());
}

#[test]
fn boundary_lengths_accepted_oversize_rejected() {
    let (_dir, store, epochs) = open_fresh();

    store.insert_client(epochs.current, b"").unwrap();
    store
        .insert_client(epochs.current, &vec![0xAB; OPAQUE_LIMIT])
        .unwrap();

    let err = store
        .insert_client(epochs.current, &vec![0u8; OPAQUE_LIMIT + 1])
        .expect_err("oversize id must be rejected");
    assert!(matches!(err, StoreError::InvalidClient { len } if len == OPAQUE_LIMIT + 1));
}

// =============================================================================
// Grace transitions
// =============================================================================

#[test]
fn grace_start_advances_epochs_and_creates_bucket() {
    let (dir, mut store, epochs) = open_fresh();

    let next = store.grace_start(epochs).unwrap();
    assert_eq!(next, EpochPair { current: 2, recovery: 1 });

    let conn = raw_conn(&dir);
    assert!(table_exists(&conn, "rec-0000000000000002"));
    assert!(bucket_rows(&conn, "rec-0000000000000002").is_empty());
}

#[test]
fn fresh_clients_are_not_reclaimable() {
    let (_dir, mut store, epochs) = open_fresh();
    let epochs = store.grace_start(epochs).unwrap();

    // alice connected after the reboot; she has nothing to reclaim.
    store.insert_client(epochs.current, b"alice").unwrap();
    assert_eq!(
        store.check_client(epochs, b"alice").unwrap(),
        CheckOutcome::Denied
    );
}

#[test]
fn reclaim_from_prior_boot() {
    let (dir, mut store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"bob").unwrap();

    let epochs = store.grace_start(epochs).unwrap();
    assert_eq!(epochs, EpochPair { current: 2, recovery: 1 });

    assert_eq!(
        store.check_client(epochs, b"bob").unwrap(),
        CheckOutcome::Allowed
    );
    {
        let conn = raw_conn(&dir);
        assert_eq!(
            bucket_rows(&conn, "rec-0000000000000002"),
            vec![b"bob".to_vec()]
        );
    }

    let epochs = store.grace_done(epochs).unwrap();
    assert_eq!(epochs, EpochPair { current: 2, recovery: 0 });
    let conn = raw_conn(&dir);
    assert!(!table_exists(&conn, "rec-0000000000000001"));
}

#[test]
fn check_outside_grace_is_denied() {
    let (_dir, store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"bob").unwrap();
    assert_eq!(
        store.check_client(epochs, b"bob").unwrap(),
        CheckOutcome::Denied
    );
}

#[test]
fn restart_in_grace_keeps_epochs_and_empties_current_bucket() {
    let (dir, mut store, epochs) = open_fresh();
    let epochs = store.grace_start(epochs).unwrap();
    store.insert_client(epochs.current, b"carol").unwrap();
    drop(store);

    // The daemon (and server) restart while the grace period is in force.
    let (mut store, epochs) = ClientStore::open(dir.path()).expect("reopen in grace");
    assert_eq!(epochs, EpochPair { current: 2, recovery: 1 });

    let next = store.grace_start(epochs).unwrap();
    assert_eq!(next, epochs);

    let conn = raw_conn(&dir);
    assert!(bucket_rows(&conn, "rec-0000000000000002").is_empty());
}

#[test]
fn grace_done_outside_grace_errors() {
    let (_dir, mut store, epochs) = open_fresh();
    assert!(matches!(
        store.grace_done(epochs),
        Err(StoreError::NotInGrace)
    ));
}

#[test]
fn iterate_empty_bucket_yields_nothing() {
    let (_dir, mut store, epochs) = open_fresh();
    let epochs = store.grace_start(epochs).unwrap();

    let mut seen = 0;
    let count = store
        .iterate_clients(epochs.recovery, |_| seen += 1)
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(seen, 0);
}

#[test]
fn iterate_streams_every_record() {
    let (_dir, mut store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"a").unwrap();
    store.insert_client(epochs.current, b"b").unwrap();
    let epochs = store.grace_start(epochs).unwrap();

    let mut seen = Vec::new();
    let count = store
        .iterate_clients(epochs.recovery, |id| seen.push(id.to_vec()))
        .unwrap();
    assert_eq!(count, 2);
    seen.sort();
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
}

// =============================================================================
// Schema migration
// =============================================================================

#[test]
fn migrates_v1_database_preserving_clients() {
    let dir = tempfile::tempdir().expect("tempdir");
    fabricate_legacy(&dir, "1", &[b"x", b"y"]);

    let (_store, epochs) = ClientStore::open(dir.path()).expect("open migrates");
    assert_eq!(epochs, EpochPair { current: 1, recovery: 0 });

    let conn = raw_conn(&dir);
    assert_eq!(schema_version(&conn), "3");
    assert!(!table_exists(&conn, "clients"));
    assert_eq!(
        bucket_rows(&conn, "rec-0000000000000001"),
        vec![b"x".to_vec(), b"y".to_vec()]
    );
}

#[test]
fn migrates_v2_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    fabricate_legacy(&dir, "2", &[b"z"]);

    let (_store, epochs) = ClientStore::open(dir.path()).expect("open migrates");
    assert_eq!(epochs, EpochPair { current: 1, recovery: 0 });

    let conn = raw_conn(&dir);
    assert_eq!(schema_version(&conn), "3");
    assert_eq!(
        bucket_rows(&conn, "rec-0000000000000001"),
        vec![b"z".to_vec()]
    );
}

#[test]
fn refuses_newer_schema() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let conn = raw_conn(&dir);
        conn.execute_batch(
            "CREATE TABLE parameters (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO parameters VALUES ('version', '4');",
        )
        .expect("fabricate future schema");
    }

    let err = ClientStore::open(dir.path()).expect_err("must refuse to open");
    assert!(matches!(err, StoreError::UnsupportedSchema { found: 4 }));
}

// =============================================================================
// Crash safety
// =============================================================================

#[test]
fn interrupted_grace_start_leaves_state_untouched() {
    let (dir, store, epochs) = open_fresh();
    store.insert_client(epochs.current, b"alice").unwrap();
    drop(store);

    // A grace_start that dies between BEGIN and COMMIT: the uncommitted
    // transaction is rolled back, exactly as a killed process would be.
    {
        let mut conn = raw_conn(&dir);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Exclusive)
            .expect("begin exclusive");
        tx.execute("UPDATE grace SET current = 2, recovery = 1", [])
            .expect("update grace");
        tx.execute_batch("CREATE TABLE \"rec-0000000000000002\" (id BLOB PRIMARY KEY);")
            .expect("create bucket");
    }

    let (_store, epochs) = ClientStore::open(dir.path()).expect("reopen");
    assert_eq!(epochs, EpochPair { current: 1, recovery: 0 });

    let conn = raw_conn(&dir);
    assert!(!table_exists(&conn, "rec-0000000000000002"));
    assert_eq!(
        bucket_rows(&conn, "rec-0000000000000001"),
        vec![b"alice".to_vec()]
    );
}

#[test]
fn corrupt_grace_row_is_rejected() {
    let (dir, store, _) = open_fresh();
    drop(store);
    {
        let conn = raw_conn(&dir);
        conn.execute("UPDATE grace SET current = 3, recovery = 5", [])
            .expect("corrupt grace row");
    }

    let err = ClientStore::open(dir.path()).expect_err("must refuse corrupt epochs");
    assert!(matches!(err, StoreError::Corrupt { .. }));
}
