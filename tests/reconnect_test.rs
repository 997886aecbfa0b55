mod common;

use std::time::{Duration, Instant};

use cluster_journal::{Error, Journal, Slot, UnlockOutcome};

/// Makes the slot's current connection reject writes, so its next write fails
/// the way a dropped database link would.
fn break_connection(journal: &Journal, slot: Slot) {
    journal
        .connections()
        .with_connection(slot, "test setup", |conn| {
            conn.execute_batch("PRAGMA query_only = ON")
        })
        .unwrap();
}

#[test]
fn failed_lock_is_retryable_and_revisions_continue() {
    let (_dir, path) = common::create_temp_db_file("reconnect.db");
    let journal = common::open_node("node-a", &path);

    assert_eq!(journal.append_one("items", b"before".to_vec()).unwrap(), 1);
    let generation = journal.connections().generation(Slot::Batch).unwrap();

    break_connection(&journal, Slot::Batch);
    let err = journal.append_one("items", b"lost".to_vec()).unwrap_err();
    assert!(matches!(err, Error::Connectivity { .. }), "{err}");
    assert!(err.is_retryable());
    assert!(!journal.connections().is_connected(Slot::Batch));
    assert!(!journal.lock_manager().is_held_by_current_thread());

    assert_eq!(journal.append_one("items", b"after".to_vec()).unwrap(), 2);
    assert!(journal.connections().generation(Slot::Batch).unwrap() > generation);
    assert_eq!(
        common::revisions_and_payloads(&journal, 0),
        vec![(1, b"before".to_vec()), (2, b"after".to_vec())]
    );
}

#[test]
fn lost_batch_connection_aborts_the_batch() {
    let (_dir, path) = common::create_temp_db_file("aborted.db");
    let journal = common::open_node("node-a", &path);

    assert_eq!(journal.lock().unwrap(), 1);
    journal.append("items", b"first".to_vec()).unwrap();
    journal.connections().teardown(Slot::Batch);

    // Reconnecting here would write outside the lock's transaction.
    let err = journal.append("items", b"second".to_vec()).unwrap_err();
    assert!(matches!(err, Error::TransactionAborted { .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(journal.unlock(false).unwrap(), UnlockOutcome::RolledBack);

    // The increment died with the connection, so the revision is reused.
    assert_eq!(journal.append_one("items", b"retry".to_vec()).unwrap(), 1);
    assert_eq!(
        common::revisions_and_payloads(&journal, 0),
        vec![(1, b"retry".to_vec())]
    );
}

#[test]
fn commit_on_lost_connection_fails_and_releases_lock() {
    let (_dir, path) = common::create_temp_db_file("lost_commit.db");
    let journal = common::open_node("node-a", &path);

    journal.lock().unwrap();
    journal.append("items", b"x".to_vec()).unwrap();
    journal.connections().teardown(Slot::Batch);

    assert!(matches!(
        journal.unlock(true),
        Err(Error::TransactionAborted { .. })
    ));
    assert!(!journal.lock_manager().is_held_by_current_thread());
    assert_eq!(journal.records_all().unwrap().count(), 0);
}

#[test]
fn failed_checkpoint_keeps_old_revision() {
    let (_dir, path) = common::create_temp_db_file("checkpoint.db");
    let journal = common::open_node("node-a", &path);
    let store = journal.revision_store();

    store.set(5);
    assert_eq!(journal.local_revision().unwrap(), 5);

    break_connection(&journal, Slot::Shared);
    store.set(10);
    assert_eq!(journal.local_revision().unwrap(), 5);

    // The failure discarded the connection; the next write reconnects.
    store.try_set(10).unwrap();
    assert_eq!(journal.local_revision().unwrap(), 10);
    assert_eq!(
        store.all_local_revisions().unwrap(),
        vec![("node-a".to_string(), 10)]
    );
}

#[test]
fn surfaced_checkpoint_error_fails_the_save() {
    let (_dir, path) = common::create_temp_db_file("surfaced.db");
    let mut config = common::test_config("node-a", &path);
    config.surface_checkpoint_errors = true;
    let journal = Journal::open(config).unwrap();

    // Open the shared connection, then break it.
    journal.global_revision().unwrap();
    break_connection(&journal, Slot::Shared);

    let err = journal.append_one("items", b"x".to_vec()).unwrap_err();
    assert!(matches!(err, Error::Connectivity { .. }), "{err}");
    // The record itself committed; only the checkpoint lags.
    assert_eq!(journal.records_all().unwrap().count(), 1);
    assert_eq!(journal.local_revision().unwrap(), 0);
}

#[test]
fn reconnect_waits_out_the_delay() {
    let (_dir, path) = common::create_temp_db_file("delay.db");
    let mut config = common::test_config("node-a", &path);
    config.reconnect_delay_ms = 300;
    let journal = Journal::open(config).unwrap();

    journal.global_revision().unwrap();
    break_connection(&journal, Slot::Shared);
    assert!(journal.revision_store().try_set(1).is_err());

    let started = Instant::now();
    journal.revision_store().try_set(1).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(250));
}
