//! Integration tests for [`PersistenceManager`].
//!
//! These drive the manager against recording in-memory backends so every
//! physical write can be counted and faults injected at will.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::{Value, json};
use statekeep_core::backup::BACKUP_STORE_NAME;
use statekeep_core::types::PendingWrite;
use statekeep_core::{MetaData, NamedLock, PersistenceError, PersistenceManager, StorageKind};
use statekeep_storage::{Entries, KeyValueBackend};

use common::{
    CountingSink, FailingFactory, RecordingBackend, RecordingFactory, record_warnings,
    settle_tasks,
};

fn vault_state(vault: &str) -> Value {
    json!({
        "KeyringController": {"vault": vault},
        "AppMetadataController": {"currentAppVersion": "7.0.0"},
        "PreferencesController": {"theme": "dark"}
    })
}

fn manager(primary: &Arc<RecordingBackend>) -> PersistenceManager {
    PersistenceManager::builder(Arc::clone(primary) as _).build()
}

fn manager_with_backup(
    primary: &Arc<RecordingBackend>,
    backup: &Arc<RecordingFactory>,
    sink: &Arc<CountingSink>,
) -> PersistenceManager {
    PersistenceManager::builder(Arc::clone(primary) as _)
        .backup(Arc::clone(backup) as _)
        .sink(Arc::clone(sink) as _)
        .build()
}

async fn split_manager(primary: &Arc<RecordingBackend>, state: Value) -> PersistenceManager {
    let mgr = manager(primary);
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.migrate_to_split_state(state).await.unwrap();
    mgr
}

// ── Monolithic writes ────────────────────────────────────────────────

#[tokio::test]
async fn first_write_stores_data_and_meta_in_one_transaction() {
    let primary = RecordingBackend::new();
    let mgr = manager(&primary);
    mgr.set_metadata(MetaData::new(10)).unwrap();

    mgr.set(json!({"appState": {"test": true}})).await.unwrap();

    assert_eq!(primary.set_count(), 1);
    let mut expected = Entries::new();
    expected.insert("data".to_owned(), json!({"appState": {"test": true}}));
    expected.insert("meta".to_owned(), json!({"version": 10}));
    assert_eq!(primary.last_set().unwrap(), expected);
}

#[tokio::test]
async fn set_then_get_round_trips() {
    let primary = RecordingBackend::new();
    let mgr = manager(&primary);
    mgr.set_metadata(MetaData::new(4)).unwrap();
    mgr.set(vault_state("cipher")).await.unwrap();

    let read = mgr.get(false).await.unwrap().unwrap();
    assert_eq!(Value::Object(read.data.unwrap()), vault_state("cipher"));
    assert_eq!(read.meta.unwrap().version, 4);
    assert_eq!(mgr.storage_kind(), StorageKind::Data);
}

#[tokio::test]
async fn empty_store_reads_as_none() {
    let primary = RecordingBackend::new();
    let mgr = manager(&primary);
    assert!(mgr.get(true).await.unwrap().is_none());
    assert!(mgr.most_recently_retrieved_state().is_none());
}

#[tokio::test]
async fn legacy_layout_without_manifest_is_readable() {
    let primary = RecordingBackend::new();
    let mut legacy = Entries::new();
    legacy.insert("data".to_owned(), json!({"A": 1}));
    legacy.insert("meta".to_owned(), json!({"version": 2}));
    primary.inner.set(&legacy).await.unwrap();

    let mgr = manager(&primary);
    let read = mgr.get(false).await.unwrap().unwrap();
    assert_eq!(read.data.unwrap()["A"], json!(1));
    assert_eq!(read.meta.unwrap(), MetaData::new(2));
}

#[tokio::test]
async fn input_errors_are_returned() {
    let primary = RecordingBackend::new();
    let mgr = manager(&primary);

    assert!(matches!(
        mgr.set(json!({"A": 1})).await,
        Err(PersistenceError::MetadataNotSet { operation: "set" })
    ));
    mgr.set_metadata(MetaData::new(1)).unwrap();
    assert!(matches!(
        mgr.set(Value::Null).await,
        Err(PersistenceError::MissingState)
    ));
    assert!(matches!(
        mgr.set(json!("nope")).await,
        Err(PersistenceError::InvalidState { found: "string" })
    ));
    assert!(matches!(
        mgr.update("A", Some(json!(1))),
        Err(PersistenceError::WrongStorageKind { .. })
    ));
    assert!(matches!(
        mgr.persist().await,
        Err(PersistenceError::WrongStorageKind { .. })
    ));
    assert_eq!(primary.set_count(), 0);
}

// ── Supersede policy ─────────────────────────────────────────────────

#[tokio::test]
async fn only_the_latest_queued_write_reaches_storage() {
    let lock = NamedLock::default();
    let primary = RecordingBackend::new();
    let mgr = Arc::new(
        PersistenceManager::builder(Arc::clone(&primary) as _)
            .lock(lock.clone())
            .build(),
    );
    mgr.set_metadata(MetaData::new(1)).unwrap();

    let held = lock.exclusive_uncancellable().await;
    let first = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.set(json!({"A": 1})).await })
    };
    settle_tasks().await;
    let second = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.set(json!({"B": 2})).await })
    };
    settle_tasks().await;
    drop(held);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(primary.set_count(), 1);
    assert_eq!(primary.last_set().unwrap()["data"], json!({"B": 2}));
}

/// Queue `A` then `B` behind a held lock and release it.
async fn race_two_writes(mgr: &Arc<PersistenceManager>, lock: &NamedLock) {
    let held = lock.exclusive_uncancellable().await;
    let first = {
        let mgr = Arc::clone(mgr);
        tokio::spawn(async move { mgr.set(json!({"A": 1})).await })
    };
    settle_tasks().await;
    let second = {
        let mgr = Arc::clone(mgr);
        tokio::spawn(async move { mgr.set(json!({"B": 2})).await })
    };
    settle_tasks().await;
    drop(held);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn superseded_write_leaves_the_latch_to_the_latest_success() {
    let lock = NamedLock::default();
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = Arc::new(
        PersistenceManager::builder(Arc::clone(&primary) as _)
            .lock(lock.clone())
            .sink(Arc::clone(&sink) as _)
            .build(),
    );
    mgr.set_metadata(MetaData::new(1)).unwrap();

    race_two_writes(&mgr, &lock).await;

    assert_eq!(primary.set_count(), 1);
    assert!(!mgr.data_persistence_failing());
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn superseded_write_leaves_the_latch_to_the_latest_failure() {
    let lock = NamedLock::default();
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = Arc::new(
        PersistenceManager::builder(Arc::clone(&primary) as _)
            .lock(lock.clone())
            .sink(Arc::clone(&sink) as _)
            .build(),
    );
    mgr.set_metadata(MetaData::new(1)).unwrap();
    primary.fail_sets.store(true, Ordering::SeqCst);

    race_two_writes(&mgr, &lock).await;

    assert_eq!(primary.set_count(), 1);
    assert_eq!(primary.last_set().unwrap()["data"], json!({"B": 2}));
    assert!(mgr.data_persistence_failing());
    assert_eq!(sink.count(), 1);
}

// ── Backup ───────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_backup_records_are_written_once() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();
    let mgr = manager_with_backup(&primary, &backup, &sink);
    mgr.set_metadata(MetaData::new(1)).unwrap();

    mgr.set(vault_state("v1")).await.unwrap();
    mgr.set(vault_state("v1")).await.unwrap();

    let mut changed_elsewhere = vault_state("v1");
    changed_elsewhere["PreferencesController"] = json!({"theme": "light"});
    mgr.set(changed_elsewhere).await.unwrap();

    let store = backup.store(BACKUP_STORE_NAME);
    assert_eq!(primary.set_count(), 3);
    assert_eq!(store.set_count(), 1);
    assert!(!store.last_set().unwrap().contains_key("PreferencesController"));

    mgr.set(vault_state("v2")).await.unwrap();
    assert_eq!(store.set_count(), 2);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn state_without_vault_is_not_backed_up() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();
    let mgr = manager_with_backup(&primary, &backup, &sink);
    mgr.set_metadata(MetaData::new(1)).unwrap();

    mgr.set(json!({"KeyringController": {"vault": ""}}))
        .await
        .unwrap();

    assert_eq!(backup.store(BACKUP_STORE_NAME).set_count(), 0);
    assert!(mgr.get_backup().await.unwrap().unwrap().keyring_controller.is_none());
}

#[tokio::test]
async fn vault_loss_is_detected_against_backup() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();

    let mut remembered = Entries::new();
    remembered.insert("KeyringController".to_owned(), json!({"vault": "cipher"}));
    remembered.insert("meta".to_owned(), json!({"version": 3}));
    backup
        .store(BACKUP_STORE_NAME)
        .inner
        .set(&remembered)
        .await
        .unwrap();

    let mut broken = Entries::new();
    broken.insert("data".to_owned(), json!({"KeyringController": {}}));
    broken.insert("meta".to_owned(), json!({"version": 3}));
    primary.inner.set(&broken).await.unwrap();

    let mgr = manager_with_backup(&primary, &backup, &sink);
    let err = mgr.get(true).await.unwrap_err();
    assert!(matches!(err, PersistenceError::MissingVault(_)));
    let payload = err.backup().unwrap();
    assert_eq!(payload.keyring_controller, Some(json!({"vault": "cipher"})));
    assert_eq!(payload.meta, Some(MetaData::new(3)));

    // Without validation the broken state is returned as-is.
    assert!(mgr.get(false).await.unwrap().is_some());
}

#[tokio::test]
async fn missing_vault_with_empty_backup_is_a_first_run() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();
    let mgr = manager_with_backup(&primary, &backup, &sink);

    assert!(mgr.get(true).await.unwrap().is_none());
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.set(json!({"KeyringController": {}})).await.unwrap();
    assert!(mgr.get(true).await.unwrap().is_some());
}

#[tokio::test]
async fn read_only_backup_medium_is_skipped() {
    let primary = RecordingBackend::new();
    let backup = FailingFactory::read_only();
    let sink = CountingSink::new();
    let mgr = PersistenceManager::builder(Arc::clone(&primary) as _)
        .backup(Arc::clone(&backup) as _)
        .sink(Arc::clone(&sink) as _)
        .build();
    mgr.set_metadata(MetaData::new(1)).unwrap();

    mgr.set(vault_state("v")).await.unwrap();
    mgr.set(vault_state("w")).await.unwrap();

    assert!(!mgr.is_backup_available());
    assert!(mgr.get_backup().await.unwrap().is_none());
    assert_eq!(backup.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(sink.count(), 1);
    assert_eq!(primary.set_count(), 2);
}

#[tokio::test]
async fn other_backup_open_failures_propagate_and_retry() {
    let primary = RecordingBackend::new();
    let backup = FailingFactory::broken();
    let mgr = PersistenceManager::builder(Arc::clone(&primary) as _)
        .backup(Arc::clone(&backup) as _)
        .build();
    mgr.set_metadata(MetaData::new(1)).unwrap();

    assert!(matches!(
        mgr.set(json!({"A": 1})).await,
        Err(PersistenceError::Storage(_))
    ));
    assert!(mgr.get(false).await.is_err());
    assert_eq!(backup.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(primary.set_count(), 0);
}

// ── Failure reporting ────────────────────────────────────────────────

#[tokio::test]
async fn failures_are_reported_once_per_streak() {
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = PersistenceManager::builder(Arc::clone(&primary) as _)
        .sink(Arc::clone(&sink) as _)
        .build();
    mgr.set_metadata(MetaData::new(1)).unwrap();

    primary.fail_sets.store(true, Ordering::SeqCst);
    mgr.set(json!({"A": 1})).await.unwrap();
    mgr.set(json!({"A": 2})).await.unwrap();
    assert!(mgr.data_persistence_failing());
    assert_eq!(sink.count(), 1);

    primary.fail_sets.store(false, Ordering::SeqCst);
    mgr.set(json!({"A": 3})).await.unwrap();
    assert!(!mgr.data_persistence_failing());

    primary.fail_sets.store(true, Ordering::SeqCst);
    mgr.set(json!({"A": 4})).await.unwrap();
    assert_eq!(sink.count(), 2);
}

#[tokio::test]
async fn closed_connection_is_retried_once_after_reopen() {
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = PersistenceManager::builder(Arc::clone(&primary) as _)
        .sink(Arc::clone(&sink) as _)
        .build();
    mgr.set_metadata(MetaData::new(1)).unwrap();

    primary.closed_calls.store(1, Ordering::SeqCst);
    mgr.set(json!({"A": 1})).await.unwrap();
    assert_eq!(primary.reopens.load(Ordering::SeqCst), 1);
    assert_eq!(primary.stored("data").await, Some(json!({"A": 1})));
    assert_eq!(sink.count(), 0);

    primary.closed_calls.store(2, Ordering::SeqCst);
    mgr.set(json!({"A": 2})).await.unwrap();
    assert_eq!(primary.reopens.load(Ordering::SeqCst), 2);
    assert_eq!(primary.stored("data").await, Some(json!({"A": 1})));
    assert_eq!(sink.count(), 1);
}

// ── Split layout ─────────────────────────────────────────────────────

#[tokio::test]
async fn migration_moves_state_into_per_key_layout() {
    let primary = RecordingBackend::new();
    let mgr = manager(&primary);
    mgr.set_metadata(MetaData::new(3)).unwrap();
    mgr.set(json!({"X": 1, "Y": 2})).await.unwrap();

    mgr.migrate_to_split_state(json!({"X": 1, "Y": 2}))
        .await
        .unwrap();
    assert_eq!(mgr.storage_kind(), StorageKind::Split);

    let read = mgr.get(false).await.unwrap().unwrap();
    assert_eq!(Value::Object(read.data.unwrap()), json!({"X": 1, "Y": 2}));
    assert_eq!(read.meta.unwrap().storage_kind, Some(StorageKind::Split));

    assert!(primary.stored("data").await.is_none());
    assert_eq!(
        primary.stored("manifest").await,
        Some(json!(["X", "Y", "meta"]))
    );

    // A fresh manager on the same medium sees the split layout.
    let reopened = manager(&primary);
    reopened.get(false).await.unwrap().unwrap();
    assert_eq!(reopened.storage_kind(), StorageKind::Split);
}

#[tokio::test]
async fn migrating_twice_is_a_no_op() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1})).await;
    let writes = primary.set_count();

    mgr.migrate_to_split_state(json!({"Other": true}))
        .await
        .unwrap();
    assert_eq!(primary.set_count(), writes);
}

#[tokio::test]
async fn manifest_tracks_exactly_the_present_keys() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1, "Y": 2})).await;

    mgr.update("X", None).unwrap();
    mgr.update("Z", Some(json!(3))).unwrap();
    mgr.persist().await.unwrap();

    assert_eq!(
        primary.stored("manifest").await,
        Some(json!(["Y", "Z", "meta"]))
    );
    assert_eq!(
        primary.inner.keys().await,
        vec!["Y", "Z", "manifest", "meta"]
    );

    // Value-only changes leave the manifest alone.
    mgr.update("Y", Some(json!(5))).unwrap();
    mgr.persist().await.unwrap();
    assert!(!primary.last_set().unwrap().contains_key("manifest"));
}

#[tokio::test]
async fn removing_an_untracked_key_is_skipped() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1})).await;
    let removes = primary.removes.lock().len();

    let (layer, _guard) = record_warnings();
    mgr.update("Ghost", None).unwrap();
    mgr.persist().await.unwrap();

    assert_eq!(primary.removes.lock().len(), removes);
    assert!(mgr.pending_writes().is_empty());
    let warnings = layer.warnings.lock().clone();
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert_eq!(warnings[0].key.as_deref(), Some("Ghost"));
    assert!(warnings[0].message.contains("not tracked"));
}

#[tokio::test]
async fn concurrent_reads_reach_storage_together() {
    let primary = RecordingBackend::new();
    let mgr = Arc::new(split_manager(&primary, json!({"X": 1})).await);
    mgr.get(false).await.unwrap();

    let gate = primary.read_gate.write().await;
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.get(false).await })
        })
        .collect();
    settle_tasks().await;
    assert_eq!(primary.reads_in_flight.load(Ordering::SeqCst), 2);
    drop(gate);

    for reader in readers {
        let read = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(read.data.unwrap()["X"], json!(1));
    }
}

#[tokio::test]
async fn persist_without_pending_writes_touches_nothing() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1})).await;
    let writes = primary.set_count();

    mgr.persist().await.unwrap();
    assert_eq!(primary.set_count(), writes);
}

#[tokio::test]
async fn reserved_keys_are_rejected() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1})).await;

    for key in ["manifest", "data", "meta"] {
        assert!(matches!(
            mgr.update(key, Some(json!(1))),
            Err(PersistenceError::ReservedKey { .. })
        ));
    }
    assert!(matches!(
        mgr.set(json!({"X": 2})).await,
        Err(PersistenceError::WrongStorageKind { .. })
    ));
}

#[tokio::test]
async fn failed_persist_restores_without_clobbering_newer_updates() {
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = Arc::new(
        PersistenceManager::builder(Arc::clone(&primary) as _)
            .sink(Arc::clone(&sink) as _)
            .build(),
    );
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.migrate_to_split_state(json!({"A": 0})).await.unwrap();

    mgr.update("A", Some(json!(1))).unwrap();
    mgr.update("B", Some(json!(1))).unwrap();

    let gate = primary.write_gate.write().await;
    let in_flight = {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.persist().await })
    };
    settle_tasks().await;
    assert!(mgr.pending_writes().is_empty(), "snapshot should be taken");

    mgr.update("A", Some(json!(2))).unwrap();
    primary.fail_sets.store(true, Ordering::SeqCst);
    drop(gate);
    in_flight.await.unwrap().unwrap();

    let pending = mgr.pending_writes();
    assert_eq!(pending.get("A"), Some(&PendingWrite::Put(json!(2))));
    assert_eq!(pending.get("B"), Some(&PendingWrite::Put(json!(1))));
    assert_eq!(sink.count(), 1);

    primary.fail_sets.store(false, Ordering::SeqCst);
    mgr.persist().await.unwrap();
    assert_eq!(primary.stored("A").await, Some(json!(2)));
    assert_eq!(primary.stored("B").await, Some(json!(1)));
    assert!(!mgr.data_persistence_failing());
}

#[tokio::test]
async fn failed_removal_is_reported_but_persist_succeeds() {
    let primary = RecordingBackend::new();
    let sink = CountingSink::new();
    let mgr = PersistenceManager::builder(Arc::clone(&primary) as _)
        .sink(Arc::clone(&sink) as _)
        .build();
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.migrate_to_split_state(json!({"X": 1, "Y": 2}))
        .await
        .unwrap();

    primary.fail_removes.store(true, Ordering::SeqCst);
    mgr.update("X", None).unwrap();
    mgr.persist().await.unwrap();

    assert_eq!(sink.count(), 1);
    assert!(!mgr.data_persistence_failing());
    assert_eq!(primary.stored("manifest").await, Some(json!(["Y", "meta"])));
}

#[tokio::test]
async fn split_persist_backs_up_recognised_keys() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();
    let mgr = manager_with_backup(&primary, &backup, &sink);
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.migrate_to_split_state(vault_state("v")).await.unwrap();

    let store = backup.store(BACKUP_STORE_NAME);
    assert_eq!(store.set_count(), 1);

    mgr.update("PreferencesController", Some(json!({"theme": "light"})))
        .unwrap();
    mgr.persist().await.unwrap();
    assert_eq!(store.set_count(), 1);

    let record = mgr.get_backup().await.unwrap().unwrap();
    assert_eq!(record.keyring_controller, Some(json!({"vault": "v"})));
    assert_eq!(
        record.meta.unwrap().storage_kind,
        Some(StorageKind::Split)
    );
}

#[tokio::test]
async fn metadata_is_staged_only_when_changed_in_split_mode() {
    let primary = RecordingBackend::new();
    let mgr = split_manager(&primary, json!({"X": 1})).await;

    mgr.set_metadata(MetaData::new(1)).unwrap();
    assert!(mgr.pending_writes().is_empty());

    mgr.set_metadata(MetaData::new(2)).unwrap();
    assert_eq!(
        mgr.pending_writes().get("meta"),
        Some(&PendingWrite::Put(json!({"version": 2, "storageKind": "split"})))
    );
}

// ── Reset and snapshots ──────────────────────────────────────────────

#[tokio::test]
async fn reset_clears_stores_and_bookkeeping() {
    let primary = RecordingBackend::new();
    let backup = RecordingFactory::new();
    let sink = CountingSink::new();
    let mgr = manager_with_backup(&primary, &backup, &sink);
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.set(vault_state("v")).await.unwrap();

    mgr.reset().await.unwrap();

    assert!(mgr.get(true).await.unwrap().is_none());
    assert!(!mgr.get_backup().await.unwrap().unwrap().has_any_value());
    assert!(mgr.metadata().is_none());
    assert!(!mgr.is_initialized());
    assert_eq!(mgr.storage_kind(), StorageKind::Data);

    // The backup fingerprint is forgotten, so the same record is written again.
    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.set(vault_state("v")).await.unwrap();
    assert_eq!(backup.store(BACKUP_STORE_NAME).set_count(), 2);
}

#[tokio::test]
async fn snapshot_is_kept_only_until_the_first_write() {
    let primary = RecordingBackend::new();
    let mut existing = Entries::new();
    existing.insert("data".to_owned(), json!({"A": 1}));
    existing.insert("meta".to_owned(), json!({"version": 1}));
    primary.inner.set(&existing).await.unwrap();

    let mgr = manager(&primary);
    mgr.get(false).await.unwrap();
    let first = mgr.most_recently_retrieved_state().unwrap();
    assert_eq!(first.data.as_ref().unwrap()["A"], json!(1));

    mgr.set_metadata(MetaData::new(1)).unwrap();
    mgr.set(json!({"A": 2})).await.unwrap();
    let read = mgr.get(false).await.unwrap().unwrap();
    assert_eq!(read.data.unwrap()["A"], json!(2));
    assert_eq!(mgr.most_recently_retrieved_state(), Some(first));
}
