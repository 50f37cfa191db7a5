//! Integration tests for the CStorBackup reconciler
//!
//! The state machine, the completed-backup ledger, startup cleanup and the
//! request-side operations, all against in-memory stores.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_test::{assert_err, assert_ok};

use common::{
    backup, backup_on, completed, identity, labels, checker, replica, FakeCluster, FlakyStore, Harness, NS, POOL,
};
use cstor_backup_operator::controllers::classify;
use cstor_backup_operator::controllers::events::EventType;
use cstor_backup_operator::controllers::watch::JobEvent;
use cstor_backup_operator::crd::{BackupStatus, CStorBackup, CStorBackupCompleted, CStorVolumeReplica};
use cstor_backup_operator::error::Error;
use cstor_backup_operator::ledger::Ledger;
use cstor_backup_operator::queue::{QueueItem, QueueOperation};
use cstor_backup_operator::reconcilers::backup::{
    cleanup_old_backups, deploy_backup, process_backup, refresh_backup, resolve_stalled_backup,
};
use cstor_backup_operator::store::{JobStore, MemoryStore};

// ============================================================================
// Test Helpers
// ============================================================================

fn item(name: &str, operation: QueueOperation) -> QueueItem {
    QueueItem::new(format!("{}/{}", NS, name), operation)
}

fn ledger_of(store: &Arc<MemoryStore<CStorBackupCompleted>>) -> Ledger {
    let seam: Arc<dyn JobStore<CStorBackupCompleted>> = store.clone();
    Ledger::new(seam)
}

fn ledger_record(h: &Harness) -> Option<CStorBackupCompleted> {
    h.completed.all().into_iter().next()
}

/// Route the harness ledger through a store whose next `n` updates fail
fn flaky_ledger(h: &mut Harness, n: usize) {
    let flaky = Arc::new(FlakyStore::new(h.completed.clone()));
    flaky.failing_updates.store(n, Ordering::SeqCst);
    let seam: Arc<dyn JobStore<CStorBackupCompleted>> = flaky;
    h.ctx.ledger = Ledger::new(seam);
}

// ============================================================================
// Add / Sync / Destroy
// ============================================================================

#[tokio::test]
async fn test_add_moves_pending_to_init() {
    let h = Harness::new();
    h.backups.insert(backup("s1", BackupStatus::Pending));

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Add)).await);
    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Init);
}

#[tokio::test]
async fn test_add_on_non_pending_is_invalid() {
    let h = Harness::new();
    h.backups.insert(backup("s1", BackupStatus::Done));

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Add)).await);
    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Invalid);
    assert_eq!(h.transfer.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sync_success_advances_ledger() {
    let h = Harness::new();
    h.backups.insert(backup("s1", BackupStatus::Init));

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Sync)).await);

    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Done);
    assert_eq!(h.transfer.sends.load(Ordering::SeqCst), 1);
    let record = ledger_record(&h).expect("ledger record");
    assert_eq!(record.metadata.name.as_deref(), Some("daily-vol1"));
    assert_eq!(record.spec.snap_name, "s1");
    assert_eq!(record.spec.prev_snap_name, "");
    assert!(h.recorder.reasons().contains(&"Created"));
}

#[tokio::test]
async fn test_sync_failure_is_terminal_and_leaves_ledger() {
    let h = Harness::new();
    h.transfer.fail.store(true, Ordering::SeqCst);
    h.completed.insert(completed("vol1", "s0", ""));
    h.backups.insert(backup("s1", BackupStatus::Init));

    let err = assert_err!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Sync)).await);
    assert!(matches!(err, Error::Transfer { .. }));
    assert!(err.is_terminal());

    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Failed);
    assert_eq!(ledger_record(&h).unwrap().spec.snap_name, "s0");

    let events = h.recorder.events.lock().unwrap();
    let (component, note) = events.last().unwrap();
    assert_eq!(component, "CStorBackup");
    assert_eq!(note.reason, "Failed");
    assert_eq!(note.type_, EventType::Warning);
}

#[tokio::test]
async fn test_transient_ledger_failure_is_retried() {
    let mut h = Harness::new();
    flaky_ledger(&mut h, 1);
    h.completed.insert(completed("vol1", "s0", ""));
    h.backups.insert(backup("s1", BackupStatus::Init));

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Sync)).await);

    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Done);
    assert!(!h.backups.all()[0].ledger_pending());
    let record = ledger_record(&h).unwrap();
    assert_eq!(record.spec.snap_name, "s1");
    assert_eq!(record.spec.prev_snap_name, "s0");
}

#[tokio::test]
async fn test_requeued_sync_writes_missing_ledger_entry() {
    let mut h = Harness::new();
    flaky_ledger(&mut h, 3);
    h.completed.insert(completed("vol1", "s0", ""));
    let mut job = backup("s1", BackupStatus::Init);
    job.spec.prev_snap_name = "s0".to_string();
    h.backups.insert(job);

    let err = assert_err!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Sync)).await);
    assert!(!err.is_terminal());
    let job = h.backups.all().remove(0);
    assert_eq!(job.phase(), BackupStatus::Done);
    assert!(job.ledger_pending());
    assert_eq!(ledger_record(&h).unwrap().spec.snap_name, "s0");

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Sync)).await);
    let job = h.backups.all().remove(0);
    assert_eq!(job.phase(), BackupStatus::Done);
    assert!(!job.ledger_pending());
    let record = ledger_record(&h).unwrap();
    assert_eq!(record.spec.snap_name, "s1");
    assert_eq!(record.spec.prev_snap_name, "s0");
    assert_eq!(h.transfer.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sync_outside_init_does_nothing() {
    let h = Harness::new();
    for (snap, phase) in [
        ("s1", BackupStatus::Pending),
        ("s2", BackupStatus::InProgress),
        ("s3", BackupStatus::Done),
    ] {
        h.backups.insert(backup(snap, phase));
        let name = format!("{}-vol1", snap);
        assert_ok!(process_backup(&h.ctx, &item(&name, QueueOperation::Sync)).await);
        assert_eq!(h.backup_phase(&name), phase);
    }
    assert_eq!(h.transfer.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_destroy_and_missing_records_are_no_ops() {
    let h = Harness::new();
    h.backups.insert(backup("s1", BackupStatus::InProgress));

    assert_ok!(process_backup(&h.ctx, &item("s1-vol1", QueueOperation::Destroy)).await);
    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::InProgress);

    assert_ok!(process_backup(&h.ctx, &item("gone-vol1", QueueOperation::Sync)).await);
}

#[tokio::test]
async fn test_malformed_key_is_terminal() {
    let h = Harness::new();
    let err = assert_err!(process_backup(&h.ctx, &QueueItem::new("a/b/c", QueueOperation::Add)).await);
    assert!(err.is_terminal());
}

// ============================================================================
// Completed-backup ledger
// ============================================================================

#[tokio::test]
async fn test_ledger_shifts_snapshots() {
    let store = Arc::new(MemoryStore::<CStorBackupCompleted>::new());
    let ledger = ledger_of(&store);

    assert_eq!(assert_ok!(ledger.last_transferred_snap_name(&backup("s1", BackupStatus::Done)).await), "");

    assert_ok!(ledger.update_completed_backup(&backup("s1", BackupStatus::Done)).await);
    let record = assert_ok!(ledger.update_completed_backup(&backup("s2", BackupStatus::Done)).await);
    assert_eq!(record.spec.snap_name, "s2");
    assert_eq!(record.spec.prev_snap_name, "s1");
    assert_eq!(store.all().len(), 1);

    assert_eq!(
        assert_ok!(ledger.last_transferred_snap_name(&backup("s3", BackupStatus::Pending)).await),
        "s2"
    );
}

#[tokio::test]
async fn test_stalled_backup_resolution() {
    let store = Arc::new(MemoryStore::<CStorBackupCompleted>::new());
    store.insert(completed("vol1", "s1", "s0"));
    let ledger = ledger_of(&store);

    assert_eq!(
        resolve_stalled_backup(&ledger, &backup("s1", BackupStatus::InProgress)).await,
        BackupStatus::Done
    );
    assert_eq!(
        resolve_stalled_backup(&ledger, &backup("s2", BackupStatus::InProgress)).await,
        BackupStatus::Failed
    );
}

// ============================================================================
// Startup cleanup
// ============================================================================

#[tokio::test]
async fn test_cleanup_resolves_owned_jobs() {
    let h = Harness::new();
    h.completed.insert(completed("vol1", "s1", ""));
    h.backups.insert(backup("s1", BackupStatus::InProgress));
    h.backups.insert(backup("s2", BackupStatus::InProgress));
    h.backups.insert(backup("s3", BackupStatus::Pending));
    h.backups.insert(backup("s4", BackupStatus::Done));
    h.backups.insert(backup_on("pool-b", "vol1", "s5", BackupStatus::InProgress));

    let rewritten = assert_ok!(cleanup_old_backups(&h.ctx).await);
    assert_eq!(rewritten, 3);

    assert_eq!(h.backup_phase("s1-vol1"), BackupStatus::Done);
    assert_eq!(h.backup_phase("s2-vol1"), BackupStatus::Failed);
    assert_eq!(h.backup_phase("s3-vol1"), BackupStatus::Failed);
    assert_eq!(h.backup_phase("s4-vol1"), BackupStatus::Done);
    assert_eq!(h.backup_phase("s5-vol1"), BackupStatus::InProgress);
}

#[tokio::test]
async fn test_cleanup_records_pending_ledger_entries() {
    let h = Harness::new();
    h.completed.insert(completed("vol1", "s0", ""));
    h.completed.insert(completed("vol2", "s9", "s8"));

    let mut behind = backup_on(POOL, "vol1", "s1", BackupStatus::Done);
    behind.spec.prev_snap_name = "s0".to_string();
    behind.set_ledger_pending(true);
    h.backups.insert(behind);

    // a later snapshot of vol2 is already recorded
    let mut superseded = backup_on(POOL, "vol2", "s1", BackupStatus::Done);
    superseded.spec.prev_snap_name = "s0".to_string();
    superseded.set_ledger_pending(true);
    h.backups.insert(superseded);

    assert_eq!(assert_ok!(cleanup_old_backups(&h.ctx).await), 2);
    assert!(h.backups.all().iter().all(|b| !b.ledger_pending()));

    let ledger: Vec<(String, String)> = h
        .completed
        .all()
        .into_iter()
        .map(|r| (r.spec.volume_name, r.spec.snap_name))
        .collect();
    assert!(ledger.contains(&("vol1".to_string(), "s1".to_string())));
    assert!(ledger.contains(&("vol2".to_string(), "s9".to_string())));
}

// ============================================================================
// Request-side operations
// ============================================================================

#[tokio::test]
async fn test_deploy_backup_is_idempotent() {
    let backups = MemoryStore::<CStorBackup>::new();
    let replicas = MemoryStore::<CStorVolumeReplica>::new();
    replicas.insert(replica("cvr-1", Some("pool-z"), "vol1", "Offline"));
    replicas.insert(replica("cvr-2", Some("pool-b"), "vol1", "Healthy"));
    let completed_store = Arc::new(MemoryStore::<CStorBackupCompleted>::new());
    completed_store.insert(completed("vol1", "s0", ""));
    let ledger = ledger_of(&completed_store);

    let mut request = backup("s1", BackupStatus::Empty);
    request.metadata.labels = None;
    request.spec.prev_snap_name = "stale".to_string();

    let first = assert_ok!(deploy_backup(&backups, &replicas, &ledger, &labels(), request.clone()).await);
    assert_eq!(first.phase(), BackupStatus::Pending);
    assert_eq!(first.label(&labels().pool_uid), "pool-b");
    assert_eq!(first.label(&labels().persistent_volume), "vol1");
    assert_eq!(first.label(&labels().backup), "daily");
    assert_eq!(first.spec.prev_snap_name, "s0");

    let second = assert_ok!(deploy_backup(&backups, &replicas, &ledger, &labels(), request).await);
    assert_eq!(second.metadata.name.as_deref(), Some("s1-vol1"));
    assert_eq!(backups.all().len(), 1);
}

#[tokio::test]
async fn test_redeploy_schedules_job_left_unscheduled() {
    let inner = Arc::new(MemoryStore::<CStorBackup>::new());
    let backups = FlakyStore::new(inner.clone());
    backups.failing_status_updates.store(1, Ordering::SeqCst);
    let replicas = MemoryStore::<CStorVolumeReplica>::new();
    replicas.insert(replica("cvr-1", Some(POOL), "vol1", "Healthy"));
    let ledger = ledger_of(&Arc::new(MemoryStore::new()));
    let request = backup("s1", BackupStatus::Empty);

    let err = assert_err!(deploy_backup(&backups, &replicas, &ledger, &labels(), request.clone()).await);
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(inner.all()[0].phase(), BackupStatus::Empty);

    let job = assert_ok!(deploy_backup(&backups, &replicas, &ledger, &labels(), request).await);
    assert_eq!(job.phase(), BackupStatus::Pending);
    assert_eq!(inner.all().len(), 1);
    assert_eq!(inner.all()[0].phase(), BackupStatus::Pending);
    assert_eq!(classify(&identity(), &JobEvent::Add(job)), Some(QueueOperation::Add));
}

#[tokio::test]
async fn test_deploy_backup_needs_healthy_replica() {
    let backups = MemoryStore::<CStorBackup>::new();
    let replicas = MemoryStore::<CStorVolumeReplica>::new();
    replicas.insert(replica("cvr-1", Some(POOL), "vol1", "Degraded"));
    let ledger = ledger_of(&Arc::new(MemoryStore::new()));

    let err = assert_err!(
        deploy_backup(&backups, &replicas, &ledger, &labels(), backup("s1", BackupStatus::Empty)).await
    );
    assert!(err.is_not_found());
    assert!(backups.all().is_empty());
}

#[tokio::test]
async fn test_refresh_resolves_stalled_job() {
    let backups = MemoryStore::<CStorBackup>::new();
    backups.insert(backup("s1", BackupStatus::InProgress));
    let completed_store = Arc::new(MemoryStore::<CStorBackupCompleted>::new());
    completed_store.insert(completed("vol1", "s1", "s0"));
    let ledger = ledger_of(&completed_store);

    let cluster = FakeCluster::default();
    cluster.add_pool(POOL, Some("node-1"), false, true);
    let checker = checker(cluster);

    let job = assert_ok!(refresh_backup(&backups, &ledger, &checker, &labels(), NS, "s1-vol1").await);
    assert_eq!(job.phase(), BackupStatus::Done);
    assert_eq!(backups.all()[0].phase(), BackupStatus::Done);
}

#[tokio::test]
async fn test_refresh_keeps_healthy_and_finished_jobs() {
    let backups = MemoryStore::<CStorBackup>::new();
    backups.insert(backup("s1", BackupStatus::InProgress));
    backups.insert(backup("s2", BackupStatus::Failed));
    let ledger = ledger_of(&Arc::new(MemoryStore::new()));
    let checker = checker(FakeCluster::healthy(&[POOL]));

    let job = assert_ok!(refresh_backup(&backups, &ledger, &checker, &labels(), NS, "s1-vol1").await);
    assert_eq!(job.phase(), BackupStatus::InProgress);

    let job = assert_ok!(refresh_backup(&backups, &ledger, &checker, &labels(), NS, "s2-vol1").await);
    assert_eq!(job.phase(), BackupStatus::Failed);
}

#[tokio::test]
async fn test_refresh_surfaces_indeterminate_health() {
    let backups = MemoryStore::<CStorBackup>::new();
    backups.insert(backup("s1", BackupStatus::InProgress));
    let ledger = ledger_of(&Arc::new(MemoryStore::new()));
    let checker = checker(FakeCluster::default());

    let err = assert_err!(refresh_backup(&backups, &ledger, &checker, &labels(), NS, "s1-vol1").await);
    assert!(matches!(err, Error::HealthIndeterminate(_)));
    assert_eq!(backups.all()[0].phase(), BackupStatus::InProgress);

    let err = assert_err!(refresh_backup(&backups, &ledger, &checker, &labels(), NS, "missing-vol1").await);
    assert!(err.is_not_found());
}
