//! CStorBackup reconciler
//!
//! Handles the business logic for backup jobs:
//! - The Add/Sync/Destroy state machine run by the controller workers
//! - The startup cleanup pass
//! - Stall resolution against the completed-backup ledger
//! - Scheduling and refreshing jobs for the HTTP surface

use std::collections::BTreeMap;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::config::LabelKeys;
use crate::controllers::events::{publish, JobEventNote, REASON_CREATED, REASON_FAILED};
use crate::controllers::{Context, JobRecord};
use crate::crd::{BackupStatus, CStorBackup, CStorVolumeReplica};
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::ledger::Ledger;
use crate::metrics;
use crate::queue::{QueueItem, QueueOperation};
use crate::store::{split_key, JobStore};

/// Status an `Add` moves a job to: only a pending job may start
pub fn status_after_add(current: BackupStatus) -> BackupStatus {
    match current {
        BackupStatus::Pending => BackupStatus::Init,
        _ => BackupStatus::Invalid,
    }
}

/// Write a new phase, guarded by the job's resource version
pub async fn update_status(
    store: &dyn JobStore<CStorBackup>,
    job: &CStorBackup,
    phase: BackupStatus,
    message: Option<String>,
) -> Result<CStorBackup> {
    let mut next = job.clone();
    next.set_phase(phase, message);
    let updated = store.update_status(&next).await?;
    debug!(name = %job.name_any(), from = ?job.phase(), to = ?phase, "Backup status updated");
    Ok(updated)
}

/// Run one queue item against the current record
#[instrument(skip(ctx, item), fields(key = %item.key, op = %item.operation))]
pub async fn process_backup(ctx: &Context, item: &QueueItem) -> Result<()> {
    let (namespace, name) = split_key(&item.key)?;
    let Some(job) = ctx.backups.get(&namespace, &name).await? else {
        info!("Backup no longer exists");
        return Ok(());
    };

    match item.operation {
        QueueOperation::Add => {
            let next = status_after_add(job.phase());
            if next == BackupStatus::Invalid {
                warn!(status = ?job.phase(), "Backup added in a non-pending state");
            }
            update_status(ctx.backups.as_ref(), &job, next, None).await?;
            info!(status = ?next, "Backup accepted");
            Ok(())
        }
        QueueOperation::Destroy => {
            info!("Backup deletion requested; nothing to clean up");
            Ok(())
        }
        QueueOperation::Sync => sync_backup(ctx, job).await,
    }
}

/// Ledger writes attempted after a successful transfer before giving up
const LEDGER_ATTEMPTS: u32 = 3;
const LEDGER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Run the transfer of an initialised job once
async fn sync_backup(ctx: &Context, job: CStorBackup) -> Result<()> {
    if job.phase() == BackupStatus::Done && job.ledger_pending() {
        return repair_ledger(ctx, job).await;
    }
    if job.phase() != BackupStatus::Init {
        debug!(status = ?job.phase(), "Backup not in Init, nothing to do");
        return Ok(());
    }

    let name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    let job = update_status(ctx.backups.as_ref(), &job, BackupStatus::InProgress, None).await?;
    info!(snap = %job.spec.snap_name, prev_snap = %job.spec.prev_snap_name, "Backup transfer started");

    if let Err(e) = ctx.transfer.send_backup(&job).await {
        let reason = e.to_string();
        warn!(error = %reason, "Backup transfer failed");
        update_status(ctx.backups.as_ref(), &job, BackupStatus::Failed, Some(reason.clone())).await?;
        publish(
            ctx.recorder.as_ref(),
            CStorBackup::KIND,
            &job,
            JobEventNote::warning(REASON_FAILED, format!("Backup failed: {}", reason)),
        )
        .await;
        metrics::BACKUPS_TOTAL
            .with_label_values(&["failed", namespace.as_str()])
            .inc();
        return Err(match e {
            Error::Transfer { .. } => e,
            other => Error::transfer(name, other),
        });
    }

    // a ledger entry still missing here is written by the requeued Sync
    let ledger = record_completed(&ctx.ledger, &job).await;
    let mut done = job.clone();
    match &ledger {
        Ok(()) => done.set_phase(BackupStatus::Done, None),
        Err(e) => {
            done.set_phase(BackupStatus::Done, Some(format!("Completed backup not recorded: {}", e)));
            done.set_ledger_pending(true);
        }
    }
    ctx.backups.update_status(&done).await?;
    publish(
        ctx.recorder.as_ref(),
        CStorBackup::KIND,
        &job,
        JobEventNote::normal(REASON_CREATED, "Backup completed"),
    )
    .await;
    metrics::BACKUPS_TOTAL
        .with_label_values(&["succeeded", namespace.as_str()])
        .inc();
    info!(ledger_pending = done.ledger_pending(), "Backup completed");

    ledger
}

/// Advance the ledger, retrying a few times before giving up
async fn record_completed(ledger: &Ledger, job: &CStorBackup) -> Result<()> {
    let mut attempt = 1;
    loop {
        match ledger.update_completed_backup(job).await {
            Ok(_) => return Ok(()),
            Err(e) if attempt < LEDGER_ATTEMPTS => {
                warn!(attempt, error = %e, "Completed backup update failed, retrying");
                tokio::time::sleep(LEDGER_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write the ledger entry of a finished job and clear its pending flag.
///
/// Nothing is written once a later snapshot of the volume has been recorded.
async fn repair_ledger(ctx: &Context, job: CStorBackup) -> Result<()> {
    let last = ctx.ledger.last_transferred_snap_name(&job).await?;
    if last.is_empty() || last == job.spec.prev_snap_name || last == job.spec.snap_name {
        record_completed(&ctx.ledger, &job).await?;
    } else {
        warn!(snap = %job.spec.snap_name, last_snap = %last, "Later backup already recorded");
    }
    let mut next = job.clone();
    next.set_ledger_pending(false);
    if let Some(status) = next.status.as_mut() {
        status.message = None;
    }
    ctx.backups.update_status(&next).await?;
    info!(snap = %job.spec.snap_name, "Completed backup recorded");
    Ok(())
}

/// Final status of a stalled job: `Done` only if the ledger shows its
/// snapshot as the last one transferred
pub async fn resolve_stalled_backup(ledger: &Ledger, job: &CStorBackup) -> BackupStatus {
    match ledger.last_transferred_snap_name(job).await {
        Ok(last) if last == job.spec.snap_name => BackupStatus::Done,
        Ok(last) => {
            debug!(name = %job.name_any(), last_snap = %last, "Snapshot was not transferred");
            BackupStatus::Failed
        }
        Err(e) => {
            warn!(name = %job.name_any(), error = %e, "Completed backup lookup failed");
            BackupStatus::Failed
        }
    }
}

/// Resolve owned jobs left unfinished by a previous run.
///
/// `InProgress` jobs are resolved through the ledger; every other job that
/// is not finished is marked `Failed`. `Done` jobs whose ledger entry is
/// still missing get it written. Returns the number of jobs rewritten.
pub async fn cleanup_old_backups(ctx: &Context) -> Result<usize> {
    let selector = ctx.identity.selector();
    let jobs = ctx.backups.list(None, Some(selector.as_str())).await?;
    let mut rewritten = 0;

    for job in jobs {
        let next = match job.phase() {
            BackupStatus::Done if job.ledger_pending() => {
                let name = job.name_any();
                match repair_ledger(ctx, job).await {
                    Ok(()) => rewritten += 1,
                    Err(e) => warn!(name = %name, error = %e, "Failed to record completed backup"),
                }
                continue;
            }
            BackupStatus::Done | BackupStatus::Failed => continue,
            BackupStatus::InProgress => resolve_stalled_backup(&ctx.ledger, &job).await,
            _ => BackupStatus::Failed,
        };

        let message = Some(format!("Found in {:?} after controller restart", job.phase()));
        match update_status(ctx.backups.as_ref(), &job, next, message).await {
            Ok(_) => {
                info!(name = %job.name_any(), from = ?job.phase(), to = ?next, "Backup cleaned up");
                let phase = format!("{:?}", next);
                metrics::CLEANUPS
                    .with_label_values(&[CStorBackup::KIND, phase.as_str()])
                    .inc();
                rewritten += 1;
            }
            Err(e) => warn!(name = %job.name_any(), error = %e, "Failed to clean up backup"),
        }
    }
    Ok(rewritten)
}

/// Select a healthy replica of the volume, seed labels and `prevSnapName`,
/// and create the job in `Pending`.
///
/// Re-issuing a request resolves to the existing job.
#[instrument(skip_all, fields(name = %job.derived_name()))]
pub async fn deploy_backup(
    backups: &dyn JobStore<CStorBackup>,
    replicas: &dyn JobStore<CStorVolumeReplica>,
    ledger: &Ledger,
    labels: &LabelKeys,
    mut job: CStorBackup,
) -> Result<CStorBackup> {
    let name = job.derived_name();
    let namespace = job.namespace().unwrap_or_default();
    job.metadata.name = Some(name.clone());

    let selector = format!("{}={}", labels.persistent_volume, job.spec.volume_name);
    let replica = replicas
        .list(None, Some(selector.as_str()))
        .await?
        .into_iter()
        .find(CStorVolumeReplica::is_healthy)
        .ok_or_else(|| Error::not_found(format!("healthy replica for volume {}", job.spec.volume_name)))?;

    let replica_label = |key: &str| replica.labels().get(key).cloned().unwrap_or_default();
    let job_labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
    job_labels.insert(labels.pool_uid.clone(), replica_label(&labels.pool_uid));
    job_labels.insert(labels.persistent_volume.clone(), replica_label(&labels.persistent_volume));
    job_labels.insert(labels.backup.clone(), job.spec.backup_name.clone());

    job.spec.prev_snap_name = ledger.last_transferred_snap_name(&job).await?;
    job.status = None;

    let created = match backups.create(&job).await {
        Ok(created) => created,
        Err(Error::AlreadyExists(_)) => {
            let existing = backups.fetch(&namespace, &name).await?;
            if existing.phase() != BackupStatus::Empty {
                info!(status = ?existing.phase(), "Backup already scheduled");
                return Ok(existing);
            }
            // an earlier request created the record but never set it Pending
            info!("Backup created but not scheduled, scheduling it now");
            existing
        }
        Err(e) => return Err(e),
    };

    let pending = update_status(backups, &created, BackupStatus::Pending, None).await?;
    info!(
        pool = %pending.label(&labels.pool_uid),
        volume = %pending.spec.volume_name,
        prev_snap = %pending.spec.prev_snap_name,
        "Backup scheduled"
    );
    Ok(pending)
}

/// Current job, with a stalled unfinished job resolved and saved first.
///
/// A check that cannot complete is returned as an error.
#[instrument(skip(backups, ledger, checker, labels))]
pub async fn refresh_backup(
    backups: &dyn JobStore<CStorBackup>,
    ledger: &Ledger,
    checker: &HealthChecker,
    labels: &LabelKeys,
    namespace: &str,
    name: &str,
) -> Result<CStorBackup> {
    let job = backups.fetch(namespace, name).await?;
    if job.phase().is_finished() {
        return Ok(job);
    }

    if !checker.is_stalled(job.label(&labels.pool_uid)).await? {
        return Ok(job);
    }

    let next = resolve_stalled_backup(ledger, &job).await;
    info!(from = ?job.phase(), to = ?next, "Backup stalled on an unavailable pool");
    update_status(backups, &job, next, Some("Pool instance unavailable".to_string())).await
}
