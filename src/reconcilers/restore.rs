//! CStorRestore reconciler
//!
//! Restore jobs follow the backup state machine without a ledger. A restore
//! request targets a volume and is fanned out to one job per replica; the
//! volume-level status is aggregated back from those jobs.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::config::LabelKeys;
use crate::controllers::events::{publish, JobEventNote, REASON_CREATED, REASON_FAILED};
use crate::controllers::{Context, JobRecord};
use crate::crd::{generate_restore_name, CStorRestore, CStorVolumeReplica, RestoreStatus};
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::metrics;
use crate::queue::{QueueItem, QueueOperation};
use crate::store::{split_key, JobStore};

/// Status an `Add` moves a job to: only a pending job may start
pub fn status_after_add(current: RestoreStatus) -> RestoreStatus {
    match current {
        RestoreStatus::Pending => RestoreStatus::Init,
        _ => RestoreStatus::Invalid,
    }
}

/// Write a new phase, guarded by the job's resource version
pub async fn update_status(
    store: &dyn JobStore<CStorRestore>,
    job: &CStorRestore,
    phase: RestoreStatus,
    message: Option<String>,
) -> Result<CStorRestore> {
    let mut next = job.clone();
    next.set_phase(phase, message);
    let updated = store.update_status(&next).await?;
    debug!(name = %job.name_any(), from = ?job.phase(), to = ?phase, "Restore status updated");
    Ok(updated)
}

/// Run one queue item against the current record
#[instrument(skip(ctx, item), fields(key = %item.key, op = %item.operation))]
pub async fn process_restore(ctx: &Context, item: &QueueItem) -> Result<()> {
    let (namespace, name) = split_key(&item.key)?;
    let Some(job) = ctx.restores.get(&namespace, &name).await? else {
        info!("Restore no longer exists");
        return Ok(());
    };

    match item.operation {
        QueueOperation::Add => {
            let next = status_after_add(job.phase());
            if next == RestoreStatus::Invalid {
                warn!(status = ?job.phase(), "Restore added in a non-pending state");
            }
            update_status(ctx.restores.as_ref(), &job, next, None).await?;
            info!(status = ?next, "Restore accepted");
            Ok(())
        }
        QueueOperation::Destroy => {
            info!("Restore deletion requested; nothing to clean up");
            Ok(())
        }
        QueueOperation::Sync => sync_restore(ctx, job).await,
    }
}

async fn sync_restore(ctx: &Context, job: CStorRestore) -> Result<()> {
    if job.phase() != RestoreStatus::Init {
        debug!(status = ?job.phase(), "Restore not in Init, nothing to do");
        return Ok(());
    }

    let namespace = job.namespace().unwrap_or_default();
    let job = update_status(ctx.restores.as_ref(), &job, RestoreStatus::InProgress, None).await?;
    info!(src = %job.spec.restore_src, "Restore transfer started");

    if let Err(e) = ctx.transfer.receive_restore(&job).await {
        let reason = e.to_string();
        warn!(error = %reason, "Restore transfer failed");
        update_status(ctx.restores.as_ref(), &job, RestoreStatus::Failed, Some(reason.clone())).await?;
        publish(
            ctx.recorder.as_ref(),
            CStorRestore::KIND,
            &job,
            JobEventNote::warning(REASON_FAILED, format!("Restore failed: {}", reason)),
        )
        .await;
        metrics::RESTORES_TOTAL
            .with_label_values(&["failed", namespace.as_str()])
            .inc();
        return Err(match e {
            Error::Transfer { .. } => e,
            other => Error::transfer(job.name_any(), other),
        });
    }

    update_status(ctx.restores.as_ref(), &job, RestoreStatus::Done, None).await?;
    publish(
        ctx.recorder.as_ref(),
        CStorRestore::KIND,
        &job,
        JobEventNote::normal(REASON_CREATED, "Restore completed"),
    )
    .await;
    metrics::RESTORES_TOTAL
        .with_label_values(&["succeeded", namespace.as_str()])
        .inc();
    info!("Restore completed");
    Ok(())
}

/// Mark every owned job that is not `Done` as `Failed`.
///
/// A restore cannot resume after a restart, so no stall check is made.
/// Returns the number of jobs rewritten.
pub async fn cleanup_old_restores(ctx: &Context) -> Result<usize> {
    let selector = ctx.identity.selector();
    let jobs = ctx.restores.list(None, Some(selector.as_str())).await?;
    let mut rewritten = 0;

    for job in jobs {
        if job.phase().is_finished() {
            continue;
        }
        let message = Some(format!("Found in {:?} after controller restart", job.phase()));
        match update_status(ctx.restores.as_ref(), &job, RestoreStatus::Failed, message).await {
            Ok(_) => {
                info!(name = %job.name_any(), from = ?job.phase(), "Restore cleaned up");
                metrics::CLEANUPS
                    .with_label_values(&[CStorRestore::KIND, "Failed"])
                    .inc();
                rewritten += 1;
            }
            Err(e) => warn!(name = %job.name_any(), error = %e, "Failed to clean up restore"),
        }
    }
    Ok(rewritten)
}

/// Create or re-initialise one job per replica of the requested volume.
///
/// A replica whose pool instance already has a job for the volume gets that
/// job's spec and labels replaced and its status reset to `Pending`;
/// otherwise a new job with a random name suffix is created.
#[instrument(skip_all, fields(restore = %request.spec.restore_name, volume = %request.spec.volume_name))]
pub async fn create_restore_resource(
    restores: &dyn JobStore<CStorRestore>,
    replicas: &dyn JobStore<CStorVolumeReplica>,
    labels: &LabelKeys,
    request: &CStorRestore,
) -> Result<Vec<CStorRestore>> {
    let namespace = request
        .namespace()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::config("restore request has no namespace"))?;
    let selector = format!("{}={}", labels.persistent_volume, request.spec.volume_name);
    let replicas = replicas.list(None, Some(selector.as_str())).await?;

    let mut jobs = Vec::with_capacity(replicas.len());
    for replica in replicas {
        let Some(pool) = replica.labels().get(&labels.pool_uid).filter(|p| !p.is_empty()) else {
            warn!(replica = %replica.name_any(), "Replica has no pool identity, skipping");
            continue;
        };
        let job_labels = BTreeMap::from([
            (labels.pool_uid.clone(), pool.clone()),
            (labels.persistent_volume.clone(), request.spec.volume_name.clone()),
            (labels.restore.clone(), request.spec.restore_name.clone()),
        ]);

        let existing_selector = format!(
            "{}={},{}={}",
            labels.pool_uid, pool, labels.persistent_volume, request.spec.volume_name
        );
        let existing = restores
            .list(Some(namespace.as_str()), Some(existing_selector.as_str()))
            .await?
            .into_iter()
            .next();

        let saved = match existing {
            Some(mut job) => {
                job.spec = request.spec.clone();
                job.metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(job_labels);
                let job = restores.update(&job).await?;
                info!(name = %job.name_any(), pool = %pool, "Re-initialising existing restore");
                job
            }
            None => {
                let mut job = CStorRestore::new(&generate_restore_name(&request.spec.restore_name), request.spec.clone());
                job.metadata.namespace = Some(namespace.clone());
                job.metadata.labels = Some(job_labels);
                let job = restores.create(&job).await?;
                info!(name = %job.name_any(), pool = %pool, "Restore created");
                job
            }
        };

        jobs.push(update_status(restores, &saved, RestoreStatus::Pending, None).await?);
    }
    Ok(jobs)
}

/// Observed status of one job: an unfinished job on a stalled pool is
/// `Failed`; one whose pool cannot be checked counts as `InProgress`
async fn observe_restore(checker: &HealthChecker, labels: &LabelKeys, job: &CStorRestore) -> RestoreStatus {
    let stored = job.phase();
    if stored.is_finished() {
        return stored;
    }
    match checker.is_stalled(job.label(&labels.pool_uid)).await {
        Ok(true) => RestoreStatus::Failed,
        Ok(false) => stored,
        Err(e) => {
            warn!(name = %job.name_any(), error = %e, "Restore pool health indeterminate");
            RestoreStatus::InProgress
        }
    }
}

/// Volume-level status of a restore request.
///
/// Any job in progress yields `InProgress` at once. Otherwise the result is
/// `Failed` if any job failed, else the last observed status. Jobs observed
/// as failed on a stalled pool are corrected in place.
#[instrument(skip_all, fields(restore = %request.spec.restore_name, volume = %request.spec.volume_name))]
pub async fn get_restore_status(
    restores: &dyn JobStore<CStorRestore>,
    checker: &HealthChecker,
    labels: &LabelKeys,
    request: &CStorRestore,
) -> Result<RestoreStatus> {
    let namespace = request.namespace().unwrap_or_default();
    let jobs = restores.list(Some(namespace.as_str()), None).await?;

    let mut aggregate = RestoreStatus::Empty;
    let mut any_failed = false;
    for job in jobs.iter().filter(|j| {
        j.spec.volume_name == request.spec.volume_name && j.spec.restore_name == request.spec.restore_name
    }) {
        let observed = observe_restore(checker, labels, job).await;
        debug!(name = %job.name_any(), stored = ?job.phase(), observed = ?observed, "Restore observed");

        match observed {
            RestoreStatus::InProgress => return Ok(RestoreStatus::InProgress),
            RestoreStatus::Failed => {
                any_failed = true;
                if job.phase() != RestoreStatus::Failed {
                    let message = Some("Pool instance unavailable".to_string());
                    if let Err(e) = update_status(restores, job, RestoreStatus::Failed, message).await {
                        warn!(name = %job.name_any(), error = %e, "Failed to correct restore status");
                    }
                }
            }
            _ => {}
        }
        aggregate = observed;
    }

    Ok(if any_failed { RestoreStatus::Failed } else { aggregate })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_jobs_start() {
        assert_eq!(status_after_add(RestoreStatus::Pending), RestoreStatus::Init);
        assert_eq!(status_after_add(RestoreStatus::Done), RestoreStatus::Invalid);
        assert_eq!(status_after_add(RestoreStatus::Empty), RestoreStatus::Invalid);
    }
}
