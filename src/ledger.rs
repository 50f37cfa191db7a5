//! Completed-backup ledger
//!
//! One `CStorBackupCompleted` record per `backupName-volumeName` holds the
//! last two snapshots that were transferred. It seeds `prevSnapName` of the
//! next backup and decides the outcome of stalled jobs.

use std::sync::Arc;

use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::crd::{CStorBackup, CStorBackupCompleted, CStorBackupCompletedSpec};
use crate::error::{Error, Result};
use crate::store::JobStore;

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn JobStore<CStorBackupCompleted>>,
}

impl Ledger {
    pub fn new(store: Arc<dyn JobStore<CStorBackupCompleted>>) -> Self {
        Self { store }
    }

    fn namespace(job: &CStorBackup) -> Result<&str> {
        job.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| Error::config(format!("backup {} has no namespace", job.derived_name())))
    }

    /// Last snapshot transferred for the job's volume; empty when no backup
    /// completed yet
    pub async fn last_transferred_snap_name(&self, job: &CStorBackup) -> Result<String> {
        let namespace = Self::namespace(job)?;
        let name = job.completed_backup_name();
        match self.store.get(namespace, &name).await? {
            Some(record) => Ok(record.spec.snap_name),
            None => {
                debug!(name = %name, namespace = %namespace, "No completed backup recorded");
                Ok(String::new())
            }
        }
    }

    /// Record a successful transfer of `job.spec.snap_name`.
    ///
    /// The previous last snapshot shifts into `prevSnapName`. Recording the
    /// same snapshot twice leaves the record unchanged.
    pub async fn update_completed_backup(&self, job: &CStorBackup) -> Result<CStorBackupCompleted> {
        let namespace = Self::namespace(job)?;
        let name = job.completed_backup_name();

        match self.store.get(namespace, &name).await? {
            Some(record) if record.spec.snap_name == job.spec.snap_name => {
                debug!(name = %name, snap = %record.spec.snap_name, "Snapshot already recorded");
                Ok(record)
            }
            Some(mut record) => {
                record.spec.prev_snap_name = std::mem::take(&mut record.spec.snap_name);
                record.spec.snap_name = job.spec.snap_name.clone();
                let updated = self.store.update(&record).await?;
                info!(
                    name = %name,
                    snap = %updated.spec.snap_name,
                    prev_snap = %updated.spec.prev_snap_name,
                    "Advanced completed backup"
                );
                Ok(updated)
            }
            None => {
                let record = CStorBackupCompleted {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.to_string()),
                        labels: job.metadata.labels.clone(),
                        ..Default::default()
                    },
                    spec: CStorBackupCompletedSpec {
                        backup_name: job.spec.backup_name.clone(),
                        volume_name: job.spec.volume_name.clone(),
                        snap_name: job.spec.snap_name.clone(),
                        prev_snap_name: String::new(),
                    },
                };
                let created = self.store.create(&record).await?;
                info!(name = %name, snap = %created.spec.snap_name, "Recorded first completed backup");
                Ok(created)
            }
        }
    }
}
