//! Snapshot transfer for backup and restore jobs

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::crd::{CStorBackup, CStorRestore};
use crate::error::{Error, Result};
use crate::metrics::TRANSFER_DURATION;
use crate::zfs::{execute, CommandRunner, PeerAddress, VolumeSnapshot};

/// Moves snapshot data between the pool and a remote peer
#[async_trait]
pub trait VolumeTransfer: Send + Sync {
    /// Stream `snapName` (incremental from `prevSnapName` when set) to `backupDest`
    async fn send_backup(&self, job: &CStorBackup) -> Result<()>;

    /// Receive a stream from `restoreSrc` into the volume's dataset
    async fn receive_restore(&self, job: &CStorRestore) -> Result<()>;
}

/// [`VolumeTransfer`] built on the storage-engine command builder.
///
/// Datasets are addressed as `<prefix><pool id>/<volume>`.
pub struct ZfsVolumeTransfer {
    runner: Arc<dyn CommandRunner>,
    dataset_prefix: String,
    pool_id: String,
}

impl ZfsVolumeTransfer {
    pub fn new(runner: Arc<dyn CommandRunner>, dataset_prefix: impl Into<String>, pool_id: impl Into<String>) -> Self {
        Self {
            runner,
            dataset_prefix: dataset_prefix.into(),
            pool_id: pool_id.into(),
        }
    }

    pub fn dataset(&self, volume: &str) -> String {
        format!("{}{}/{}", self.dataset_prefix, self.pool_id, volume)
    }

    /// Send command for a backup job, without running it
    pub fn backup_command(&self, job: &CStorBackup) -> Result<VolumeSnapshot> {
        let peer = PeerAddress::parse(&job.spec.backup_dest)?;
        let last = if job.spec.prev_snap_name == job.spec.snap_name {
            ""
        } else {
            job.spec.prev_snap_name.as_str()
        };
        Ok(VolumeSnapshot::send()
            .with_dataset(self.dataset(&job.spec.volume_name))
            .with_snapshot(job.spec.snap_name.clone())
            .with_last_snapshot(last)
            .with_peer(peer))
    }

    /// Receive command for a restore job, without running it
    pub fn restore_command(&self, job: &CStorRestore) -> Result<VolumeSnapshot> {
        let peer = PeerAddress::parse(&job.spec.restore_src)?;
        Ok(VolumeSnapshot::receive()
            .with_dataset(self.dataset(&job.spec.volume_name))
            .with_snapshot(job.spec.restore_name.clone())
            .with_force(true)
            .with_peer(peer))
    }
}

#[async_trait]
impl VolumeTransfer for ZfsVolumeTransfer {
    #[instrument(skip(self, job), fields(name = %job.name_any()))]
    async fn send_backup(&self, job: &CStorBackup) -> Result<()> {
        let start = Instant::now();
        let name = job.name_any();
        let command = self.backup_command(job).map_err(|e| Error::transfer(&name, e))?;
        execute(&command, self.runner.as_ref())
            .await
            .map_err(|e| Error::transfer(&name, e))?;

        let elapsed = start.elapsed().as_secs_f64();
        TRANSFER_DURATION.with_label_values(&["backup"]).observe(elapsed);
        info!(snap = %job.spec.snap_name, dest = %job.spec.backup_dest, elapsed_secs = elapsed, "Snapshot sent");
        Ok(())
    }

    #[instrument(skip(self, job), fields(name = %job.name_any()))]
    async fn receive_restore(&self, job: &CStorRestore) -> Result<()> {
        let start = Instant::now();
        let name = job.name_any();
        let command = self.restore_command(job).map_err(|e| Error::transfer(&name, e))?;
        execute(&command, self.runner.as_ref())
            .await
            .map_err(|e| Error::transfer(&name, e))?;

        let elapsed = start.elapsed().as_secs_f64();
        TRANSFER_DURATION.with_label_values(&["restore"]).observe(elapsed);
        info!(restore = %job.spec.restore_name, src = %job.spec.restore_src, elapsed_secs = elapsed, "Snapshot received");
        Ok(())
    }
}
