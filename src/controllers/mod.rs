//! Controllers for cStor backup and restore records
//!
//! Each controller watches its record kind, filters events through the
//! ownership predicate, queues `(key, operation)` items and runs a fixed
//! pool of workers over the queue. The state machines live in
//! [`crate::reconcilers`].

mod backup_controller;
pub mod events;
mod restore_controller;
pub mod watch;

pub use backup_controller::run as run_backup_controller;
pub use restore_controller::run as run_restore_controller;

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::ControllerIdentity;
use crate::crd::{BackupStatus, CStorBackup, CStorRestore, RestoreStatus};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::metrics;
use crate::queue::{QueueItem, QueueOperation, WorkQueue};
use crate::store::{object_key, JobStore};
use crate::transfer::VolumeTransfer;
use events::{
    publish, EventRecorder, JobEventNote, MESSAGE_CREATE_SYNCED, MESSAGE_DESTROY_SYNCED,
    MESSAGE_MODIFY_SYNCED, REASON_SYNCED,
};
use watch::{EventHandler, JobEvent};

/// Shared context for both controllers
pub struct Context {
    /// Pool instance this process acts for
    pub identity: ControllerIdentity,
    pub backups: Arc<dyn JobStore<CStorBackup>>,
    pub restores: Arc<dyn JobStore<CStorRestore>>,
    pub ledger: Ledger,
    pub transfer: Arc<dyn VolumeTransfer>,
    pub recorder: Arc<dyn EventRecorder>,
}

/// Worker pool and resync settings of a controller
#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync: Duration,
}

/// A record kind driven by a controller
pub trait JobRecord: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static {
    /// Kind name used as event component and metric label
    const KIND: &'static str;

    fn is_pending(&self) -> bool;

    /// Status not written yet; the record is still being created
    fn has_empty_status(&self) -> bool;

    fn is_being_deleted(&self) -> bool;
}

impl JobRecord for CStorBackup {
    const KIND: &'static str = "CStorBackup";

    fn is_pending(&self) -> bool {
        self.phase() == BackupStatus::Pending
    }

    fn has_empty_status(&self) -> bool {
        self.phase() == BackupStatus::Empty
    }

    fn is_being_deleted(&self) -> bool {
        CStorBackup::is_being_deleted(self)
    }
}

impl JobRecord for CStorRestore {
    const KIND: &'static str = "CStorRestore";

    fn is_pending(&self) -> bool {
        self.phase() == RestoreStatus::Pending
    }

    fn has_empty_status(&self) -> bool {
        self.phase() == RestoreStatus::Empty
    }

    fn is_being_deleted(&self) -> bool {
        CStorRestore::is_being_deleted(self)
    }
}

/// Queue operation for an event, or `None` when nothing is queued.
///
/// Records not owned by `identity` are never queued. Updates with an
/// unchanged resource version are resync no-ops. An update that moves a
/// record into `Pending` is handled as an add, since the status of a new
/// record is written after it is created.
pub fn classify<K: JobRecord>(identity: &ControllerIdentity, event: &JobEvent<K>) -> Option<QueueOperation> {
    if !identity.owns(event.object().labels()) {
        return None;
    }
    match event {
        JobEvent::Add(obj) => (!obj.has_empty_status()).then_some(QueueOperation::Add),
        JobEvent::Update { old, new } => {
            if old.resource_version() == new.resource_version() {
                None
            } else if new.is_being_deleted() {
                Some(QueueOperation::Destroy)
            } else if new.is_pending() && !old.is_pending() {
                Some(QueueOperation::Add)
            } else {
                Some(QueueOperation::Sync)
            }
        }
        JobEvent::Delete(_) => None,
    }
}

/// Event handler that queues owned records
pub struct QueueingHandler<K> {
    identity: ControllerIdentity,
    queue: WorkQueue<QueueItem>,
    recorder: Arc<dyn EventRecorder>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> QueueingHandler<K> {
    pub fn new(identity: ControllerIdentity, queue: WorkQueue<QueueItem>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            identity,
            queue,
            recorder,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: JobRecord> EventHandler<K> for QueueingHandler<K> {
    async fn handle(&self, event: JobEvent<K>) {
        let obj = event.object();
        if let JobEvent::Delete(obj) = &event {
            if self.identity.owns(obj.labels()) {
                info!(kind = K::KIND, name = %obj.name_any(), uid = ?obj.uid(), "Record deleted");
            }
            return;
        }

        let Some(operation) = classify(&self.identity, &event) else {
            debug!(kind = K::KIND, name = %obj.name_any(), event = ?event.kind(), "Event ignored");
            return;
        };

        let message = match operation {
            QueueOperation::Add => MESSAGE_CREATE_SYNCED,
            QueueOperation::Sync => MESSAGE_MODIFY_SYNCED,
            QueueOperation::Destroy => MESSAGE_DESTROY_SYNCED,
        };
        publish(
            self.recorder.as_ref(),
            K::KIND,
            obj,
            JobEventNote::normal(REASON_SYNCED, message),
        )
        .await;

        let key = object_key(obj);
        debug!(kind = K::KIND, key = %key, op = %operation, "Queueing record");
        self.queue.add(QueueItem::new(key, operation));
        metrics::QUEUE_DEPTH
            .with_label_values(&[K::KIND])
            .set(self.queue.len() as f64);
    }
}

/// What happened to a processed queue item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settled {
    Done,
    /// Failed with an error that waiting cannot fix
    Dropped,
    Requeued,
}

/// Apply the worker outcome policy to a processed item
pub fn settle(queue: &WorkQueue<QueueItem>, kind: &str, item: &QueueItem, result: Result<()>) -> Settled {
    match result {
        Ok(()) => {
            queue.forget(item);
            Settled::Done
        }
        Err(e) if e.is_terminal() => {
            warn!(kind, key = %item.key, op = %item.operation, error = %e, "Dropping queue item");
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[kind, "false"])
                .inc();
            queue.forget(item);
            Settled::Dropped
        }
        Err(e) => {
            error!(
                kind,
                key = %item.key,
                op = %item.operation,
                requeues = queue.num_requeues(item),
                error = %e,
                "Reconciliation failed, scheduling retry"
            );
            metrics::RECONCILIATION_ERRORS
                .with_label_values(&[kind, "true"])
                .inc();
            queue.add_rate_limited(item.clone());
            Settled::Requeued
        }
    }
}

/// Run `workers` tasks over the queue until it is shut down.
///
/// Each task processes one item to completion before pulling the next.
pub async fn run_workers<F, Fut>(kind: &'static str, queue: WorkQueue<QueueItem>, workers: usize, process: F)
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let process = Arc::new(process);
    let handles = (0..workers.max(1)).map(|worker| {
        let queue = queue.clone();
        let process = Arc::clone(&process);
        tokio::spawn(async move {
            while let Some(item) = queue.get().await {
                metrics::QUEUE_DEPTH
                    .with_label_values(&[kind])
                    .set(queue.len() as f64);
                let _timer = metrics::RECONCILE_DURATION
                    .with_label_values(&[kind])
                    .start_timer();
                let op = item.operation.to_string();
                metrics::RECONCILIATIONS
                    .with_label_values(&[kind, op.as_str()])
                    .inc();

                let result = process(item.clone()).await;
                settle(&queue, kind, &item, result);
            }
            debug!(kind, worker, "Worker stopped");
        })
    });

    for joined in join_all(handles).await {
        if let Err(e) = joined {
            error!(kind, error = %e, "Worker task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CStorBackupSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const LABEL: &str = "cstorpool.openebs.io/uid";

    fn identity() -> ControllerIdentity {
        ControllerIdentity::new("pool-a", LABEL)
    }

    fn backup(pool: &str, version: &str, phase: BackupStatus) -> CStorBackup {
        let mut b = CStorBackup::new("s1-vol", CStorBackupSpec::default());
        b.metadata.namespace = Some("ns".to_string());
        b.metadata.resource_version = Some(version.to_string());
        b.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL.to_string(), pool.to_string());
        if phase != BackupStatus::Empty {
            b.set_phase(phase, None);
        }
        b
    }

    #[test]
    fn add_waits_for_status() {
        let id = identity();
        assert_eq!(classify(&id, &JobEvent::Add(backup("pool-a", "1", BackupStatus::Empty))), None);
        assert_eq!(
            classify(&id, &JobEvent::Add(backup("pool-a", "1", BackupStatus::Pending))),
            Some(QueueOperation::Add)
        );
    }

    #[test]
    fn update_classification() {
        let id = identity();
        let same = JobEvent::Update {
            old: backup("pool-a", "3", BackupStatus::Init),
            new: backup("pool-a", "3", BackupStatus::Init),
        };
        assert_eq!(classify(&id, &same), None);

        let into_pending = JobEvent::Update {
            old: backup("pool-a", "1", BackupStatus::Empty),
            new: backup("pool-a", "2", BackupStatus::Pending),
        };
        assert_eq!(classify(&id, &into_pending), Some(QueueOperation::Add));

        let progressed = JobEvent::Update {
            old: backup("pool-a", "2", BackupStatus::Pending),
            new: backup("pool-a", "3", BackupStatus::Init),
        };
        assert_eq!(classify(&id, &progressed), Some(QueueOperation::Sync));

        let mut deleting = backup("pool-a", "4", BackupStatus::Init);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let destroy = JobEvent::Update {
            old: backup("pool-a", "3", BackupStatus::Init),
            new: deleting,
        };
        assert_eq!(classify(&id, &destroy), Some(QueueOperation::Destroy));
    }

    #[test]
    fn foreign_records_are_never_queued() {
        let id = identity();
        assert_eq!(classify(&id, &JobEvent::Add(backup("pool-b", "1", BackupStatus::Pending))), None);
        let update = JobEvent::Update {
            old: backup("pool-b", "1", BackupStatus::Pending),
            new: backup("pool-b", "2", BackupStatus::Init),
        };
        assert_eq!(classify(&id, &update), None);
    }
}
