//! Shared fixtures and fakes for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, Node, NodeCondition, NodeStatus, ObjectReference, Pod, PodSpec, PodStatus,
};
use kube::api::ObjectMeta;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use cstor_backup_operator::config::{ControllerIdentity, LabelKeys};
use cstor_backup_operator::controllers::events::{EventRecorder, JobEventNote};
use cstor_backup_operator::controllers::Context;
use cstor_backup_operator::crd::{
    BackupStatus, CStorBackup, CStorBackupCompleted, CStorBackupCompletedSpec, CStorBackupSpec, CStorRestore,
    CStorRestoreSpec, CStorVolumeReplica, CStorVolumeReplicaSpec, CStorVolumeReplicaStatus, RestoreStatus,
};
use cstor_backup_operator::error::{Error, Result};
use cstor_backup_operator::health::{ClusterView, HealthChecker};
use cstor_backup_operator::ledger::Ledger;
use cstor_backup_operator::store::{JobStore, MemoryStore};
use cstor_backup_operator::transfer::VolumeTransfer;
use cstor_backup_operator::zfs::{CommandLine, CommandOutput, CommandRunner};

pub const NS: &str = "openebs";
pub const POOL: &str = "pool-a";
pub const DEST: &str = "10.0.0.9:9000";

pub fn labels() -> LabelKeys {
    LabelKeys::default()
}

pub fn identity() -> ControllerIdentity {
    ControllerIdentity::new(POOL, labels().pool_uid)
}

// ============================================================================
// Record fixtures
// ============================================================================

/// Backup job `snap-volume` on `pool` with the given phase
pub fn backup_on(pool: &str, volume: &str, snap: &str, phase: BackupStatus) -> CStorBackup {
    let keys = labels();
    let spec = CStorBackupSpec {
        backup_name: "daily".to_string(),
        volume_name: volume.to_string(),
        snap_name: snap.to_string(),
        backup_dest: DEST.to_string(),
        ..Default::default()
    };
    let mut job = CStorBackup::new(&format!("{}-{}", snap, volume), spec);
    job.metadata.namespace = Some(NS.to_string());
    job.metadata.labels = Some(BTreeMap::from([
        (keys.pool_uid, pool.to_string()),
        (keys.persistent_volume, volume.to_string()),
        (keys.backup, "daily".to_string()),
    ]));
    if phase != BackupStatus::Empty {
        job.set_phase(phase, None);
    }
    job
}

pub fn backup(snap: &str, phase: BackupStatus) -> CStorBackup {
    backup_on(POOL, "vol1", snap, phase)
}

/// Restore job named `name` for `restore_name` on `pool`
pub fn restore_on(pool: &str, name: &str, restore_name: &str, phase: RestoreStatus) -> CStorRestore {
    let keys = labels();
    let spec = CStorRestoreSpec {
        restore_name: restore_name.to_string(),
        volume_name: "vol1".to_string(),
        restore_src: DEST.to_string(),
    };
    let mut job = CStorRestore::new(name, spec);
    job.metadata.namespace = Some(NS.to_string());
    job.metadata.labels = Some(BTreeMap::from([
        (keys.pool_uid, pool.to_string()),
        (keys.persistent_volume, "vol1".to_string()),
        (keys.restore, restore_name.to_string()),
    ]));
    if phase != RestoreStatus::Empty {
        job.set_phase(phase, None);
    }
    job
}

/// Restore request as received by the HTTP surface
pub fn restore_request(restore_name: &str) -> CStorRestore {
    let mut request = CStorRestore::new(
        restore_name,
        CStorRestoreSpec {
            restore_name: restore_name.to_string(),
            volume_name: "vol1".to_string(),
            restore_src: DEST.to_string(),
        },
    );
    request.metadata.namespace = Some(NS.to_string());
    request
}

pub fn completed(volume: &str, snap: &str, prev: &str) -> CStorBackupCompleted {
    let mut record = CStorBackupCompleted::new(
        &format!("daily-{}", volume),
        CStorBackupCompletedSpec {
            backup_name: "daily".to_string(),
            volume_name: volume.to_string(),
            snap_name: snap.to_string(),
            prev_snap_name: prev.to_string(),
        },
    );
    record.metadata.namespace = Some(NS.to_string());
    record
}

/// Replica of `volume`; `pool` of `None` leaves the pool label off
pub fn replica(name: &str, pool: Option<&str>, volume: &str, phase: &str) -> CStorVolumeReplica {
    let keys = labels();
    let mut labels = BTreeMap::from([(keys.persistent_volume, volume.to_string())]);
    if let Some(pool) = pool {
        labels.insert(keys.pool_uid, pool.to_string());
    }
    let mut replica = CStorVolumeReplica::new(name, CStorVolumeReplicaSpec::default());
    replica.metadata.namespace = Some(NS.to_string());
    replica.metadata.labels = Some(labels);
    replica.status = Some(CStorVolumeReplicaStatus {
        phase: phase.to_string(),
    });
    replica
}

// ============================================================================
// Cluster fixtures
// ============================================================================

/// Pool pod labelled with `pool`, scheduled on `node` when given
pub fn pool_pod(pool: &str, node: Option<&str>, mgmt_ready: bool) -> Pod {
    let keys = labels();
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("cstor-{}-0", pool)),
            namespace: Some(NS.to_string()),
            labels: Some(BTreeMap::from([
                ("app".to_string(), "cstor-pool".to_string()),
                (keys.pool_uid, pool.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            containers: vec![Container {
                name: keys.pool_mgmt_container.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: keys.pool_mgmt_container,
                ready: mgmt_ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

pub fn node(name: &str, ready: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: (if ready { "True" } else { "False" }).to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// In-memory pods and nodes; selectors are ignored
#[derive(Default)]
pub struct FakeCluster {
    pub pods: Mutex<Vec<Pod>>,
    pub nodes: Mutex<HashMap<String, Node>>,
    pub unreachable: AtomicBool,
}

impl FakeCluster {
    /// Healthy pool pod on a ready node for every pool
    pub fn healthy(pools: &[&str]) -> Self {
        let cluster = Self::default();
        for pool in pools {
            cluster.add_pool(pool, Some(&format!("node-{}", pool)), true, true);
        }
        cluster
    }

    pub fn add_pool(&self, pool: &str, node_name: Option<&str>, node_ready: bool, mgmt_ready: bool) {
        self.pods.lock().unwrap().push(pool_pod(pool, node_name, mgmt_ready));
        if let Some(name) = node_name {
            self.nodes.lock().unwrap().insert(name.to_string(), node(name, node_ready));
        }
    }
}

#[async_trait]
impl ClusterView for FakeCluster {
    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::config("cluster unreachable"));
        }
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }
}

pub fn checker(cluster: FakeCluster) -> HealthChecker {
    HealthChecker::new(Arc::new(cluster), NS, labels())
}

// ============================================================================
// Fakes for the controller seams
// ============================================================================

/// Records every command and fails when told to
#[derive(Default)]
pub struct ScriptedRunner {
    pub commands: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

impl ScriptedRunner {
    pub fn failing() -> Self {
        let runner = Self::default();
        runner.fail.store(true, Ordering::SeqCst);
        runner
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandLine) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.pipeline());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::CommandFailed {
                command: command.pipeline(),
                status: Some(1),
                output: "cannot open dataset".to_string(),
            });
        }
        Ok(CommandOutput {
            output: String::new(),
        })
    }
}

/// Store whose next writes fail with a retryable conflict
pub struct FlakyStore<K> {
    pub inner: Arc<MemoryStore<K>>,
    pub failing_updates: AtomicUsize,
    pub failing_status_updates: AtomicUsize,
}

impl<K> FlakyStore<K> {
    pub fn new(inner: Arc<MemoryStore<K>>) -> Self {
        Self {
            inner,
            failing_updates: AtomicUsize::new(0),
            failing_status_updates: AtomicUsize::new(0),
        }
    }

    fn take_failure(counter: &AtomicUsize) -> Result<()> {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining > 0 {
            counter.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Conflict("transient".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> JobStore<K> for FlakyStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.inner.get(namespace, name).await
    }

    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>> {
        self.inner.list(namespace, selector).await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.inner.create(obj).await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        Self::take_failure(&self.failing_updates)?;
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        Self::take_failure(&self.failing_status_updates)?;
        self.inner.update_status(obj).await
    }
}

/// Counts transfers and fails them on demand
#[derive(Default)]
pub struct FakeTransfer {
    pub sends: AtomicUsize,
    pub receives: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeTransfer {
    fn outcome(&self, name: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::CommandFailed {
                command: format!("zfs send {}", name),
                status: Some(1),
                output: "broken pipe".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeTransfer for FakeTransfer {
    async fn send_backup(&self, job: &CStorBackup) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.outcome(&job.spec.snap_name)
    }

    async fn receive_restore(&self, job: &CStorRestore) -> Result<()> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        self.outcome(&job.spec.restore_name)
    }
}

/// Keeps every published event
#[derive(Default)]
pub struct RecordingRecorder {
    pub events: Mutex<Vec<(String, JobEventNote)>>,
}

impl RecordingRecorder {
    pub fn reasons(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|(_, n)| n.reason).collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingRecorder {
    async fn record(&self, component: &str, _target: ObjectReference, note: JobEventNote) -> Result<()> {
        self.events.lock().unwrap().push((component.to_string(), note));
        Ok(())
    }
}

// ============================================================================
// Controller harness
// ============================================================================

pub struct Harness {
    pub ctx: Context,
    pub backups: Arc<MemoryStore<CStorBackup>>,
    pub restores: Arc<MemoryStore<CStorRestore>>,
    pub completed: Arc<MemoryStore<CStorBackupCompleted>>,
    pub transfer: Arc<FakeTransfer>,
    pub recorder: Arc<RecordingRecorder>,
}

impl Harness {
    pub fn new() -> Self {
        let backups = Arc::new(MemoryStore::<CStorBackup>::new());
        let restores = Arc::new(MemoryStore::<CStorRestore>::new());
        let completed = Arc::new(MemoryStore::<CStorBackupCompleted>::new());
        let transfer = Arc::new(FakeTransfer::default());
        let recorder = Arc::new(RecordingRecorder::default());

        let backup_store: Arc<dyn JobStore<CStorBackup>> = backups.clone();
        let restore_store: Arc<dyn JobStore<CStorRestore>> = restores.clone();
        let completed_store: Arc<dyn JobStore<CStorBackupCompleted>> = completed.clone();
        let transfer_seam: Arc<dyn VolumeTransfer> = transfer.clone();
        let recorder_seam: Arc<dyn EventRecorder> = recorder.clone();

        let ctx = Context {
            identity: identity(),
            backups: backup_store,
            restores: restore_store,
            ledger: Ledger::new(completed_store),
            transfer: transfer_seam,
            recorder: recorder_seam,
        };
        Self {
            ctx,
            backups,
            restores,
            completed,
            transfer,
            recorder,
        }
    }

    pub fn backup_phase(&self, name: &str) -> BackupStatus {
        self.backups
            .all()
            .into_iter()
            .find(|b| b.metadata.name.as_deref() == Some(name))
            .map(|b| b.phase())
            .unwrap_or_default()
    }

    pub fn restore_phase(&self, name: &str) -> RestoreStatus {
        self.restores
            .all()
            .into_iter()
            .find(|r| r.metadata.name.as_deref() == Some(name))
            .map(|r| r.phase())
            .unwrap_or_default()
    }
}
