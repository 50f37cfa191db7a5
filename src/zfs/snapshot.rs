//! Snapshot create, send and receive

use super::{property_args, properties_are_safe, CommandLine, CommandSpec, PeerAddress, Stage, ZFS};
use crate::validation::{is_safe_token, Predicate};

/// Which dataset-snapshot operation is built
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SnapshotOperation {
    #[default]
    Snapshot,
    Send,
    Receive,
}

impl SnapshotOperation {
    fn as_str(self) -> &'static str {
        match self {
            SnapshotOperation::Snapshot => "snapshot",
            SnapshotOperation::Send => "send",
            SnapshotOperation::Receive => "receive",
        }
    }
}

/// `zfs snapshot`, `zfs send` and `zfs receive`.
///
/// Send streams to the peer (`zfs send ... | nc host port`); receive reads
/// from it (`nc host port | zfs receive ...`).
#[derive(Clone, Debug, Default)]
pub struct VolumeSnapshot {
    pub operation: SnapshotOperation,
    pub dataset: String,
    pub snapshot: String,
    pub properties: Vec<(String, String)>,
    pub peer: Option<PeerAddress>,
    pub last_snapshot: Option<String>,
    pub recursive: bool,
    pub dedup: bool,
    pub dry_run: bool,
    pub compression: bool,
    pub force: bool,
    checks: Vec<Predicate<VolumeSnapshot>>,
}

fn dataset_set(v: &VolumeSnapshot) -> bool {
    !v.dataset.is_empty()
}

fn dataset_safe(v: &VolumeSnapshot) -> bool {
    v.dataset.is_empty() || is_safe_token(&v.dataset)
}

fn snapshot_set(v: &VolumeSnapshot) -> bool {
    !v.snapshot.is_empty()
}

fn snapshot_safe(v: &VolumeSnapshot) -> bool {
    v.snapshot.is_empty() || (is_safe_token(&v.snapshot) && !v.snapshot.contains('@'))
}

fn last_snapshot_safe(v: &VolumeSnapshot) -> bool {
    v.last_snapshot
        .as_deref()
        .map_or(true, |s| is_safe_token(s) && !s.contains('@'))
}

fn peer_set(v: &VolumeSnapshot) -> bool {
    v.peer.is_some()
}

fn properties_safe(v: &VolumeSnapshot) -> bool {
    properties_are_safe(&v.properties)
}

pub const IS_DATASET_SET: Predicate<VolumeSnapshot> = Predicate::new("dataset is set", dataset_set);
pub const IS_SNAPSHOT_SET: Predicate<VolumeSnapshot> = Predicate::new("snapshot is set", snapshot_set);
pub const IS_PEER_SET: Predicate<VolumeSnapshot> = Predicate::new("peer address is set", peer_set);
const IS_DATASET_SAFE: Predicate<VolumeSnapshot> =
    Predicate::new("dataset name is a safe argument", dataset_safe);
const IS_SNAPSHOT_SAFE: Predicate<VolumeSnapshot> =
    Predicate::new("snapshot name is a safe argument", snapshot_safe);
const IS_LAST_SNAPSHOT_SAFE: Predicate<VolumeSnapshot> =
    Predicate::new("last snapshot name is a safe argument", last_snapshot_safe);
const ARE_PROPERTIES_SAFE: Predicate<VolumeSnapshot> =
    Predicate::new("properties are safe arguments", properties_safe);

impl VolumeSnapshot {
    /// `zfs snapshot`
    pub fn snapshot() -> Self {
        Self::default()
    }

    /// `zfs send ... | nc`
    pub fn send() -> Self {
        Self {
            operation: SnapshotOperation::Send,
            ..Self::default()
        }
    }

    /// `nc | zfs receive ...`
    pub fn receive() -> Self {
        Self {
            operation: SnapshotOperation::Receive,
            ..Self::default()
        }
    }

    pub fn with_check(mut self, check: Predicate<Self>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = snapshot.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn with_peer(mut self, peer: PeerAddress) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Base of an incremental send; empty means a full send
    pub fn with_last_snapshot(mut self, last: impl Into<String>) -> Self {
        let last = last.into();
        self.last_snapshot = (!last.is_empty()).then_some(last);
        self
    }

    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Roll the target back before receiving
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn target(&self) -> String {
        if self.snapshot.is_empty() {
            self.dataset.clone()
        } else {
            format!("{}@{}", self.dataset, self.snapshot)
        }
    }
}

impl CommandSpec for VolumeSnapshot {
    fn operation(&self) -> &'static str {
        self.operation.as_str()
    }

    fn checks(&self) -> Vec<Predicate<Self>> {
        let mut checks = match self.operation {
            SnapshotOperation::Snapshot => vec![IS_DATASET_SET, IS_SNAPSHOT_SET, ARE_PROPERTIES_SAFE],
            SnapshotOperation::Send => {
                vec![IS_DATASET_SET, IS_SNAPSHOT_SET, IS_PEER_SET, IS_LAST_SNAPSHOT_SAFE]
            }
            SnapshotOperation::Receive => vec![IS_DATASET_SET, IS_PEER_SET],
        };
        checks.extend([IS_DATASET_SAFE, IS_SNAPSHOT_SAFE]);
        checks.extend(self.checks.iter().copied());
        checks
    }

    fn assemble(&self) -> CommandLine {
        match self.operation {
            SnapshotOperation::Snapshot => {
                let stage = Stage::new(ZFS).arg("snapshot").arg_if(self.recursive, "-r");
                CommandLine::single(property_args(stage, &self.properties).arg(self.target()))
            }
            SnapshotOperation::Send => {
                let mut stage = Stage::new(ZFS)
                    .arg("send")
                    .arg_if(self.dedup, "-D")
                    .arg_if(self.compression, "-c")
                    .arg_if(self.dry_run, "-n");
                if let Some(last) = &self.last_snapshot {
                    stage = stage.arg("-i").arg(format!("@{}", last));
                }
                let stage = stage.arg(self.target());
                match &self.peer {
                    Some(peer) => CommandLine::piped_to(stage, peer.nc_stage()),
                    None => CommandLine::single(stage),
                }
            }
            SnapshotOperation::Receive => {
                let stage = Stage::new(ZFS)
                    .arg("receive")
                    .arg_if(self.force, "-F")
                    .arg_if(self.dry_run, "-n")
                    .arg(self.target());
                match &self.peer {
                    Some(peer) => CommandLine::piped_from(peer.nc_stage(), stage),
                    None => CommandLine::single(stage),
                }
            }
        }
    }
}
