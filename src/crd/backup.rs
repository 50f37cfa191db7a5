//! CStorBackup Custom Resource Definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::validation::Predicate;

/// CStorBackup resource specification.
///
/// One record describes one backup of one volume replica. The record name is
/// always `snapName-volumeName` (see [`derive_backup_name`]), so re-issuing the
/// same request resolves to the same record.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorBackup",
    plural = "cstorbackups",
    singular = "cstorbackup",
    shortname = "cbkp",
    namespaced,
    status = "CStorBackupStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.backupName"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorBackupSpec {
    /// Name of the backup schedule/request this snapshot belongs to
    #[serde(default)]
    pub backup_name: String,

    /// Volume being backed up
    #[serde(default)]
    pub volume_name: String,

    /// Snapshot to transfer
    #[serde(default)]
    pub snap_name: String,

    /// Previously transferred snapshot (base of an incremental send)
    #[serde(default)]
    pub prev_snap_name: String,

    /// Destination of the snapshot stream (`host:port`)
    #[serde(default)]
    pub backup_dest: String,

    /// Asynchronous backup requested by the client
    #[serde(default, rename = "async")]
    pub async_backup: bool,

    /// Cloud credentials forwarded to the remote side
    #[serde(default)]
    pub cloud_cred: BTreeMap<CloudKey, String>,
}

/// Keys accepted in [`CStorBackupSpec::cloud_cred`]
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CloudKey {
    #[serde(rename = "provider")]
    Provider,
    #[serde(rename = "bucket")]
    Bucket,
    #[serde(rename = "prefix")]
    Prefix,
    #[serde(rename = "backupPathPrefix")]
    BackupPathPrefix,
    #[serde(rename = "region")]
    Region,
    #[serde(rename = "s3Url")]
    S3Url,
    #[serde(rename = "s3ForcePathStyle")]
    S3ForcePathStyle,
    #[serde(rename = "DisableSSL")]
    DisableSsl,
}

/// Lifecycle of a backup job
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BackupStatus {
    #[default]
    #[serde(rename = "")]
    Empty,
    Pending,
    Init,
    InProgress,
    Done,
    Failed,
    Invalid,
}

impl BackupStatus {
    /// Whether the job reached `Done` or `Failed`
    pub fn is_finished(self) -> bool {
        matches!(self, BackupStatus::Done | BackupStatus::Failed)
    }
}

/// CStorBackup status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorBackupStatus {
    /// Current phase of the job
    #[serde(default)]
    pub phase: BackupStatus,

    /// Human-readable message; written as null so a status patch clears it
    #[serde(default)]
    pub message: Option<String>,

    /// Last phase change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// The snapshot was transferred but the completed-backup ledger does not
    /// record it yet
    #[serde(default)]
    pub ledger_pending: bool,
}

/// Record name for a snapshot of a volume
pub fn derive_backup_name(snap_name: &str, volume_name: &str) -> String {
    format!("{}-{}", snap_name, volume_name)
}

impl CStorBackup {
    /// Current phase; a missing status is `Empty`
    pub fn phase(&self) -> BackupStatus {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Replace the status with a new phase
    pub fn set_phase(&mut self, phase: BackupStatus, message: Option<String>) {
        self.status = Some(CStorBackupStatus {
            phase,
            message,
            last_transition_time: Some(Utc::now()),
            ledger_pending: false,
        });
    }

    /// Whether a finished transfer still has to be written to the ledger
    pub fn ledger_pending(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ledger_pending)
    }

    pub fn set_ledger_pending(&mut self, pending: bool) {
        if let Some(status) = self.status.as_mut() {
            status.ledger_pending = pending;
        }
    }

    /// Name this record must carry
    pub fn derived_name(&self) -> String {
        derive_backup_name(&self.spec.snap_name, &self.spec.volume_name)
    }

    /// Key of the ledger record for this backup's volume
    pub fn completed_backup_name(&self) -> String {
        format!("{}-{}", self.spec.backup_name, self.spec.volume_name)
    }

    /// Value of a label, empty when missing
    pub fn label(&self, key: &str) -> &str {
        self.labels().get(key).map(String::as_str).unwrap_or("")
    }

    /// Deletion has been requested for this record
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

fn backup_name_set(b: &CStorBackup) -> bool {
    !b.spec.backup_name.is_empty()
}

fn volume_name_set(b: &CStorBackup) -> bool {
    !b.spec.volume_name.is_empty()
}

fn snap_name_set(b: &CStorBackup) -> bool {
    !b.spec.snap_name.is_empty()
}

fn prev_snap_name_set(b: &CStorBackup) -> bool {
    !b.spec.prev_snap_name.is_empty()
}

fn backup_dest_set(b: &CStorBackup) -> bool {
    !b.spec.backup_dest.is_empty()
}

fn namespace_set(b: &CStorBackup) -> bool {
    b.metadata.namespace.as_deref().is_some_and(|ns| !ns.is_empty())
}

pub const IS_BACKUP_NAME_SET: Predicate<CStorBackup> = Predicate::new("backupName is set", backup_name_set);
pub const IS_VOLUME_NAME_SET: Predicate<CStorBackup> = Predicate::new("volumeName is set", volume_name_set);
pub const IS_SNAP_NAME_SET: Predicate<CStorBackup> = Predicate::new("snapName is set", snap_name_set);
pub const IS_PREV_SNAP_NAME_SET: Predicate<CStorBackup> =
    Predicate::new("prevSnapName is set", prev_snap_name_set);
pub const IS_BACKUP_DEST_SET: Predicate<CStorBackup> = Predicate::new("backupDest is set", backup_dest_set);
pub const IS_NAMESPACE_SET: Predicate<CStorBackup> = Predicate::new("namespace is set", namespace_set);
