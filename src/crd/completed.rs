//! CStorBackupCompleted Custom Resource Definition
//!
//! The completed-backup ledger: one record per volume holding the last two
//! snapshots that were transferred successfully.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorBackupCompleted",
    plural = "cstorbackupcompleteds",
    singular = "cstorbackupcompleted",
    namespaced,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.backupName"}"#,
    printcolumn = r#"{"name": "LastSnap", "type": "string", "jsonPath": ".spec.snapName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorBackupCompletedSpec {
    #[serde(default)]
    pub backup_name: String,

    #[serde(default)]
    pub volume_name: String,

    /// Last transferred snapshot
    #[serde(default)]
    pub snap_name: String,

    /// Snapshot transferred before `snap_name`
    #[serde(default)]
    pub prev_snap_name: String,
}
