//! CStorRestore Custom Resource Definition

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::validation::Predicate;

/// CStorRestore resource specification.
///
/// A restore request targets a volume and is fanned out into one record per
/// replica. Record names carry a random suffix; the pool-instance and
/// persistent-volume labels identify the replica.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorRestore",
    plural = "cstorrestores",
    singular = "cstorrestore",
    shortname = "crst",
    namespaced,
    status = "CStorRestoreStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Restore", "type": "string", "jsonPath": ".spec.restoreName"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorRestoreSpec {
    /// Name of the restore request
    #[serde(default)]
    pub restore_name: String,

    /// Volume being restored
    #[serde(default)]
    pub volume_name: String,

    /// Source of the snapshot stream (`host:port`)
    #[serde(default)]
    pub restore_src: String,
}

/// Lifecycle of a restore job
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum RestoreStatus {
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

impl RestoreStatus {
    /// Whether the job reached `Done` or `Failed`
    pub fn is_finished(self) -> bool {
        matches!(self, RestoreStatus::Done | RestoreStatus::Failed)
    }
}

/// CStorRestore status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CStorRestoreStatus {
    /// Current phase of the job
    #[serde(default)]
    pub phase: RestoreStatus,

    /// Human-readable message; written as null so a status patch clears it
    #[serde(default)]
    pub message: Option<String>,

    /// Last phase change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Fresh record name for a restore request
pub fn generate_restore_name(restore_name: &str) -> String {
    format!("{}-{}", restore_name, uuid::Uuid::new_v4())
}

impl CStorRestore {
    /// Current phase; a missing status is `Empty`
    pub fn phase(&self) -> RestoreStatus {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Replace the status with a new phase
    pub fn set_phase(&mut self, phase: RestoreStatus, message: Option<String>) {
        self.status = Some(CStorRestoreStatus {
            phase,
            message,
            last_transition_time: Some(Utc::now()),
        });
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

fn restore_name_set(r: &CStorRestore) -> bool {
    !r.spec.restore_name.is_empty()
}

fn volume_name_set(r: &CStorRestore) -> bool {
    !r.spec.volume_name.is_empty()
}

fn restore_src_set(r: &CStorRestore) -> bool {
    !r.spec.restore_src.is_empty()
}

fn namespace_set(r: &CStorRestore) -> bool {
    r.metadata.namespace.as_deref().is_some_and(|ns| !ns.is_empty())
}

pub const IS_RESTORE_NAME_SET: Predicate<CStorRestore> =
    Predicate::new("restoreName is set", restore_name_set);
pub const IS_RESTORE_VOLUME_NAME_SET: Predicate<CStorRestore> =
    Predicate::new("volumeName is set", volume_name_set);
pub const IS_RESTORE_SRC_SET: Predicate<CStorRestore> = Predicate::new("restoreSrc is set", restore_src_set);
pub const IS_RESTORE_NAMESPACE_SET: Predicate<CStorRestore> =
    Predicate::new("namespace is set", namespace_set);
