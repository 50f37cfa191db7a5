//! CStorVolumeReplica (read-only view)
//!
//! Replicas are owned by the volume provisioner; only their labels and phase
//! are read here, to pick backup sources and to fan restores out.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase reported by a replica that is serving I/O
pub const REPLICA_HEALTHY: &str = "Healthy";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorVolumeReplica",
    plural = "cstorvolumereplicas",
    shortname = "cvr",
    namespaced,
    status = "CStorVolumeReplicaStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaSpec {
    #[serde(default, rename = "targetIP")]
    pub target_ip: String,

    #[serde(default)]
    pub capacity: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaStatus {
    #[serde(default)]
    pub phase: String,
}

impl CStorVolumeReplica {
    pub fn is_healthy(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == REPLICA_HEALTHY)
    }
}
