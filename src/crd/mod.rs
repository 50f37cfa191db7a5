//! Custom Resource Definitions for the cStor backup operator

mod backup;
mod completed;
mod replica;
mod restore;

pub use backup::*;
pub use completed::*;
pub use replica::*;
pub use restore::*;

use kube::CustomResourceExt;

/// Generate the YAML manifests for the records this operator owns.
///
/// `CStorVolumeReplica` belongs to the provisioner and is not emitted.
pub fn generate_crds() -> Result<Vec<String>, serde_yaml::Error> {
    Ok(vec![
        serde_yaml::to_string(&CStorBackup::crd())?,
        serde_yaml::to_string(&CStorBackupCompleted::crd())?,
        serde_yaml::to_string(&CStorRestore::crd())?,
    ])
}
