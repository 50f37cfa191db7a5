//! Backup and restore request handlers
//!
//! Request bodies carry the record shape (`metadata` + `spec`). Every
//! handler validates its request with named predicates before touching the
//! store, so a client sees all missing fields at once.

use std::fmt;
use std::sync::Arc;

use hyper::StatusCode;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LabelKeys;
use crate::crd::{
    derive_backup_name, CStorBackup, CStorBackupSpec, CStorRestore, CStorRestoreSpec, CStorVolumeReplica,
    IS_BACKUP_DEST_SET, IS_BACKUP_NAME_SET, IS_NAMESPACE_SET, IS_PREV_SNAP_NAME_SET, IS_RESTORE_NAMESPACE_SET,
    IS_RESTORE_NAME_SET, IS_RESTORE_SRC_SET, IS_RESTORE_VOLUME_NAME_SET, IS_SNAP_NAME_SET, IS_VOLUME_NAME_SET,
};
use crate::error::Error;
use crate::health::HealthChecker;
use crate::ledger::Ledger;
use crate::reconcilers::{backup as backup_reconciler, restore as restore_reconciler};
use crate::store::JobStore;
use crate::validation::{run_checks, Predicate};

/// Everything the request handlers read and write
pub struct ApiContext {
    pub backups: Arc<dyn JobStore<CStorBackup>>,
    pub restores: Arc<dyn JobStore<CStorRestore>>,
    pub replicas: Arc<dyn JobStore<CStorVolumeReplica>>,
    pub ledger: Ledger,
    pub checker: HealthChecker,
    pub labels: LabelKeys,
}

/// A failed request: status code and message for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

pub type ApiResult = std::result::Result<Vec<u8>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct BackupRequest {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CStorBackupSpec,
}

impl BackupRequest {
    pub fn into_job(self) -> CStorBackup {
        let name = derive_backup_name(&self.spec.snap_name, &self.spec.volume_name);
        let mut job = CStorBackup::new(&name, self.spec);
        job.metadata.namespace = self.metadata.namespace;
        job.metadata.labels = self.metadata.labels;
        job
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CStorRestoreSpec,
}

impl RestoreRequest {
    pub fn into_job(self) -> CStorRestore {
        let name = self.spec.restore_name.clone();
        let mut job = CStorRestore::new(&name, self.spec);
        job.metadata.namespace = self.metadata.namespace;
        job
    }
}

const CREATE_BACKUP_CHECKS: [Predicate<CStorBackup>; 6] = [
    IS_BACKUP_NAME_SET,
    IS_SNAP_NAME_SET,
    IS_BACKUP_DEST_SET,
    IS_PREV_SNAP_NAME_SET,
    IS_NAMESPACE_SET,
    IS_VOLUME_NAME_SET,
];

const GET_BACKUP_CHECKS: [Predicate<CStorBackup>; 4] =
    [IS_BACKUP_NAME_SET, IS_NAMESPACE_SET, IS_VOLUME_NAME_SET, IS_SNAP_NAME_SET];

const CREATE_RESTORE_CHECKS: [Predicate<CStorRestore>; 4] = [
    IS_RESTORE_NAME_SET,
    IS_RESTORE_VOLUME_NAME_SET,
    IS_RESTORE_NAMESPACE_SET,
    IS_RESTORE_SRC_SET,
];

const GET_RESTORE_CHECKS: [Predicate<CStorRestore>; 3] =
    [IS_RESTORE_NAME_SET, IS_RESTORE_NAMESPACE_SET, IS_RESTORE_VOLUME_NAME_SET];

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> std::result::Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Failed to decode request body: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> ApiResult {
    serde_json::to_vec(value).map_err(|e| ApiError::bad_request(format!("Failed to encode response data: {}", e)))
}

/// `POST /backup`: schedule a backup on a healthy replica of the volume
pub async fn create_backup(ctx: &ApiContext, body: &[u8]) -> ApiResult {
    let job = decode::<BackupRequest>(body)?.into_job();
    run_checks("backup request", &job, &CREATE_BACKUP_CHECKS)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse backup request: {}", e)))?;

    let job = backup_reconciler::deploy_backup(
        ctx.backups.as_ref(),
        ctx.replicas.as_ref(),
        &ctx.ledger,
        &ctx.labels,
        job,
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "Failed to deploy backup");
        ApiError::bad_request(format!("Failed to deploy backup: {}", e))
    })?;
    encode(&job)
}

/// `GET /backup`: current job, resolved first if its pool has stalled
pub async fn get_backup(ctx: &ApiContext, body: &[u8]) -> ApiResult {
    let job = decode::<BackupRequest>(body)?.into_job();
    run_checks("backup request", &job, &GET_BACKUP_CHECKS)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse backup request object: {}", e)))?;

    let namespace = job.metadata.namespace.clone().unwrap_or_default();
    let job = backup_reconciler::refresh_backup(
        ctx.backups.as_ref(),
        &ctx.ledger,
        &ctx.checker,
        &ctx.labels,
        &namespace,
        &job.derived_name(),
    )
    .await
    .map_err(|e| ApiError::bad_request(format!("Failed to fetch backup update: {}", e)))?;
    encode(&job)
}

/// `POST /restore`: fan the restore out to every replica of the volume
pub async fn create_restore(ctx: &ApiContext, body: &[u8]) -> ApiResult {
    let request = decode::<RestoreRequest>(body)?.into_job();
    run_checks("restore request", &request, &CREATE_RESTORE_CHECKS)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse restore request: {}", e)))?;

    let jobs = restore_reconciler::create_restore_resource(
        ctx.restores.as_ref(),
        ctx.replicas.as_ref(),
        &ctx.labels,
        &request,
    )
    .await
    .map_err(|e| match e {
        Error::Validation(_) | Error::Config(_) => ApiError::bad_request(e.to_string()),
        other => ApiError::internal(other.to_string()),
    })?;

    info!(
        restore = %request.spec.restore_name,
        volume = %request.spec.volume_name,
        jobs = jobs.len(),
        "Restore scheduled"
    );
    encode(&jobs)
}

/// `GET /restore`: volume-level status aggregated over the replica jobs
pub async fn get_restore(ctx: &ApiContext, body: &[u8]) -> ApiResult {
    let request = decode::<RestoreRequest>(body)?.into_job();
    run_checks("restore request", &request, &GET_RESTORE_CHECKS)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse restore request: {}", e)))?;

    let status = restore_reconciler::get_restore_status(ctx.restores.as_ref(), &ctx.checker, &ctx.labels, &request)
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed to fetch status: {}", e)))?;
    encode(&status)
}
