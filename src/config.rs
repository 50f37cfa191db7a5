//! Operator configuration
//!
//! Read once from the environment in `main` and passed down explicitly;
//! nothing below this module looks at environment variables.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Namespace of the control-plane deployment
pub const ENV_NAMESPACE: &str = "OPENEBS_NAMESPACE";
/// Identifier of the pool instance this process manages
pub const ENV_POOL_ID: &str = "OPENEBS_IO_CSTOR_ID";

/// Label and container names shared by records, replicas and pool pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelKeys {
    /// Pool-instance identity label on jobs, replicas and pool pods
    pub pool_uid: String,
    /// Persistent-volume identity label
    pub persistent_volume: String,
    /// Backup name label
    pub backup: String,
    /// Restore name label
    pub restore: String,
    /// Storage-management container inspected for pod readiness
    pub pool_mgmt_container: String,
    /// Selector matching pool pods
    pub pool_pod_selector: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            pool_uid: "cstorpool.openebs.io/uid".to_string(),
            persistent_volume: "openebs.io/persistent-volume".to_string(),
            backup: "openebs.io/backup".to_string(),
            restore: "openebs.io/restore".to_string(),
            pool_mgmt_container: "cstor-pool-mgmt".to_string(),
            pool_pod_selector: "app=cstor-pool".to_string(),
        }
    }
}

/// The pool instance a controller acts for.
///
/// Ownership is a pure function of this identity and a record's labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerIdentity {
    pool_id: String,
    label_key: String,
}

impl ControllerIdentity {
    pub fn new(pool_id: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            label_key: label_key.into(),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn label_key(&self) -> &str {
        &self.label_key
    }

    /// Whether a record with these labels belongs to this pool instance
    pub fn owns(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.pool_id.is_empty()
            && labels
                .get(&self.label_key)
                .is_some_and(|v| *v == self.pool_id)
    }

    /// Label selector listing only owned records
    pub fn selector(&self) -> String {
        format!("{}={}", self.label_key, self.pool_id)
    }
}

/// Complete operator configuration
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Control-plane namespace, used to find pool pods
    pub namespace: Option<String>,
    /// Pool instance identifier; controllers only run when set
    pub pool_id: Option<String>,
    pub labels: LabelKeys,
    /// Prefix of the pool name in dataset paths (`<prefix><pool id>/<volume>`)
    pub pool_dataset_prefix: String,
    pub workers: usize,
    pub resync_period: Duration,
    pub http_port: u16,
    /// Serve the /backup and /restore endpoints
    pub enable_api: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            pool_id: None,
            labels: LabelKeys::default(),
            pool_dataset_prefix: "cstor-".to_string(),
            workers: 2,
            resync_period: Duration::from_secs(30),
            http_port: 8080,
            enable_api: false,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let labels = LabelKeys {
            pool_uid: get("POOL_UID_LABEL").unwrap_or(defaults.labels.pool_uid),
            persistent_volume: get("PERSISTENT_VOLUME_LABEL")
                .unwrap_or(defaults.labels.persistent_volume),
            backup: get("BACKUP_LABEL").unwrap_or(defaults.labels.backup),
            restore: get("RESTORE_LABEL").unwrap_or(defaults.labels.restore),
            pool_mgmt_container: get("POOL_MGMT_CONTAINER")
                .unwrap_or(defaults.labels.pool_mgmt_container),
            pool_pod_selector: get("POOL_POD_SELECTOR")
                .unwrap_or(defaults.labels.pool_pod_selector),
        };

        let workers = parse_or(get("CONTROLLER_WORKERS"), "CONTROLLER_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(Error::config("CONTROLLER_WORKERS must be at least 1"));
        }
        let resync_secs = parse_or(
            get("RESYNC_PERIOD_SECS"),
            "RESYNC_PERIOD_SECS",
            defaults.resync_period.as_secs(),
        )?;

        Ok(Self {
            namespace: get(ENV_NAMESPACE),
            pool_id: get(ENV_POOL_ID),
            labels,
            pool_dataset_prefix: get("POOL_DATASET_PREFIX").unwrap_or(defaults.pool_dataset_prefix),
            workers,
            resync_period: Duration::from_secs(resync_secs.max(1)),
            http_port: parse_or(get("HTTP_PORT"), "HTTP_PORT", defaults.http_port)?,
            enable_api: parse_or(get("ENABLE_BACKUP_API"), "ENABLE_BACKUP_API", defaults.enable_api)?,
        })
    }

    /// Identity for the controllers, if this process runs next to a pool
    pub fn identity(&self) -> Option<ControllerIdentity> {
        self.pool_id
            .as_ref()
            .map(|id| ControllerIdentity::new(id.clone(), self.labels.pool_uid.clone()))
    }

    /// Control-plane namespace, required for health probing
    pub fn require_namespace(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .ok_or_else(|| Error::config(format!("{} is not set", ENV_NAMESPACE)))
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, v, e))),
    }
}
