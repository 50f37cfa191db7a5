//! In-process [`JobStore`]
//!
//! Follows the API server's rules for custom resources with a status
//! subresource: `create` drops the status, `update` keeps the stored status,
//! `update_status` only changes the status, and every write requires the
//! caller's resource version to match the stored one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{parse_selector, JobStore};
use crate::error::{Error, Result};

type Key = (String, String);

pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    version: AtomicU64,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record verbatim, status included, assigning a fresh version
    pub fn insert(&self, mut obj: K) -> K {
        self.stamp(&mut obj);
        self.lock().insert(key_of(&obj), obj.clone());
        obj
    }

    /// Snapshot of every stored record
    pub fn all(&self) -> Vec<K> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, K>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stamp(&self, obj: &mut K) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
    }

    fn check_version(stored: &K, incoming: &K) -> Result<()> {
        match (stored.resource_version(), incoming.resource_version()) {
            (Some(a), Some(b)) if a == b => Ok(()),
            (current, given) => Err(Error::Conflict(format!(
                "{}: stored version {:?}, given {:?}",
                incoming.name_any(),
                current,
                given
            ))),
        }
    }

    /// Copy the `status` stanza of `from` onto `onto`
    fn with_status_of(onto: &K, from: &K) -> Result<K> {
        let mut target = serde_json::to_value(onto)?;
        let source = serde_json::to_value(from)?;
        if let Value::Object(map) = &mut target {
            match source.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        Ok(serde_json::from_value(target)?)
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn matches_selector<K: Resource>(obj: &K, terms: &[(String, String)]) -> bool {
    let labels = obj.labels();
    terms
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}

#[async_trait]
impl<K> JobStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>> {
        let terms = match selector {
            Some(s) => parse_selector(s)?,
            None => Vec::new(),
        };
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want.is_empty() || want == ns))
            .filter(|(_, obj)| matches_selector(*obj, &terms))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        if obj.meta().name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::config("record has no name"));
        }
        let key = key_of(obj);
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists(obj.name_any()));
        }

        let mut created: K = serde_json::from_value({
            let mut value = serde_json::to_value(obj)?;
            if let Value::Object(map) = &mut value {
                map.remove("status");
            }
            value
        })?;
        self.stamp(&mut created);
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = key_of(obj);
        let mut objects = self.lock();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(obj.name_any()))?;
        Self::check_version(stored, obj)?;

        let mut updated = Self::with_status_of(obj, stored)?;
        updated.meta_mut().creation_timestamp = stored.meta().creation_timestamp.clone();
        updated.meta_mut().uid = stored.meta().uid.clone();
        self.stamp(&mut updated);
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = key_of(obj);
        let mut objects = self.lock();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(obj.name_any()))?;
        Self::check_version(stored, obj)?;

        let mut updated = Self::with_status_of(stored, obj)?;
        self.stamp(&mut updated);
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}
