//! Resource store seam
//!
//! Job records, ledger records and replicas are read and written through
//! [`JobStore`]. [`KubeStore`] talks to the API server; [`MemoryStore`] keeps
//! records in process with the same versioning rules.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use crate::error::{Error, Result};

/// Versioned record store for one resource kind
#[async_trait]
pub trait JobStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch a record; `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List records, optionally scoped to a namespace and an equality label selector
    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>>;

    /// Create a record; fails with [`Error::AlreadyExists`] on a name clash
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; fails with [`Error::Conflict`] on a stale version
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status stanza; fails with [`Error::Conflict`] on a stale version
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Fetch a record that is expected to exist
    async fn fetch(&self, namespace: &str, name: &str) -> Result<K> {
        self.get(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found(format!("{}/{}", namespace, name)))
    }
}

/// Queue key of a record: `namespace/name`, or `name` for cluster-scoped records
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Split a queue key back into namespace and name
pub fn split_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((String::new(), name.to_string())),
        [ns, name] if !name.is_empty() => Ok((ns.to_string(), name.to_string())),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Parse an equality selector (`a=b,c==d`) into key/value pairs
pub fn parse_selector(selector: &str) -> Result<Vec<(String, String)>> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            let (k, v) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .ok_or_else(|| Error::config(format!("Unsupported label selector '{}'", term)))?;
            Ok((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_namespaced_and_plain_keys() {
        assert_eq!(
            split_key("openebs/snap1-pvc1").unwrap(),
            ("openebs".to_string(), "snap1-pvc1".to_string())
        );
        assert_eq!(split_key("snap1").unwrap(), (String::new(), "snap1".to_string()));
    }

    #[test]
    fn rejects_malformed_keys() {
        for key in ["", "a/b/c", "ns/"] {
            assert!(matches!(split_key(key), Err(Error::InvalidKey(_))), "{key}");
        }
    }

    #[test]
    fn parses_equality_selectors() {
        let terms = parse_selector("a=b, c==d").unwrap();
        assert_eq!(
            terms,
            vec![("a".to_string(), "b".to_string()), ("c".to_string(), "d".to_string())]
        );
        assert!(parse_selector("a!b").is_err());
    }
}
