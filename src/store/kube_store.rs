//! [`JobStore`] backed by the Kubernetes API server

use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use super::JobStore;
use crate::error::{Error, Result};

/// Field manager recorded on status patches
const FIELD_MANAGER: &str = "cstor-backup-operator";

/// Store for one namespaced resource kind
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace()
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::config(format!("{} has no namespace", obj.name_any())))
}

fn map_write_error(err: kube::Error, name: &str, on_conflict: fn(String) -> Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(name.to_string()),
        kube::Error::Api(resp) if resp.code == 409 => on_conflict(format!("{}: {}", name, resp.message)),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl<K> JobStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced(self.client.clone(), ns),
            _ => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &obj.name_any(), Error::AlreadyExists))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &name, Error::Conflict))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion in a merge patch acts as a precondition
        let value = serde_json::to_value(obj)?;
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });

        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(e, &name, Error::Conflict))
    }
}
