//! Kubernetes event recording for job records

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter},
    Client, Resource, ResourceExt,
};
use tracing::warn;

use crate::error::Result;

/// Reason of a handled create/modify/destroy notification
pub const REASON_SYNCED: &str = "Synced";
/// Reason of a successful transfer
pub const REASON_CREATED: &str = "Created";
/// Reason of a failed transfer
pub const REASON_FAILED: &str = "Failed";

pub const MESSAGE_CREATE_SYNCED: &str = "Received Resource create event";
pub const MESSAGE_MODIFY_SYNCED: &str = "Received Resource modify event";
pub const MESSAGE_DESTROY_SYNCED: &str = "Received Resource destroy event";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl From<EventType> for KubeEventType {
    fn from(type_: EventType) -> Self {
        match type_ {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        }
    }
}

/// One event about a job record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobEventNote {
    pub type_: EventType,
    pub reason: &'static str,
    pub message: String,
}

impl JobEventNote {
    pub fn normal(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            message: message.into(),
        }
    }

    pub fn warning(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            message: message.into(),
        }
    }
}

/// Publishes events against a record
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, component: &str, target: ObjectReference, note: JobEventNote) -> Result<()>;
}

/// Record an event; failures are logged and never returned
pub async fn publish<K>(recorder: &dyn EventRecorder, component: &str, obj: &K, note: JobEventNote)
where
    K: Resource<DynamicType = ()>,
{
    let reason = note.reason;
    if let Err(e) = recorder.record(component, obj.object_ref(&()), note).await {
        warn!(name = %obj.name_any(), reason, error = %e, "Failed to record event");
    }
}

/// [`EventRecorder`] backed by the kube-runtime event recorder
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    instance: Option<String>,
}

impl KubeEventRecorder {
    /// `instance` identifies this process, usually the pool it acts for
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, instance }
    }

    fn reporter(&self, component: &str) -> Reporter {
        Reporter {
            controller: format!("{}-controller", component.to_lowercase()),
            instance: self.instance.clone(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, component: &str, target: ObjectReference, note: JobEventNote) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter(component), target);
        recorder
            .publish(Event {
                type_: note.type_.into(),
                reason: note.reason.to_string(),
                note: Some(note.message),
                action: "Reconciling".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
