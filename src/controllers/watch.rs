//! Event source adapter
//!
//! Turns a `kube::runtime` watcher stream into typed [`JobEvent`]s. A local
//! cache keyed by `namespace/name` supplies the old object of updates and the
//! deletions missed across a re-list. The first listing seeds the cache;
//! records that existed before start are handled by the startup cleanup pass,
//! except `Pending` ones, which may have been scheduled after cleanup listed
//! its records and are replayed as adds.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api,
};
use serde::de::DeserializeOwned;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::JobRecord;
use crate::store::object_key;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// A typed notification about one record
#[derive(Clone, Debug)]
pub enum JobEvent<K> {
    Add(K),
    Update { old: K, new: K },
    Delete(K),
}

impl<K> JobEvent<K> {
    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::Add(_) => EventKind::Add,
            JobEvent::Update { .. } => EventKind::Update,
            JobEvent::Delete(_) => EventKind::Delete,
        }
    }

    /// The current object (the new one for updates)
    pub fn object(&self) -> &K {
        match self {
            JobEvent::Add(obj) | JobEvent::Delete(obj) => obj,
            JobEvent::Update { new, .. } => new,
        }
    }
}

#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    async fn handle(&self, event: JobEvent<K>);
}

/// Compute the events a completed re-list implies against the cache
pub fn diff_relist<K: Clone>(cache: &HashMap<String, K>, listed: &HashMap<String, K>) -> Vec<JobEvent<K>> {
    let mut events: Vec<JobEvent<K>> = listed
        .iter()
        .map(|(key, obj)| match cache.get(key) {
            Some(old) => JobEvent::Update {
                old: old.clone(),
                new: obj.clone(),
            },
            None => JobEvent::Add(obj.clone()),
        })
        .collect();
    events.extend(
        cache
            .iter()
            .filter(|(key, _)| !listed.contains_key(*key))
            .map(|(_, obj)| JobEvent::Delete(obj.clone())),
    );
    events
}

/// Adds for the records of the first listing that still wait to be started
pub fn initial_events<K: JobRecord>(listed: &HashMap<String, K>) -> Vec<JobEvent<K>> {
    listed
        .values()
        .filter(|obj| obj.is_pending())
        .map(|obj| JobEvent::Add(obj.clone()))
        .collect()
}

/// Watch records until `shutdown` fires, delivering events to `handler`.
///
/// Every `resync` the whole cache is re-delivered as updates with identical
/// old and new objects.
pub async fn watch_records<K, H>(
    api: Api<K>,
    config: watcher::Config,
    handler: &H,
    resync: Duration,
    shutdown: CancellationToken,
) where
    K: JobRecord + DeserializeOwned,
    H: EventHandler<K> + ?Sized,
{
    let mut cache: HashMap<String, K> = HashMap::new();
    let mut listing: Option<HashMap<String, K>> = None;
    let mut seeded = false;

    let mut stream = watcher(api, config).default_backoff().boxed();
    let mut ticker = interval(resync);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Stopping event source");
                break;
            }
            _ = ticker.tick() => {
                debug!(records = cache.len(), "Resyncing cached records");
                for obj in cache.values() {
                    handler.handle(JobEvent::Update { old: obj.clone(), new: obj.clone() }).await;
                }
            }
            next = stream.next() => {
                let event = match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!(error = %e, "Watch stream error");
                        continue;
                    }
                    None => break,
                };

                match event {
                    watcher::Event::Init => listing = Some(HashMap::new()),
                    watcher::Event::InitApply(obj) => {
                        listing.get_or_insert_with(HashMap::new).insert(object_key(&obj), obj);
                    }
                    watcher::Event::InitDone => {
                        let listed = listing.take().unwrap_or_default();
                        if seeded {
                            for event in diff_relist(&cache, &listed) {
                                handler.handle(event).await;
                            }
                        } else {
                            let pending = initial_events(&listed);
                            info!(records = listed.len(), pending = pending.len(), "Initial listing cached");
                            for event in pending {
                                handler.handle(event).await;
                            }
                            seeded = true;
                        }
                        cache = listed;
                    }
                    watcher::Event::Apply(obj) => {
                        let key = object_key(&obj);
                        let event = match cache.insert(key, obj.clone()) {
                            Some(old) => JobEvent::Update { old, new: obj },
                            None => JobEvent::Add(obj),
                        };
                        handler.handle(event).await;
                    }
                    watcher::Event::Delete(obj) => {
                        cache.remove(&object_key(&obj));
                        handler.handle(JobEvent::Delete(obj)).await;
                    }
                }
            }
        }
    }
}
