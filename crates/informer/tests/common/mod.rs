#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{stream, StreamExt};
use reflex_core::{Error, RawObject, ResourceType, Result, StopSignal, Version};
use reflex_informer::{EventHandler, HandlerResult, InformerConfig, ListOptions, ListWatch, SourceProvider, WatchEvent, WatchStream};

pub type Event = Result<WatchEvent<RawObject>>;

pub fn obj(ns: Option<&str>, name: &str, rv: &str) -> RawObject {
    obj_labeled(ns, name, rv, &[])
}

pub fn obj_labeled(ns: Option<&str>, name: &str, rv: &str, labels: &[(&str, &str)]) -> RawObject {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if let Some(ns) = ns { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    if !labels.is_empty() {
        let map: serde_json::Map<String, serde_json::Value> =
            labels.iter().map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string()))).collect();
        meta["labels"] = serde_json::Value::Object(map);
    }
    RawObject::from_value(serde_json::json!({ "metadata": meta })).unwrap()
}

pub fn widget() -> ResourceType { ResourceType::new("example.dev", "v1", "Widget") }

/// Short backoff and no periodic resync unless a test asks for it.
pub fn fast_config() -> InformerConfig {
    InformerConfig::default().with_resync(Duration::ZERO).with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

/// What one `watch` call yields.
pub enum Watch {
    /// Fixed events, then either hang until stopped or close.
    Events(Vec<Event>, Then),
    /// Events fed by the test; closes when the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Event>),
    /// `watch` itself fails.
    Fail(Error),
}

pub enum Then {
    Hang,
    Close,
}

/// Scripted list+watch source. Once the list script runs out the last
/// successful listing repeats; once the watch script runs out watches hang.
#[derive(Default)]
pub struct FakeSource {
    lists: Mutex<VecDeque<Result<(Vec<RawObject>, Version)>>>,
    last_list: Mutex<Option<(Vec<RawObject>, Version)>>,
    watches: Mutex<VecDeque<Watch>>,
    list_calls: AtomicUsize,
    watch_versions: Mutex<Vec<Version>>,
}

impl FakeSource {
    pub fn new() -> Self { Self::default() }

    pub fn list(self, items: Vec<RawObject>, version: &str) -> Self {
        self.lists.lock().unwrap().push_back(Ok((items, Version::from(version))));
        self
    }

    pub fn list_err(self, e: Error) -> Self {
        self.lists.lock().unwrap().push_back(Err(e));
        self
    }

    pub fn watch(self, w: Watch) -> Self {
        self.watches.lock().unwrap().push_back(w);
        self
    }

    /// Adds a channel-driven watch and returns its sender.
    pub fn channel(&self) -> mpsc::UnboundedSender<Event> {
        let (tx, rx) = mpsc::unbounded();
        self.watches.lock().unwrap().push_back(Watch::Channel(rx));
        tx
    }

    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }

    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().iter().map(|v| v.as_str().to_string()).collect()
    }
}

#[async_trait]
impl ListWatch<RawObject> for FakeSource {
    async fn list(&self) -> Result<(Vec<RawObject>, Version)> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(Ok(listing)) => {
                *self.last_list.lock().unwrap() = Some(listing.clone());
                Ok(listing)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last_list.lock().unwrap().clone().unwrap_or_default()),
        }
    }

    async fn watch(&self, version: &Version, stop: StopSignal) -> Result<WatchStream<RawObject>> {
        self.watch_versions.lock().unwrap().push(version.clone());
        let next = self.watches.lock().unwrap().pop_front();
        let until = stop.into_stopped();
        match next {
            Some(Watch::Events(events, Then::Close)) => Ok(stream::iter(events).take_until(until).boxed()),
            Some(Watch::Events(events, Then::Hang)) => Ok(stream::iter(events).chain(stream::pending()).take_until(until).boxed()),
            Some(Watch::Channel(rx)) => Ok(rx.take_until(until).boxed()),
            Some(Watch::Fail(e)) => Err(e),
            None => Ok(stream::pending().take_until(until).boxed()),
        }
    }
}

/// Hands out one shared source per resource type and counts lookups.
#[derive(Default)]
pub struct FakeProvider {
    sources: Mutex<Vec<(ResourceType, Arc<FakeSource>)>>,
    pub requests: AtomicUsize,
}

impl FakeProvider {
    pub fn with(self, rt: ResourceType, source: FakeSource) -> Self {
        self.sources.lock().unwrap().push((rt, Arc::new(source)));
        self
    }

    pub fn source(&self, rt: &ResourceType) -> Arc<FakeSource> {
        let sources = self.sources.lock().unwrap();
        sources.iter().find(|(r, _)| r == rt).map(|(_, s)| s.clone()).unwrap()
    }
}

impl SourceProvider<RawObject> for FakeProvider {
    fn source_for(&self, resource: &ResourceType, _opts: &ListOptions) -> Arc<dyn ListWatch<RawObject>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.source(resource)
    }
}

/// Records callbacks as `+key@rv`, `~key@old->new`, `-key@rv`.
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

fn tag(o: &RawObject) -> String {
    match &o.namespace {
        Some(ns) => format!("{}/{}@{}", ns, o.name, o.resource_version),
        None => format!("{}@{}", o.name, o.resource_version),
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<String> { self.log.lock().unwrap().clone() }

    pub fn len(&self) -> usize { self.log.lock().unwrap().len() }

    pub async fn wait_len(&self, n: usize) -> Vec<String> {
        eventually(|| self.len() >= n).await;
        self.events()
    }
}

impl EventHandler<RawObject> for Recorder {
    fn on_add(&self, obj: &Arc<RawObject>) -> HandlerResult {
        self.log.lock().unwrap().push(format!("+{}", tag(obj)));
        Ok(())
    }

    fn on_update(&self, old: &Arc<RawObject>, new: &Arc<RawObject>) -> HandlerResult {
        let key = tag(new);
        let (key, _) = key.split_once('@').unwrap();
        self.log.lock().unwrap().push(format!("~{}@{}->{}", key, old.resource_version, new.resource_version));
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<RawObject>) -> HandlerResult {
        self.log.lock().unwrap().push(format!("-{}", tag(obj)));
        Ok(())
    }
}

/// Poll `cond` every few milliseconds; panics after two seconds.
pub async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
