//! Shared informer: one reflector, one store and one processing loop per resource
//! type, fanned out to any number of handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;
use reflex_core::{ChangeEvent, Error, EventKind, Object, ObjectKey, ResourceType, Result, StopSignal, Version};
use reflex_store::{namespace_index_func, ChangeQueue, Indexer, Indexers, Pending, Popped, NAMESPACE_INDEX};
use smallvec::SmallVec;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::InformerConfig;
use crate::error::InformerError;
use crate::handler::{EventHandler, HandlerRegistration};
use crate::lister::Lister;
use crate::reflector::Reflector;
use crate::source::ListWatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InformerState {
    NotStarted,
    Syncing,
    Synced,
    Stopped,
}

impl InformerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InformerState::NotStarted => "not-started",
            InformerState::Syncing => "syncing",
            InformerState::Synced => "synced",
            InformerState::Stopped => "stopped",
        }
    }
}

type Handlers<T> = Vec<(u64, Arc<dyn EventHandler<T>>)>;

/// What one applied event means for handlers.
enum Notice<T> {
    Add(Arc<T>),
    Update(Arc<T>, Arc<T>),
    Delete(Arc<T>),
}

impl<T> Notice<T> {
    fn kind(&self) -> EventKind {
        match self {
            Notice::Add(_) => EventKind::Added,
            Notice::Update(..) => EventKind::Updated,
            Notice::Delete(_) => EventKind::Deleted,
        }
    }
}

enum Step<T> {
    Deliver(ObjectKey, SmallVec<[Notice<T>; 2]>),
    InitialSyncDone,
}

/// Aborts the reflector task and closes the queue if `run` is dropped early.
struct ReflectorTask<T: Object> {
    handle: JoinHandle<()>,
    queue: Arc<ChangeQueue<T>>,
}

impl<T: Object> Drop for ReflectorTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
        self.queue.close();
    }
}

pub struct SharedInformer<T: Object> {
    resource: ResourceType,
    gvk: String,
    source: Arc<dyn ListWatch<T>>,
    config: InformerConfig,
    store: Arc<Indexer<T>>,
    queue: Arc<ChangeQueue<T>>,
    handlers: RwLock<Handlers<T>>,
    next_handler: AtomicU64,
    started: AtomicBool,
    synced: AtomicBool,
    state: watch::Sender<InformerState>,
    stop: OnceLock<StopSignal>,
    last_synced: Arc<ArcSwap<Version>>,
    errors: broadcast::Sender<InformerError>,
}

impl<T: Object> SharedInformer<T> {
    pub fn new(resource: ResourceType, source: Arc<dyn ListWatch<T>>, config: InformerConfig) -> Self {
        let gvk = resource.key();
        let mut indexers: Indexers<T> = Indexers::default();
        indexers.insert(NAMESPACE_INDEX.to_string(), namespace_index_func());
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));
        let (state, _) = watch::channel(InformerState::NotStarted);
        Self {
            queue: Arc::new(ChangeQueue::new(gvk.clone())),
            store: Arc::new(Indexer::with_indexers(indexers)),
            resource,
            gvk,
            source,
            config,
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            started: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            state,
            stop: OnceLock::new(),
            last_synced: Arc::new(ArcSwap::from_pointee(Version::default())),
            errors,
        }
    }

    pub fn resource(&self) -> &ResourceType { &self.resource }

    pub fn state(&self) -> InformerState { *self.state.borrow() }

    /// True once the initial listing has been applied and delivered. Stays true.
    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }

    pub fn last_synced_version(&self) -> Version { self.last_synced.load_full().as_ref().clone() }

    pub fn indexer(&self) -> Arc<Indexer<T>> { Arc::clone(&self.store) }

    pub fn store(&self) -> Arc<Indexer<T>> { self.indexer() }

    pub fn lister(&self) -> Lister<T> { Lister::new(Arc::clone(&self.store)) }

    /// Subscribe to handler failures and source outages.
    pub fn errors(&self) -> broadcast::Receiver<InformerError> { self.errors.subscribe() }

    /// Extra indexes; only before the informer has started.
    pub fn add_indexers(&self, indexers: Indexers<T>) -> Result<()> {
        if self.started.load(Ordering::Acquire) { return Err(Error::AlreadyStarted); }
        self.store.add_indexers(indexers)
    }

    /// Register a handler. When the informer is already running the handler first
    /// receives `on_add` for every stored object, before any later event.
    ///
    /// Handlers must not register or remove handlers from inside a callback.
    pub fn add_event_handler(&self, handler: impl EventHandler<T> + 'static) -> Result<HandlerRegistration> {
        if self.is_stopping() { return Err(Error::Stopped); }
        let handler: Arc<dyn EventHandler<T>> = Arc::new(handler);
        let mut handlers = self.write_handlers();
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        if self.started.load(Ordering::Acquire) {
            let entries = self.store.entries();
            debug!(gvk = %self.gvk, handler = id, objects = entries.len(), "replaying store to late handler");
            for (key, obj) in entries {
                self.invoke(id, &handler, &key, &Notice::Add(obj));
            }
        }
        handlers.push((id, handler));
        Ok(HandlerRegistration { id })
    }

    /// False when the registration was already removed.
    pub fn remove_event_handler(&self, reg: HandlerRegistration) -> bool {
        let mut handlers = self.write_handlers();
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != reg.id);
        handlers.len() != before
    }

    /// Resolves true once synced, false if `stop` fires or the informer stops first.
    pub async fn wait_for_sync(&self, stop: &StopSignal) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            biased;
            _ = rx.wait_for(|s| matches!(s, InformerState::Synced | InformerState::Stopped)) => {}
            _ = stop.stopped() => {}
        }
        self.has_synced()
    }

    /// Run until `stop` fires. Queued events are drained before returning.
    pub async fn run(&self, stop: StopSignal) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) { return Err(Error::AlreadyStarted); }
        let _ = self.stop.set(stop.clone());
        self.state.send_replace(InformerState::Syncing);
        info!(gvk = %self.gvk, handlers = self.read_handlers().len(), "informer started");

        let reflector = Reflector::new(
            self.gvk.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&self.last_synced),
            self.errors.clone(),
        );
        let queue = Arc::clone(&self.queue);
        let handle = tokio::spawn(async move {
            reflector.run(stop).await;
            queue.close();
        });
        let _reflector = ReflectorTask { handle, queue: Arc::clone(&self.queue) };

        self.process().await;

        self.state.send_replace(InformerState::Stopped);
        info!(gvk = %self.gvk, objects = self.store.len(), synced = self.has_synced(), "informer stopped");
        Ok(())
    }

    async fn process(&self) {
        loop {
            // Apply under the queue lock and keep the handler list locked until the
            // notices are delivered, so late registrations see a consistent store.
            let next = self
                .queue
                .pop_with(|popped| {
                    let handlers = self.read_handlers();
                    let step = match popped {
                        Popped::InitialSyncDone => Step::InitialSyncDone,
                        Popped::Events { key, events } => {
                            let notices = self.apply(&key, events);
                            Step::Deliver(key, notices)
                        }
                    };
                    (step, handlers)
                })
                .await;
            let Some((step, handlers)) = next else { break };
            match step {
                Step::InitialSyncDone => self.mark_synced(),
                Step::Deliver(key, notices) => {
                    for notice in &notices {
                        metrics::counter!("reflex_events_total", 1u64, "gvk" => self.gvk.clone(), "kind" => notice.kind().as_str());
                        for (id, handler) in handlers.iter() {
                            self.invoke(*id, handler, &key, notice);
                        }
                    }
                }
            }
        }
    }

    /// Deleting a key the store does not hold produces no notice.
    fn apply(&self, key: &ObjectKey, events: Pending<T>) -> SmallVec<[Notice<T>; 2]> {
        events
            .into_iter()
            .filter_map(|ev| match ev {
                ChangeEvent::Added(obj) | ChangeEvent::Updated(obj) => Some(match self.store.put(key.clone(), Arc::clone(&obj)) {
                    Some(old) => Notice::Update(old, obj),
                    None => Notice::Add(obj),
                }),
                ChangeEvent::Sync(obj) => Some(match self.store.put(key.clone(), Arc::clone(&obj)) {
                    Some(_) => Notice::Update(Arc::clone(&obj), obj),
                    None => Notice::Add(obj),
                }),
                ChangeEvent::Deleted(_) => self.store.delete(key).map(Notice::Delete),
            })
            .collect()
    }

    fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::AcqRel) {
            self.state.send_replace(InformerState::Synced);
            info!(gvk = %self.gvk, objects = self.store.len(), version = %self.last_synced_version(), "cache synced");
        }
    }

    fn invoke(&self, id: u64, handler: &Arc<dyn EventHandler<T>>, key: &ObjectKey, notice: &Notice<T>) {
        let outcome = catch_unwind(AssertUnwindSafe(|| match notice {
            Notice::Add(obj) => handler.on_add(obj),
            Notice::Update(old, new) => handler.on_update(old, new),
            Notice::Delete(obj) => handler.on_delete(obj),
        }));
        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => match panic.downcast_ref::<&str>() {
                Some(s) => format!("panicked: {s}"),
                None => match panic.downcast_ref::<String>() {
                    Some(s) => format!("panicked: {s}"),
                    None => "panicked".to_string(),
                },
            },
        };
        warn!(gvk = %self.gvk, handler = id, kind = notice.kind().as_str(), key = %key, error = %message, "handler failed");
        metrics::counter!("reflex_handler_errors_total", 1u64, "gvk" => self.gvk.clone());
        let _ = self.errors.send(InformerError::HandlerFailed {
            resource: self.gvk.clone(),
            handler: id,
            kind: notice.kind(),
            key: key.clone(),
            message,
        });
    }

    fn is_stopping(&self) -> bool {
        self.state() == InformerState::Stopped || self.stop.get().is_some_and(|s| s.is_stopped())
    }

    fn read_handlers(&self) -> RwLockReadGuard<'_, Handlers<T>> { self.handlers.read().unwrap_or_else(PoisonError::into_inner) }

    fn write_handlers(&self) -> RwLockWriteGuard<'_, Handlers<T>> { self.handlers.write().unwrap_or_else(PoisonError::into_inner) }
}

/// Wait until every informer has synced. False if `stop` fires first or any of
/// them stopped without syncing.
pub async fn wait_for_cache_sync<T: Object>(informers: &[Arc<SharedInformer<T>>], stop: &StopSignal) -> bool {
    for inf in informers {
        if !inf.wait_for_sync(stop).await {
            debug!(gvk = %inf.resource(), "cache sync aborted");
            return false;
        }
    }
    true
}
