//! Per-key coalescing change queue between the reflector and the informer loop.
//!
//! Keys are served FIFO by first arrival; a key that is already pending keeps its
//! place and merges the new event into its pending list (see [`merge`]). At most
//! two events are ever pending for one key.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reflex_core::{ChangeEvent, Error, EventKind, Object, ObjectKey, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tokio::sync::Notify;
use tracing::debug;

use crate::indexer::Indexer;

pub type Pending<T> = SmallVec<[ChangeEvent<Arc<T>>; 2]>;

/// What the consumer receives from [`ChangeQueue::pop`].
#[derive(Debug)]
pub enum Popped<T> {
    /// All pending events of one key, oldest first.
    Events { key: ObjectKey, events: Pending<T> },
    /// Everything enqueued by the first `replace` has been handed out.
    InitialSyncDone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReplaceSummary {
    pub fn is_empty(&self) -> bool { self.added + self.updated + self.deleted == 0 }
}

enum Slot {
    Key(ObjectKey),
    InitialSync,
}

struct State<T> {
    items: FxHashMap<ObjectKey, Pending<T>>,
    order: VecDeque<Slot>,
    closed: bool,
    populated: bool,
}

/// Fold `incoming` into the pending list of one key.
///
/// Collapse rules, keyed by the newest pending event:
/// - `Added` + `Added`/`Updated` keeps `Added` with the newer payload.
/// - `Added` + `Deleted` becomes `Deleted`; the key may already be stored. After a
///   pending `Deleted` the recreate is dropped instead, leaving the first delete.
/// - `Updated`/`Sync` + `Deleted` becomes `Deleted`.
/// - `Sync` is dropped when real data is pending, and replaced by anything newer.
/// - `Deleted` + `Added`/`Updated` is kept as two events so the recreate is visible.
fn merge<T>(pending: &mut Pending<T>, incoming: ChangeEvent<Arc<T>>) {
    let Some(last) = pending.last().map(|e| e.kind()) else {
        pending.push(incoming);
        return;
    };
    let tail = pending.len() - 1;
    match (last, incoming) {
        (EventKind::Added, ChangeEvent::Added(o) | ChangeEvent::Updated(o)) => pending[tail] = ChangeEvent::Added(o),
        (EventKind::Added, ChangeEvent::Deleted(o)) => {
            if tail > 0 {
                pending.pop();
            } else {
                pending[tail] = ChangeEvent::Deleted(o);
            }
        }
        (EventKind::Added | EventKind::Updated | EventKind::Deleted, ChangeEvent::Sync(_)) => {}
        (EventKind::Updated, ChangeEvent::Added(o) | ChangeEvent::Updated(o)) => pending[tail] = ChangeEvent::Updated(o),
        (EventKind::Updated | EventKind::Sync | EventKind::Deleted, ChangeEvent::Deleted(o)) => pending[tail] = ChangeEvent::Deleted(o),
        (EventKind::Sync, other) => pending[tail] = other,
        (EventKind::Deleted, other @ (ChangeEvent::Added(_) | ChangeEvent::Updated(_))) => pending.push(other),
    }
}

impl<T> State<T> {
    fn push(&mut self, key: ObjectKey, ev: ChangeEvent<Arc<T>>) {
        match self.items.get_mut(&key) {
            Some(pending) => {
                merge(pending, ev);
            }
            None => {
                let mut pending = Pending::new();
                pending.push(ev);
                self.items.insert(key.clone(), pending);
                self.order.push_back(Slot::Key(key));
            }
        }
    }

    fn next(&mut self) -> Option<Popped<T>> {
        while let Some(slot) = self.order.pop_front() {
            match slot {
                Slot::InitialSync => return Some(Popped::InitialSyncDone),
                Slot::Key(key) => {
                    if let Some(events) = self.items.remove(&key) {
                        return Some(Popped::Events { key, events });
                    }
                }
            }
        }
        None
    }

    /// Latest object for `key` as the consumer will see it once the queue drains.
    fn current(&self, key: &ObjectKey, store: &Indexer<T>) -> Option<Arc<T>>
    where
        T: Object,
    {
        match self.items.get(key).and_then(|p| p.last()) {
            Some(ChangeEvent::Deleted(_)) => None,
            Some(ev) => Some(Arc::clone(ev.object())),
            None => store.get(key),
        }
    }
}

pub struct ChangeQueue<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T: Object> ChangeQueue<T> {
    /// `name` labels metrics (usually the resource type key).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                closed: false,
                populated: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn report_depth(&self, st: &State<T>) {
        metrics::gauge!("reflex_queue_depth", st.items.len() as f64, "queue" => self.name.clone());
    }

    pub fn push(&self, ev: ChangeEvent<Arc<T>>) -> Result<()> {
        let key = ObjectKey::of(ev.object().as_ref());
        let mut st = self.lock();
        if st.closed { return Err(Error::QueueClosed); }
        st.push(key, ev);
        self.report_depth(&st);
        drop(st);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next item and hand it to `process` while the queue lock is
    /// held, so `replace`/`resync` never observe an item that is neither queued
    /// nor applied. Returns `None` once closed and drained.
    pub async fn pop_with<R>(&self, mut process: impl FnMut(Popped<T>) -> R) -> Option<R> {
        loop {
            {
                let mut st = self.lock();
                if let Some(item) = st.next() {
                    self.report_depth(&st);
                    return Some(process(item));
                }
                if st.closed { return None; }
            }
            self.notify.notified().await;
        }
    }

    pub async fn pop(&self) -> Option<Popped<T>> { self.pop_with(|p| p).await }

    /// Reconcile against an authoritative listing: keys missing from the combined
    /// store+queue view get `Added`, keys whose version changed get `Updated`, and
    /// keys absent from `list` get `Deleted` with their last known object.
    ///
    /// The first call also enqueues the initial-sync barrier.
    pub fn replace(&self, list: Vec<Arc<T>>, store: &Indexer<T>) -> Result<ReplaceSummary> {
        let mut st = self.lock();
        if st.closed { return Err(Error::QueueClosed); }
        let mut summary = ReplaceSummary::default();
        let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
        for obj in list {
            let key = ObjectKey::of(obj.as_ref());
            if !listed.insert(key.clone()) {
                debug!(queue = %self.name, key = %key, "duplicate key in listing; keeping first");
                continue;
            }
            match st.current(&key, store) {
                None => {
                    st.push(key, ChangeEvent::Added(obj));
                    summary.added += 1;
                }
                Some(cur) if cur.version().is_empty() || cur.version() != obj.version() => {
                    st.push(key, ChangeEvent::Updated(obj));
                    summary.updated += 1;
                }
                Some(_) => {}
            }
        }
        let mut known: FxHashSet<ObjectKey> = store.list_keys().into_iter().collect();
        known.extend(st.items.keys().cloned());
        for key in known.into_iter().filter(|k| !listed.contains(k)) {
            if let Some(cur) = st.current(&key, store) {
                st.push(key, ChangeEvent::Deleted(cur));
                summary.deleted += 1;
            }
        }
        if !st.populated {
            st.populated = true;
            st.order.push_back(Slot::InitialSync);
        }
        self.report_depth(&st);
        drop(st);
        self.notify.notify_one();
        Ok(summary)
    }

    /// Enqueue `Sync` for every stored object without pending events.
    pub fn resync(&self, store: &Indexer<T>) -> Result<usize> {
        let mut st = self.lock();
        if st.closed { return Err(Error::QueueClosed); }
        let mut n = 0usize;
        for (key, obj) in store.entries() {
            if st.items.contains_key(&key) { continue; }
            st.push(key, ChangeEvent::Sync(obj));
            n += 1;
        }
        self.report_depth(&st);
        drop(st);
        if n > 0 { self.notify.notify_one(); }
        Ok(n)
    }

    /// Stop accepting new events; already queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Number of keys with pending events.
    pub fn len(&self) -> usize { self.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.lock().items.is_empty() }

    pub fn name(&self) -> &str { &self.name }
}
