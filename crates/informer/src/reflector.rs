//! Reflector: keeps the change queue fed from a list+watch source.
//!
//! list → `ChangeQueue::replace` → watch from the listed token. A watch that ends
//! with `Expired` triggers a relist; other failures re-watch from the last token
//! after a jittered backoff. A separate timer enqueues `Sync` for every stored
//! object each resync period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::StreamExt;
use reflex_core::{ChangeEvent, Error, Object, Result, StopSignal, Version};
use reflex_store::{ChangeQueue, Indexer};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::InformerConfig;
use crate::error::InformerError;
use crate::source::{ListWatch, WatchEvent};

/// Why a single watch attempt ended.
#[derive(Debug)]
enum WatchEnd {
    Stopped,
    Expired(Error),
    Closed { received: usize },
    Failed { error: Error, received: usize },
}

pub struct Reflector<T> {
    resource: String,
    source: Arc<dyn ListWatch<T>>,
    queue: Arc<ChangeQueue<T>>,
    store: Arc<Indexer<T>>,
    config: InformerConfig,
    last_synced: Arc<ArcSwap<Version>>,
    errors: broadcast::Sender<InformerError>,
}

impl<T: Object> Reflector<T> {
    pub fn new(
        resource: impl Into<String>,
        source: Arc<dyn ListWatch<T>>,
        queue: Arc<ChangeQueue<T>>,
        store: Arc<Indexer<T>>,
        config: InformerConfig,
        last_synced: Arc<ArcSwap<Version>>,
        errors: broadcast::Sender<InformerError>,
    ) -> Self {
        Self { resource: resource.into(), source, queue, store, config, last_synced, errors }
    }

    pub fn last_synced_version(&self) -> Version { self.last_synced.load_full().as_ref().clone() }

    /// Run until `stop` fires or the queue is closed.
    pub async fn run(&self, stop: StopSignal) {
        info!(gvk = %self.resource, "reflector started");
        tokio::join!(self.list_and_watch(&stop), self.resync_loop(&stop));
        info!(gvk = %self.resource, version = %self.last_synced_version(), "reflector stopped");
    }

    async fn list_and_watch(&self, stop: &StopSignal) {
        let mut backoff = Backoff::new(&self.config.backoff);
        let mut failures = 0u32;
        'relist: loop {
            let listed = tokio::select! {
                biased;
                _ = stop.stopped() => return,
                r = self.list_and_replace() => r,
            };
            let mut version = match listed {
                Ok(v) => {
                    backoff.reset();
                    failures = 0;
                    v
                }
                Err(Error::QueueClosed) => return,
                Err(e) => {
                    self.record_failure(&mut failures, &backoff, "list", e);
                    if !sleep_or_stop(backoff.next_delay(), stop).await { return; }
                    continue 'relist;
                }
            };

            loop {
                match self.watch_once(&mut version, stop).await {
                    WatchEnd::Stopped => return,
                    WatchEnd::Expired(e) => {
                        info!(gvk = %self.resource, version = %version, reason = %e, "watch token expired; relisting");
                        metrics::counter!("reflex_relists_total", 1u64, "gvk" => self.resource.clone());
                        continue 'relist;
                    }
                    WatchEnd::Closed { received } if received > 0 => {
                        debug!(gvk = %self.resource, received, "watch closed; resuming");
                        backoff.reset();
                        failures = 0;
                    }
                    WatchEnd::Closed { .. } => {
                        // Closed without delivering anything: do not spin.
                        debug!(gvk = %self.resource, "watch closed empty; backing off");
                        if !sleep_or_stop(backoff.next_delay(), stop).await { return; }
                    }
                    WatchEnd::Failed { error, received } => {
                        if received > 0 {
                            // The watch was healthy before it broke.
                            backoff.reset();
                            failures = 0;
                        }
                        self.record_failure(&mut failures, &backoff, "watch", error);
                        if !sleep_or_stop(backoff.next_delay(), stop).await { return; }
                    }
                }
                metrics::counter!("reflex_watch_restarts_total", 1u64, "gvk" => self.resource.clone());
            }
        }
    }

    async fn list_and_replace(&self) -> Result<Version> {
        let t0 = Instant::now();
        let (items, version) = self.source.list().await?;
        metrics::histogram!("reflex_list_ms", t0.elapsed().as_secs_f64() * 1000.0, "gvk" => self.resource.clone());
        let count = items.len();
        let items: Vec<Arc<T>> = items.into_iter().filter(|o| self.keyable(o)).map(Arc::new).collect();
        let summary = self.queue.replace(items, &self.store)?;
        self.advance(&version);
        info!(
            gvk = %self.resource,
            items = count,
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            version = %version,
            took_ms = %t0.elapsed().as_millis(),
            "listed"
        );
        Ok(version)
    }

    async fn watch_once(&self, version: &mut Version, stop: &StopSignal) -> WatchEnd {
        let opened = tokio::select! {
            biased;
            _ = stop.stopped() => return WatchEnd::Stopped,
            r = self.source.watch(version, stop.clone()) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_expired() => return WatchEnd::Expired(e),
            Err(error) => return WatchEnd::Failed { error, received: 0 },
        };
        debug!(gvk = %self.resource, version = %version, "watch opened");
        let mut received = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.stopped() => return WatchEnd::Stopped,
                n = stream.next() => n,
            };
            let ev = match next {
                None => return WatchEnd::Closed { received },
                Some(Ok(ev)) => ev,
                Some(Err(Error::Decode(msg))) => {
                    warn!(gvk = %self.resource, error = %msg, "dropping undecodable watch event");
                    metrics::counter!("reflex_decode_errors_total", 1u64, "gvk" => self.resource.clone());
                    continue;
                }
                Some(Err(e)) if e.is_expired() => return WatchEnd::Expired(e),
                Some(Err(error)) => return WatchEnd::Failed { error, received },
            };
            received += 1;
            let (change, token) = match ev {
                WatchEvent::Added(o) => (Some(ChangeEvent::Added(Arc::new(o))), None),
                WatchEvent::Modified(o) => (Some(ChangeEvent::Updated(Arc::new(o))), None),
                WatchEvent::Deleted(o) => (Some(ChangeEvent::Deleted(Arc::new(o))), None),
                WatchEvent::Bookmark(v) => (None, Some(v)),
            };
            let token = match change {
                Some(change) => {
                    if !self.keyable(change.object()) { continue; }
                    let token = Version::from(change.object().version());
                    if self.queue.push(change).is_err() { return WatchEnd::Stopped; }
                    token
                }
                None => token.unwrap_or_default(),
            };
            if token > *version {
                *version = token.clone();
                self.advance(&token);
            }
        }
    }

    async fn resync_loop(&self, stop: &StopSignal) {
        let period = self.config.resync_period;
        if period.is_zero() { return; }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => return,
                _ = ticker.tick() => {}
            }
            match self.queue.resync(&self.store) {
                Ok(n) => debug!(gvk = %self.resource, queued = n, "resync"),
                Err(_) => return,
            }
        }
    }

    fn keyable(&self, o: &T) -> bool {
        if o.name().is_empty() {
            warn!(gvk = %self.resource, "dropping object without a name");
            return false;
        }
        true
    }

    /// Record `v` as the last synced token unless it would move backward.
    fn advance(&self, v: &Version) {
        let cur = self.last_synced.load();
        if *v > **cur {
            self.last_synced.store(Arc::new(v.clone()));
        } else if *v < **cur {
            debug!(gvk = %self.resource, current = %cur.as_str(), incoming = %v, "ignoring older version token");
        }
    }

    fn record_failure(&self, failures: &mut u32, backoff: &Backoff, phase: &str, e: Error) {
        *failures = failures.saturating_add(1);
        metrics::counter!("reflex_source_errors_total", 1u64, "gvk" => self.resource.clone(), "phase" => phase.to_string());
        warn!(gvk = %self.resource, phase, failures = *failures, attempt = backoff.attempts() + 1, error = %e, "source call failed; backing off");
        let threshold = self.config.failure_report_threshold.max(1);
        if *failures % threshold == 0 {
            error!(gvk = %self.resource, failures = *failures, error = %e, "source unavailable; still retrying");
            let _ = self.errors.send(InformerError::SourceUnavailable { resource: self.resource.clone(), failures: *failures, last_error: e });
        }
    }
}

/// Sleep for `d`; false when stopped first.
async fn sleep_or_stop(d: Duration, stop: &StopSignal) -> bool {
    tokio::select! {
        biased;
        _ = stop.stopped() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
