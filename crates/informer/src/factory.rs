//! One shared informer per resource type, created on first request.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reflex_core::{Object, ResourceType, Result, StopSignal};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FactoryConfig;
use crate::informer::SharedInformer;
use crate::lister::Lister;
use crate::source::SourceProvider;

pub struct InformerFactory<T: Object> {
    provider: Arc<dyn SourceProvider<T>>,
    config: FactoryConfig,
    informers: Mutex<FxHashMap<ResourceType, Arc<SharedInformer<T>>>>,
    running: Mutex<FxHashMap<ResourceType, JoinHandle<Result<()>>>>,
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> { m.lock().unwrap_or_else(PoisonError::into_inner) }

impl<T: Object> InformerFactory<T> {
    pub fn new(provider: Arc<dyn SourceProvider<T>>, config: FactoryConfig) -> Self {
        Self { provider, config, informers: Mutex::new(FxHashMap::default()), running: Mutex::new(FxHashMap::default()) }
    }

    pub fn config(&self) -> &FactoryConfig { &self.config }

    /// The shared informer for `resource`, created (not started) on first use.
    pub fn informer_for(&self, resource: &ResourceType) -> Arc<SharedInformer<T>> {
        let mut informers = lock(&self.informers);
        if let Some(inf) = informers.get(resource) {
            return Arc::clone(inf);
        }
        let source = self.provider.source_for(resource, &self.config.list_options);
        let inf = Arc::new(SharedInformer::new(resource.clone(), source, self.config.informer_config(resource)));
        debug!(gvk = %resource, "informer created");
        informers.insert(resource.clone(), Arc::clone(&inf));
        inf
    }

    pub fn lister_for(&self, resource: &ResourceType) -> Lister<T> { self.informer_for(resource).lister() }

    pub fn resources(&self) -> Vec<ResourceType> {
        let mut out: Vec<ResourceType> = lock(&self.informers).keys().cloned().collect();
        out.sort();
        out
    }

    /// Spawn every informer not yet running. Returns how many were started.
    pub fn start(&self, stop: &StopSignal) -> usize {
        let informers: Vec<(ResourceType, Arc<SharedInformer<T>>)> =
            lock(&self.informers).iter().map(|(rt, inf)| (rt.clone(), Arc::clone(inf))).collect();
        let mut running = lock(&self.running);
        let mut started = 0usize;
        for (rt, inf) in informers {
            if running.contains_key(&rt) { continue; }
            let stop = stop.clone();
            running.insert(rt, tokio::spawn(async move { inf.run(stop).await }));
            started += 1;
        }
        if started > 0 {
            info!(started, total = running.len(), "informers started");
        }
        started
    }

    /// Start everything and wait until all started informers have stopped.
    pub async fn start_all(&self, stop: StopSignal) {
        self.start(&stop);
        self.shutdown().await;
    }

    /// Sync status per resource type; waits for each informer created so far.
    pub async fn wait_for_cache_sync(&self, stop: &StopSignal) -> BTreeMap<ResourceType, bool> {
        let informers: Vec<(ResourceType, Arc<SharedInformer<T>>)> =
            lock(&self.informers).iter().map(|(rt, inf)| (rt.clone(), Arc::clone(inf))).collect();
        let mut out = BTreeMap::new();
        for (rt, inf) in informers {
            let synced = inf.wait_for_sync(stop).await;
            out.insert(rt, synced);
        }
        out
    }

    /// Await every started informer. Informers only return after their stop
    /// signal fired, so fire it first.
    pub async fn shutdown(&self) {
        let handles: Vec<(ResourceType, JoinHandle<Result<()>>)> = lock(&self.running).drain().collect();
        for (rt, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(gvk = %rt, error = %e, "informer exited with error"),
                Err(e) => warn!(gvk = %rt, error = %e, "informer task failed"),
            }
        }
    }
}
