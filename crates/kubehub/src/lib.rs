//! Reflex kubehub: discovery and the Kubernetes list+watch source adapter.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use reflex_core::{Error, RawObject, ResourceType, Result, StopSignal, Version};
use reflex_informer::{ListOptions, ListWatch, SourceProvider, WatchEvent, WatchStream};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Server-side watch timeout; the reflector re-watches when it elapses.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn resource_type(&self) -> ResourceType { ResourceType::new(self.group.clone(), self.version.clone(), self.kind.clone()) }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> anyhow::Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

async fn find_api_resource(client: Client, rt: &ResourceType) -> anyhow::Result<(ApiResource, bool)> {
    let gvk = GroupVersionKind::gvk(&rt.group, &rt.version, &rt.kind);
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("resource type not served: {}", rt))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_raw(obj: &DynamicObject) -> Result<RawObject> {
    let mut raw = serde_json::to_value(obj).map_err(|e| Error::Decode(format!("serializing object: {e}")))?;
    strip_managed_fields(&mut raw);
    RawObject::from_value(raw)
}

fn map_kube_err(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 410 => Error::Expired(ae.message),
        kube::Error::SerdeError(e) => Error::Decode(e.to_string()),
        other => Error::Transport(other.to_string()),
    }
}

fn map_watch_event(ev: KubeWatchEvent<DynamicObject>) -> Result<WatchEvent<RawObject>> {
    match ev {
        KubeWatchEvent::Added(o) => to_raw(&o).map(WatchEvent::Added),
        KubeWatchEvent::Modified(o) => to_raw(&o).map(WatchEvent::Modified),
        KubeWatchEvent::Deleted(o) => to_raw(&o).map(WatchEvent::Deleted),
        KubeWatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(Version::new(b.metadata.resource_version))),
        KubeWatchEvent::Error(ae) if ae.code == 410 => Err(Error::Expired(ae.message)),
        KubeWatchEvent::Error(ae) => Err(Error::Transport(format!("{} ({})", ae.message, ae.code))),
    }
}

/// List+watch over `Api<DynamicObject>` for one resource type. API discovery
/// runs on first use and is cached once it succeeds.
pub struct KubeSource {
    client: Client,
    resource: ResourceType,
    opts: ListOptions,
    api: OnceCell<Api<DynamicObject>>,
}

impl KubeSource {
    pub fn new(client: Client, resource: ResourceType, opts: ListOptions) -> Self {
        Self { client, resource, opts, api: OnceCell::new() }
    }

    async fn api(&self) -> Result<&Api<DynamicObject>> {
        self.api
            .get_or_try_init(|| async {
                let (ar, namespaced) = find_api_resource(self.client.clone(), &self.resource)
                    .await
                    .map_err(|e| Error::Transport(format!("{e:#}")))?;
                let api = match (namespaced, self.opts.namespace.as_deref()) {
                    (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
                    _ => Api::all_with(self.client.clone(), &ar),
                };
                info!(gvk = %self.resource, namespaced, ns = ?self.opts.namespace, "resolved api resource");
                Ok::<_, Error>(api)
            })
            .await
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = self.opts.label_selector.as_deref() { lp = lp.labels(l); }
        if let Some(f) = self.opts.field_selector.as_deref() { lp = lp.fields(f); }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(l) = self.opts.label_selector.as_deref() { wp = wp.labels(l); }
        if let Some(f) = self.opts.field_selector.as_deref() { wp = wp.fields(f); }
        wp
    }
}

#[async_trait]
impl ListWatch<RawObject> for KubeSource {
    async fn list(&self) -> Result<(Vec<RawObject>, Version)> {
        let api = self.api().await?;
        let list = api.list(&self.list_params()).await.map_err(map_kube_err)?;
        let version = Version::new(list.metadata.resource_version.unwrap_or_default());
        let mut items = Vec::with_capacity(list.items.len());
        for o in &list.items {
            match to_raw(o) {
                Ok(raw) => items.push(raw),
                Err(e) => warn!(gvk = %self.resource, error = %e, "skipping undecodable list item"),
            }
        }
        Ok((items, version))
    }

    async fn watch(&self, version: &Version, stop: StopSignal) -> Result<WatchStream<RawObject>> {
        let api = self.api().await?;
        let stream = api.watch(&self.watch_params(), version.as_str()).await.map_err(map_kube_err)?;
        metrics::counter!("reflex_kube_watches_total", 1u64, "gvk" => self.resource.key());
        Ok(stream
            .map_err(map_kube_err)
            .and_then(|ev| futures::future::ready(map_watch_event(ev)))
            .take_until(stop.into_stopped())
            .boxed())
    }
}

/// Builds a [`KubeSource`] per resource type over one shared client.
#[derive(Clone)]
pub struct KubeSourceProvider {
    client: Client,
}

impl KubeSourceProvider {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client { &self.client }
}

impl SourceProvider<RawObject> for KubeSourceProvider {
    fn source_for(&self, resource: &ResourceType, opts: &ListOptions) -> Arc<dyn ListWatch<RawObject>> {
        Arc::new(KubeSource::new(self.client.clone(), resource.clone(), opts.clone()))
    }
}
