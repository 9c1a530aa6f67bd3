//! Informer and factory configuration, with `REFLEX_*` environment overrides.

use std::time::Duration;

use reflex_core::ResourceType;
use rustc_hash::FxHashMap;

use crate::source::ListOptions;

pub const DEFAULT_RESYNC_SECS: u64 = 300;
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 800;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 30;
pub const DEFAULT_FAILURE_REPORT_THRESHOLD: u32 = 5;
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 256;

fn env_parse<V: std::str::FromStr>(name: &str) -> Option<V> {
    std::env::var(name).ok().and_then(|s| s.parse::<V>().ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS), max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformerConfig {
    /// Period of the `Sync` re-delivery pass; zero disables it.
    pub resync_period: Duration,
    pub backoff: BackoffConfig,
    /// Consecutive source failures before `SourceUnavailable` is reported
    /// (and again at every multiple).
    pub failure_report_threshold: u32,
    pub error_channel_capacity: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(DEFAULT_RESYNC_SECS),
            backoff: BackoffConfig::default(),
            failure_report_threshold: DEFAULT_FAILURE_REPORT_THRESHOLD,
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
        }
    }
}

impl InformerConfig {
    /// Defaults overridden by `REFLEX_RESYNC_SECS`, `REFLEX_WATCH_BACKOFF_INITIAL_MS`,
    /// `REFLEX_WATCH_BACKOFF_MAX_SECS` and `REFLEX_FAILURE_REPORT_THRESHOLD`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            resync_period: env_parse::<u64>("REFLEX_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync_period),
            backoff: BackoffConfig {
                initial: env_parse::<u64>("REFLEX_WATCH_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.backoff.initial),
                max: env_parse::<u64>("REFLEX_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff.max),
            },
            failure_report_threshold: env_parse::<u32>("REFLEX_FAILURE_REPORT_THRESHOLD").filter(|n| *n > 0).unwrap_or(d.failure_report_threshold),
            error_channel_capacity: d.error_channel_capacity,
        }
    }

    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = BackoffConfig { initial, max };
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    pub informer: InformerConfig,
    pub list_options: ListOptions,
    pub resync_overrides: FxHashMap<ResourceType, Duration>,
}

impl FactoryConfig {
    /// Informer settings from the environment plus `REFLEX_NAMESPACE`.
    pub fn from_env() -> Self {
        let list_options = ListOptions { namespace: std::env::var("REFLEX_NAMESPACE").ok().filter(|s| !s.is_empty()), ..Default::default() };
        Self { informer: InformerConfig::from_env(), list_options, resync_overrides: FxHashMap::default() }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.list_options.namespace = Some(ns.into());
        self
    }

    pub fn label_selector(mut self, sel: impl Into<String>) -> Self {
        self.list_options.label_selector = Some(sel.into());
        self
    }

    pub fn field_selector(mut self, sel: impl Into<String>) -> Self {
        self.list_options.field_selector = Some(sel.into());
        self
    }

    pub fn resync_for(mut self, resource: ResourceType, period: Duration) -> Self {
        self.resync_overrides.insert(resource, period);
        self
    }

    /// Effective informer config for one resource type.
    pub fn informer_config(&self, resource: &ResourceType) -> InformerConfig {
        let mut cfg = self.informer.clone();
        if let Some(p) = self.resync_overrides.get(resource) { cfg.resync_period = *p; }
        cfg
    }
}
