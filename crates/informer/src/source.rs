//! The list+watch contract a source adapter fulfils for one resource type.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reflex_core::{ResourceType, Result, StopSignal, Version};

/// One notification from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// Progress marker: only advances the version token.
    Bookmark(Version),
}

/// Scope applied to both list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

/// Stream items:
/// - `Err(Error::Expired)` ends the stream; the reflector relists.
/// - `Err(Error::Decode)` drops one object; the stream continues.
/// - any other `Err` ends the stream; the reflector re-watches with backoff.
/// - end of stream is a clean close.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>>>;

#[async_trait]
pub trait ListWatch<T>: Send + Sync {
    /// Full snapshot plus the version token it corresponds to.
    async fn list(&self) -> Result<(Vec<T>, Version)>;

    /// Events after `version`. The stream must end promptly once `stop` fires.
    async fn watch(&self, version: &Version, stop: StopSignal) -> Result<WatchStream<T>>;
}

/// Builds the source for a resource type; used lazily by the factory.
pub trait SourceProvider<T>: Send + Sync {
    fn source_for(&self, resource: &ResourceType, opts: &ListOptions) -> Arc<dyn ListWatch<T>>;
}
