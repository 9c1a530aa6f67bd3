//! Non-fatal informer reports: handler failures and sustained source outages.

use reflex_core::{Error, EventKind, ObjectKey};

/// Reports published on an informer's observability channel. None of these stop
/// the informer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InformerError {
    #[error("{resource}: handler #{handler} failed on {kind:?} {key}: {message}")]
    HandlerFailed { resource: String, handler: u64, kind: EventKind, key: ObjectKey, message: String },
    #[error("{resource}: source unavailable after {failures} consecutive failures: {last_error}")]
    SourceUnavailable { resource: String, failures: u32, last_error: Error },
}
