//! Reflex store: the indexed object cache and the change queue feeding it.

#![forbid(unsafe_code)]

pub mod indexer;
pub mod queue;

pub use indexer::{namespace_index_func, IndexFunc, Indexer, Indexers, NAMESPACE_INDEX};
pub use queue::{ChangeQueue, Pending, Popped, ReplaceSummary};
