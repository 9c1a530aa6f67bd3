//! Reflex informers: list+watch reflectors feeding a shared, indexed cache and
//! fanning changes out to registered handlers.
//!
//! One [`SharedInformer`] exists per resource type; the [`InformerFactory`] hands
//! the same instance to every caller so only one subscription is opened.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod informer;
pub mod lister;
pub mod reflector;
pub mod source;

pub use backoff::Backoff;
pub use config::{BackoffConfig, FactoryConfig, InformerConfig};
pub use error::InformerError;
pub use factory::InformerFactory;
pub use handler::{EventHandler, FilteringHandler, HandlerFuncs, HandlerRegistration, HandlerResult};
pub use informer::{wait_for_cache_sync, InformerState, SharedInformer};
pub use lister::{Lister, NamespaceLister};
pub use reflector::Reflector;
pub use source::{ListOptions, ListWatch, SourceProvider, WatchEvent, WatchStream};

pub use reflex_store::{namespace_index_func, IndexFunc, Indexer, Indexers, NAMESPACE_INDEX};
