//! Event handler contract plus the closure-backed and filtering adapters.

use std::sync::Arc;

/// Handler return value. An `Err` is reported on the informer's error channel and
/// does not affect other handlers or later events.
pub type HandlerResult = anyhow::Result<()>;

pub trait EventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &Arc<T>) -> HandlerResult { Ok(()) }
    fn on_update(&self, _old: &Arc<T>, _new: &Arc<T>) -> HandlerResult { Ok(()) }
    fn on_delete(&self, _obj: &Arc<T>) -> HandlerResult { Ok(()) }
}

impl<T, H: EventHandler<T> + ?Sized> EventHandler<T> for Arc<H> {
    fn on_add(&self, obj: &Arc<T>) -> HandlerResult { (**self).on_add(obj) }
    fn on_update(&self, old: &Arc<T>, new: &Arc<T>) -> HandlerResult { (**self).on_update(old, new) }
    fn on_delete(&self, obj: &Arc<T>) -> HandlerResult { (**self).on_delete(obj) }
}

/// Returned by `add_event_handler`; pass back to `remove_event_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    pub(crate) id: u64,
}

impl HandlerRegistration {
    pub fn id(&self) -> u64 { self.id }
}

type OnObj<T> = Box<dyn Fn(&Arc<T>) -> HandlerResult + Send + Sync>;
type OnPair<T> = Box<dyn Fn(&Arc<T>, &Arc<T>) -> HandlerResult + Send + Sync>;

/// Handler assembled from optional closures.
pub struct HandlerFuncs<T> {
    add: Option<OnObj<T>>,
    update: Option<OnPair<T>>,
    delete: Option<OnObj<T>>,
}

impl<T> Default for HandlerFuncs<T> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<T> HandlerFuncs<T> {
    pub fn new() -> Self { Self::default() }

    pub fn add_fn(mut self, f: impl Fn(&Arc<T>) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn update_fn(mut self, f: impl Fn(&Arc<T>, &Arc<T>) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn delete_fn(mut self, f: impl Fn(&Arc<T>) -> HandlerResult + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<T: Send + Sync> EventHandler<T> for HandlerFuncs<T> {
    fn on_add(&self, obj: &Arc<T>) -> HandlerResult { self.add.as_ref().map_or(Ok(()), |f| f(obj)) }

    fn on_update(&self, old: &Arc<T>, new: &Arc<T>) -> HandlerResult { self.update.as_ref().map_or(Ok(()), |f| f(old, new)) }

    fn on_delete(&self, obj: &Arc<T>) -> HandlerResult { self.delete.as_ref().map_or(Ok(()), |f| f(obj)) }
}

/// Forwards only objects accepted by `filter`. An update that moves an object
/// into the filter is delivered as an add, one that moves it out as a delete.
pub struct FilteringHandler<T, H> {
    filter: Box<dyn Fn(&T) -> bool + Send + Sync>,
    inner: H,
}

impl<T, H> FilteringHandler<T, H> {
    pub fn new(filter: impl Fn(&T) -> bool + Send + Sync + 'static, inner: H) -> Self {
        Self { filter: Box::new(filter), inner }
    }
}

impl<T: Send + Sync, H: EventHandler<T>> EventHandler<T> for FilteringHandler<T, H> {
    fn on_add(&self, obj: &Arc<T>) -> HandlerResult {
        if (self.filter)(&**obj) { self.inner.on_add(obj) } else { Ok(()) }
    }

    fn on_update(&self, old: &Arc<T>, new: &Arc<T>) -> HandlerResult {
        match ((self.filter)(&**old), (self.filter)(&**new)) {
            (true, true) => self.inner.on_update(old, new),
            (false, true) => self.inner.on_add(new),
            (true, false) => self.inner.on_delete(old),
            (false, false) => Ok(()),
        }
    }

    fn on_delete(&self, obj: &Arc<T>) -> HandlerResult {
        if (self.filter)(&**obj) { self.inner.on_delete(obj) } else { Ok(()) }
    }
}
