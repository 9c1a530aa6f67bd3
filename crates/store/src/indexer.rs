//! Keyed object table with named secondary indices.
//!
//! One `RwLock` guards the items and every index, so a write and its index
//! maintenance are observed atomically by readers.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reflex_core::{Error, Object, ObjectKey, Result};
use rustc_hash::{FxHashMap, FxHashSet};

/// Extracts zero or more index values from an object.
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;
pub type Indexers<T> = FxHashMap<String, IndexFunc<T>>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Indexes objects by namespace; cluster-scoped objects land under `""`.
pub fn namespace_index_func<T: Object>() -> IndexFunc<T> {
    Arc::new(|o: &T| vec![o.namespace().unwrap_or("").to_string()])
}

type Index = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<T> {
    items: FxHashMap<ObjectKey, Arc<T>>,
    indexers: Indexers<T>,
    indices: FxHashMap<String, Index>,
}

impl<T: Object> Inner<T> {
    fn update_indices(&mut self, key: &ObjectKey, old: Option<&T>, new: Option<&T>) {
        for (name, func) in self.indexers.iter() {
            let old_vals = old.map(|o| func(o)).unwrap_or_default();
            let new_vals = new.map(|o| func(o)).unwrap_or_default();
            let index = self.indices.entry(name.clone()).or_default();
            for v in old_vals.iter().filter(|v| !new_vals.contains(v)) {
                if let Some(set) = index.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() { index.remove(v); }
                }
            }
            for v in new_vals {
                index.entry(v).or_default().insert(key.clone());
            }
        }
    }

    fn index(&self, name: &str) -> Result<Option<&Index>> {
        if !self.indexers.contains_key(name) { return Err(Error::UnknownIndex(name.to_string())); }
        Ok(self.indices.get(name))
    }
}

pub struct Indexer<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: Object> Default for Indexer<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Object> Indexer<T> {
    pub fn new() -> Self { Self::with_indexers(Indexers::default()) }

    pub fn with_indexers(indexers: Indexers<T>) -> Self {
        Self { inner: RwLock::new(Inner { items: FxHashMap::default(), indexers, indices: FxHashMap::default() }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<T>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Inner<T>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> { self.read().items.get(key).cloned() }

    pub fn contains_key(&self, key: &ObjectKey) -> bool { self.read().items.contains_key(key) }

    /// Create or overwrite; returns the previous entry.
    pub fn put(&self, key: ObjectKey, obj: Arc<T>) -> Option<Arc<T>> {
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        inner.update_indices(&key, old.as_deref(), Some(obj.as_ref()));
        old
    }

    /// Remove `key` from the table and from every index.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<T>> {
        let mut inner = self.write();
        let old = inner.items.remove(key)?;
        inner.update_indices(key, Some(old.as_ref()), None);
        Some(old)
    }

    pub fn list(&self) -> Vec<Arc<T>> { self.read().items.values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<ObjectKey> { self.read().items.keys().cloned().collect() }

    pub fn entries(&self) -> Vec<(ObjectKey, Arc<T>)> {
        self.read().items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.read().items.is_empty() }

    /// Objects whose `index` values include `value`.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<T>>> {
        let inner = self.read();
        let Some(set) = inner.index(index)?.and_then(|ix| ix.get(value)) else { return Ok(Vec::new()) };
        Ok(set.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let inner = self.read();
        Ok(inner.index(index)?.and_then(|ix| ix.get(value)).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    pub fn list_index_values(&self, index: &str) -> Vec<String> {
        self.read().indices.get(index).map(|ix| ix.keys().cloned().collect()).unwrap_or_default()
    }

    /// Objects sharing at least one `index` value with `obj`.
    pub fn index(&self, index: &str, obj: &T) -> Result<Vec<Arc<T>>> {
        let inner = self.read();
        let func = inner.indexers.get(index).ok_or_else(|| Error::UnknownIndex(index.to_string()))?;
        let Some(ix) = inner.indices.get(index) else { return Ok(Vec::new()) };
        let mut keys: FxHashSet<&ObjectKey> = FxHashSet::default();
        for v in func(obj) {
            if let Some(set) = ix.get(&v) { keys.extend(set.iter()); }
        }
        Ok(keys.into_iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    /// Register more indexers; existing objects are indexed right away.
    pub fn add_indexers(&self, indexers: Indexers<T>) -> Result<()> {
        let mut inner = self.write();
        if let Some(dup) = indexers.keys().find(|n| inner.indexers.contains_key(*n)) {
            return Err(Error::IndexConflict(format!("indexer {:?} already exists", dup)));
        }
        for (name, func) in indexers {
            let mut index = Index::default();
            for (key, obj) in inner.items.iter() {
                for v in func(obj.as_ref()) { index.entry(v).or_default().insert(key.clone()); }
            }
            inner.indices.insert(name.clone(), index);
            inner.indexers.insert(name, func);
        }
        Ok(())
    }

    /// Swap the whole content, rebuilding every index.
    pub fn replace(&self, objects: Vec<(ObjectKey, Arc<T>)>) {
        let mut inner = self.write();
        inner.items.clear();
        inner.indices.clear();
        for (key, obj) in objects {
            let old = inner.items.insert(key.clone(), Arc::clone(&obj));
            inner.update_indices(&key, old.as_deref(), Some(obj.as_ref()));
        }
    }
}
