//! Read-only views over an informer's store.

use std::sync::Arc;

use reflex_core::{Object, ObjectKey, Selector};
use reflex_store::{Indexer, NAMESPACE_INDEX};

fn selected<T: Object>(objs: Vec<Arc<T>>, selector: &Selector) -> Vec<Arc<T>> {
    if selector.is_everything() { return objs; }
    objs.into_iter().filter(|o| selector.matches(o.labels())).collect()
}

#[derive(Clone)]
pub struct Lister<T> {
    store: Arc<Indexer<T>>,
}

impl<T: Object> Lister<T> {
    pub fn new(store: Arc<Indexer<T>>) -> Self { Self { store } }

    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<T>> { self.store.get(&ObjectKey::new(namespace, name)) }

    pub fn list(&self, selector: &Selector) -> Vec<Arc<T>> { selected(self.store.list(), selector) }

    pub fn namespaced(&self, namespace: impl Into<String>) -> NamespaceLister<T> {
        NamespaceLister { store: Arc::clone(&self.store), namespace: namespace.into() }
    }
}

/// Lister scoped to one namespace.
#[derive(Clone)]
pub struct NamespaceLister<T> {
    store: Arc<Indexer<T>>,
    namespace: String,
}

impl<T: Object> NamespaceLister<T> {
    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn get(&self, name: &str) -> Option<Arc<T>> { self.store.get(&ObjectKey::new(Some(&self.namespace), name)) }

    pub fn list(&self, selector: &Selector) -> Vec<Arc<T>> {
        let objs = match self.store.by_index(NAMESPACE_INDEX, &self.namespace) {
            Ok(objs) => objs,
            // Stores built without the namespace index fall back to a scan.
            Err(_) => self.store.list().into_iter().filter(|o| o.namespace() == Some(self.namespace.as_str())).collect(),
        };
        selected(objs, selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_core::RawObject;
    use reflex_store::{namespace_index_func, Indexers};

    fn obj(ns: Option<&str>, name: &str, app: &str) -> Arc<RawObject> {
        let mut meta = serde_json::json!({ "name": name, "labels": { "app": app } });
        if let Some(ns) = ns {
            meta["namespace"] = serde_json::json!(ns);
        }
        Arc::new(RawObject::from_value(serde_json::json!({ "metadata": meta })).unwrap())
    }

    fn store(indexed: bool) -> Arc<Indexer<RawObject>> {
        let mut indexers = Indexers::default();
        if indexed {
            indexers.insert(NAMESPACE_INDEX.to_string(), namespace_index_func());
        }
        let store = Arc::new(Indexer::with_indexers(indexers));
        for o in [obj(Some("a"), "web", "web"), obj(Some("a"), "db", "db"), obj(Some("b"), "web", "web"), obj(None, "node-1", "node")] {
            store.put(ObjectKey::of(o.as_ref()), o);
        }
        store
    }

    fn names(mut objs: Vec<Arc<RawObject>>) -> Vec<String> {
        objs.sort_by(|x, y| (x.namespace(), x.name()).cmp(&(y.namespace(), y.name())));
        objs.iter().map(|o| ObjectKey::of(o.as_ref()).to_string()).collect()
    }

    #[test]
    fn get_distinguishes_scope() {
        let lister = Lister::new(store(true));
        assert!(lister.get(Some("a"), "web").is_some());
        assert!(lister.get(None, "node-1").is_some());
        assert!(lister.get(None, "web").is_none());
        assert!(lister.get(Some("c"), "web").is_none());
    }

    #[test]
    fn list_applies_selector() {
        let lister = Lister::new(store(true));
        assert_eq!(lister.list(&Selector::everything()).len(), 4);
        let web: Selector = "app=web".parse().unwrap();
        assert_eq!(names(lister.list(&web)), vec!["a/web", "b/web"]);
        let not_web: Selector = "app notin (web)".parse().unwrap();
        assert_eq!(names(lister.list(&not_web)), vec!["node-1", "a/db"]);
    }

    #[test]
    fn namespaced_listing_with_and_without_index() {
        for indexed in [true, false] {
            let ns = Lister::new(store(indexed)).namespaced("a");
            assert_eq!(names(ns.list(&Selector::everything())), vec!["a/db", "a/web"]);
            assert_eq!(names(ns.list(&"app=db".parse().unwrap())), vec!["a/db"]);
            assert!(ns.get("web").is_some());
            assert!(ns.get("node-1").is_none());
        }
    }
}
