#![forbid(unsafe_code)]

use std::sync::Arc;

use reflex_core::{ChangeEvent, ObjectKey, RawObject};
use reflex_store::{ChangeQueue, Indexer, Popped};

fn obj(name: &str, rv: u32) -> Arc<RawObject> {
    Arc::new(RawObject::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv.to_string() }
    })).unwrap())
}

#[derive(Clone, Copy, Debug)]
enum Op { Add, Update, Delete, Resync }

fn apply(store: &Indexer<RawObject>, key: &ObjectKey, ev: ChangeEvent<Arc<RawObject>>) {
    match ev {
        ChangeEvent::Added(o) | ChangeEvent::Updated(o) | ChangeEvent::Sync(o) => { store.put(key.clone(), o); }
        ChangeEvent::Deleted(_) => { store.delete(key); }
    }
}

/// Feed one op into the queue; `Resync` goes through `ChangeQueue::resync` the
/// way the reflector's timer does.
fn feed(q: &ChangeQueue<RawObject>, store: &Indexer<RawObject>, op: Op, o: Arc<RawObject>) {
    match op {
        Op::Add => q.push(ChangeEvent::Added(o)).unwrap(),
        Op::Update => q.push(ChangeEvent::Updated(o)).unwrap(),
        Op::Delete => q.push(ChangeEvent::Deleted(o)).unwrap(),
        Op::Resync => { q.resync(store).unwrap(); }
    }
}

/// Straight application: the reference result. A resync changes nothing.
fn apply_direct(store: &Indexer<RawObject>, key: &ObjectKey, op: Op, o: Arc<RawObject>) {
    match op {
        Op::Add => apply(store, key, ChangeEvent::Added(o)),
        Op::Update => apply(store, key, ChangeEvent::Updated(o)),
        Op::Delete => apply(store, key, ChangeEvent::Deleted(o)),
        Op::Resync => {}
    }
}

async fn drain(q: &ChangeQueue<RawObject>, store: &Indexer<RawObject>) {
    while !q.is_empty() {
        if let Some(Popped::Events { key, events }) = q.pop().await {
            for ev in events { apply(store, &key, ev); }
        }
    }
}

/// Every sequence of up to `len` ops, including adds of a present key, updates
/// and deletes of an absent one, and resyncs at any point.
fn histories(len: usize) -> Vec<Vec<Op>> {
    let mut out = vec![Vec::new()];
    let mut frontier = vec![Vec::new()];
    for _ in 0..len {
        let mut next = Vec::new();
        for h in &frontier {
            for op in [Op::Add, Op::Update, Op::Delete, Op::Resync] {
                let mut h: Vec<Op> = h.clone();
                h.push(op);
                next.push(h);
            }
        }
        out.extend(next.iter().cloned());
        frontier = next;
    }
    out
}

fn seeded(present: bool, key: &ObjectKey) -> Indexer<RawObject> {
    let store = Indexer::new();
    if present { store.put(key.clone(), obj("a", 0)); }
    store
}

#[tokio::test]
async fn coalescing_preserves_final_state_for_every_history_and_drain_point() {
    let key = ObjectKey::new(Some("ns"), "a");
    for present in [false, true] {
        for history in histories(5) {
            let direct = seeded(present, &key);
            for (i, op) in history.iter().enumerate() {
                apply_direct(&direct, &key, *op, obj("a", i as u32 + 1));
            }
            let expected = direct.get(&key).map(|o| o.resource_version.clone());

            // through the queue, draining after every prefix length in turn
            for drain_every in 1..=history.len().max(1) {
                let q = ChangeQueue::new("replay");
                let store = seeded(present, &key);
                for (i, op) in history.iter().enumerate() {
                    feed(&q, &store, *op, obj("a", i as u32 + 1));
                    if (i + 1) % drain_every == 0 { drain(&q, &store).await; }
                }
                drain(&q, &store).await;
                let got = store.get(&key).map(|o| o.resource_version.clone());
                assert_eq!(got, expected, "seeded={} history {:?} drained every {}", present, history, drain_every);
            }
        }
    }
}

#[tokio::test]
async fn independent_keys_do_not_interfere() {
    let q = ChangeQueue::new("replay");
    let store: Indexer<RawObject> = Indexer::new();
    q.push(ChangeEvent::Added(obj("a", 1))).unwrap();
    q.push(ChangeEvent::Added(obj("b", 2))).unwrap();
    q.push(ChangeEvent::Deleted(obj("a", 3))).unwrap();
    q.push(ChangeEvent::Updated(obj("b", 4))).unwrap();
    drain(&q, &store).await;
    assert!(store.get(&ObjectKey::new(Some("ns"), "a")).is_none());
    assert_eq!(store.get(&ObjectKey::new(Some("ns"), "b")).map(|o| o.resource_version.clone()), Some("4".to_string()));
}
