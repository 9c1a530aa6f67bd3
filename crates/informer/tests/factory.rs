#![forbid(unsafe_code)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reflex_core::{stop_channel, ResourceType, Selector};
use reflex_informer::{wait_for_cache_sync, FactoryConfig, InformerFactory};

fn gadget() -> ResourceType { ResourceType::new("example.dev", "v1", "Gadget") }

#[tokio::test]
async fn one_informer_and_one_subscription_per_type() {
    let provider = Arc::new(FakeProvider::default().with(widget(), FakeSource::new().list(vec![obj(Some("ns"), "w1", "1")], "1")));
    let factory = InformerFactory::new(provider.clone(), FactoryConfig { informer: fast_config(), ..Default::default() });

    let first = factory.informer_for(&widget());
    let second = factory.informer_for(&widget());
    assert!(Arc::ptr_eq(&first, &second));
    let listers = [factory.lister_for(&widget()), factory.lister_for(&widget())];
    assert_eq!(provider.requests.load(Ordering::SeqCst), 1);

    let (handle, stop) = stop_channel();
    assert_eq!(factory.start(&stop), 1);
    assert_eq!(factory.start(&stop), 0);
    let synced = factory.wait_for_cache_sync(&stop).await;
    assert_eq!(synced.get(&widget()), Some(&true));

    let source = provider.source(&widget());
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.watch_versions().len(), 1);
    for lister in &listers {
        assert!(lister.get(Some("ns"), "w1").is_some());
        assert_eq!(lister.namespaced("ns").list(&Selector::everything()).len(), 1);
    }

    handle.stop();
    factory.shutdown().await;
    assert_eq!(first.state(), reflex_informer::InformerState::Stopped);
}

#[tokio::test]
async fn start_all_blocks_until_stopped() {
    let provider = Arc::new(
        FakeProvider::default()
            .with(widget(), FakeSource::new().list(vec![obj(None, "w", "1")], "1"))
            .with(gadget(), FakeSource::new().list(vec![obj(None, "g", "1")], "1")),
    );
    let factory = Arc::new(InformerFactory::new(provider, FactoryConfig { informer: fast_config(), ..Default::default() }));
    let informers = vec![factory.informer_for(&widget()), factory.informer_for(&gadget())];
    assert_eq!(factory.resources(), vec![gadget(), widget()]);

    let (handle, stop) = stop_channel();
    let running = tokio::spawn({
        let factory = factory.clone();
        async move { factory.start_all(stop).await }
    });
    assert!(wait_for_cache_sync(&informers, &handle.signal()).await);
    assert!(!running.is_finished());

    handle.stop();
    tokio::time::timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
    assert!(informers.iter().all(|i| i.has_synced()));
}

#[test]
fn per_type_resync_override_reaches_the_informer_config() {
    let cfg = FactoryConfig::default().namespace("team-a").resync_for(widget(), Duration::from_secs(7));
    assert_eq!(cfg.informer_config(&widget()).resync_period, Duration::from_secs(7));
    assert_eq!(cfg.list_options.namespace.as_deref(), Some("team-a"));
    assert_ne!(cfg.informer_config(&gadget()).resync_period, Duration::from_secs(7));
}
