#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{endpoints, locator_config, test_locator, TestBus, TestProbe};
use futures::future::join_all;
use iroh_locator::protocol::{ReplyMessage, ReplyPayload};
use iroh_locator::{DiscoveryError, Identity, QueryKey, Registry, ResponderConfig, Resolved};
use tokio::time::{sleep, Duration, Instant};

#[tokio::test(start_paused = true)]
async fn concurrent_lookups_share_one_query() {
    let bus = TestBus::new();
    let registry = bus.add_registry(Duration::from_millis(50)).await;
    registry
        .register_adapter("A1", endpoints(&["tcp://10.0.0.1:4000"]))
        .await;
    let (locator, channels) = test_locator(&bus, locator_config(300, 3, 1), 1).await;

    let lookups = (0..5).map(|_| locator.resolve_adapter("A1"));
    let results = join_all(lookups).await;

    for result in results {
        assert_eq!(result.expect("resolved"), endpoints(&["tcp://10.0.0.1:4000"]));
    }
    assert_eq!(channels[0].sent_count().await, 1);
    assert_eq!(locator.pending_queries().await, 0);
}

#[tokio::test(start_paused = true)]
async fn reply_to_superseded_round_is_ignored() {
    let bus = TestBus::new();
    let (locator, channels) = test_locator(&bus, locator_config(100, 1, 1), 1).await;
    let key = QueryKey::Adapter("A1".into());

    let pending = locator.begin(key.clone()).await;
    let first = channels[0].sent().await[0].request_id;

    sleep(Duration::from_millis(150)).await;
    let sent = channels[0].sent().await;
    assert_eq!(sent.len(), 2);
    let second = sent[1].request_id;
    assert_ne!(first, second);

    let payload = ReplyPayload::Adapter {
        endpoints: endpoints(&["tcp://old:1"]),
        is_replica_group: false,
    };
    locator
        .handle_reply(ReplyMessage::new(first, key.clone(), payload))
        .await;
    assert_eq!(locator.pending_queries().await, 1);

    let payload = ReplyPayload::Adapter {
        endpoints: endpoints(&["tcp://new:1"]),
        is_replica_group: false,
    };
    locator
        .handle_reply(ReplyMessage::new(second, key, payload))
        .await;
    assert_eq!(
        pending.await.expect("resolved"),
        Resolved::Endpoints(endpoints(&["tcp://new:1"]))
    );
}

#[tokio::test(start_paused = true)]
async fn fails_fast_when_no_channel_can_send() {
    let bus = TestBus::new();
    let (locator, channels) = test_locator(&bus, locator_config(300, 3, 1), 2).await;
    for channel in &channels {
        channel.set_failing(true);
    }

    let start = Instant::now();
    let err = locator.resolve_adapter("A1").await.expect_err("no path");
    assert!(matches!(err, DiscoveryError::NoNetworkPath(_)));
    assert!(err.is_not_found());
    assert!(start.elapsed() < Duration::from_millis(300));
    assert_eq!(locator.pending_queries().await, 0);
}

#[tokio::test(start_paused = true)]
async fn one_working_channel_keeps_the_query_alive() {
    let bus = TestBus::new();
    let registry = bus.add_registry(Duration::from_millis(20)).await;
    registry.register_adapter("A1", endpoints(&["tcp://a:1"])).await;
    let (locator, channels) = test_locator(&bus, locator_config(300, 3, 1), 2).await;
    channels[0].set_failing(true);

    let found = locator.resolve_adapter("A1").await.expect("resolved");
    assert_eq!(found, endpoints(&["tcp://a:1"]));
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded() {
    let bus = TestBus::new();
    let (locator, channels) = test_locator(&bus, locator_config(100, 3, 1), 1).await;

    let start = Instant::now();
    let err = locator.resolve_adapter("missing").await.expect_err("not found");
    assert_eq!(err, DiscoveryError::NotFound(QueryKey::Adapter("missing".into())));
    assert_eq!(channels[0].sent_count().await, 4);
    assert!(start.elapsed() >= Duration::from_millis(400));

    let ids: std::collections::HashSet<_> = channels[0]
        .sent()
        .await
        .into_iter()
        .map(|q| q.request_id)
        .collect();
    assert_eq!(ids.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn replica_group_replies_are_unioned_within_the_window() {
    let bus = TestBus::new();
    let first = bus.add_registry(Duration::from_millis(10)).await;
    first
        .register_replicated_adapter("R1", "G", endpoints(&["tcp://r1:1"]))
        .await;
    let second = bus.add_registry(Duration::from_millis(15)).await;
    second
        .register_replicated_adapter("R2", "G", endpoints(&["tcp://r2:1"]))
        .await;
    let (locator, _) = test_locator(&bus, locator_config(300, 3, 2), 1).await;

    let found = locator.resolve_adapter("G").await.expect("resolved");
    assert_eq!(found, endpoints(&["tcp://r1:1", "tcp://r2:1"]));
}

#[tokio::test(start_paused = true)]
async fn replica_reply_after_the_window_is_dropped() {
    let bus = TestBus::new();
    let first = bus.add_registry(Duration::from_millis(10)).await;
    first
        .register_replicated_adapter("R1", "G", endpoints(&["tcp://r1:1"]))
        .await;
    let late = bus.add_registry(Duration::from_millis(40)).await;
    late.register_replicated_adapter("R2", "G", endpoints(&["tcp://r2:1"]))
        .await;
    let (locator, _) = test_locator(&bus, locator_config(300, 3, 1), 1).await;

    let found = locator.resolve_adapter("G").await.expect("resolved");
    assert_eq!(found, endpoints(&["tcp://r1:1"]));
}

#[tokio::test(start_paused = true)]
async fn plain_adapter_reply_completes_immediately() {
    let bus = TestBus::new();
    let registry = bus.add_registry(Duration::from_millis(10)).await;
    registry.register_adapter("A1", endpoints(&["tcp://a:1"])).await;
    let (locator, _) = test_locator(&bus, locator_config(300, 3, 10), 1).await;

    let start = Instant::now();
    locator.resolve_adapter("A1").await.expect("resolved");
    assert!(start.elapsed() < Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn entity_lookup_prefers_live_replica_group() {
    let bus = TestBus::new();
    let probe = TestProbe::default();
    let registry = Arc::new(Registry::new());
    registry
        .register_replicated_adapter("H1", "Hello", endpoints(&["tcp://h1:1"]))
        .await;
    registry
        .register_replicated_adapter("H2", "Hello", endpoints(&["tcp://h2:1"]))
        .await;
    registry.register_adapter("P", endpoints(&["tcp://p:1"])).await;
    bus.add_responder(
        ResponderConfig::default(),
        registry,
        probe.clone(),
        Duration::from_millis(5),
    )
    .await;
    let (locator, _) = test_locator(&bus, locator_config(300, 3, 1), 1).await;

    let found = locator
        .resolve_entity(&Identity::new("hello"))
        .await
        .expect("resolved");
    assert_eq!(found, endpoints(&["tcp://h1:1", "tcp://h2:1"]));

    probe.set_dead("tcp://h1:1", true).await;
    probe.set_dead("tcp://h2:1", true).await;
    let found = locator
        .resolve_entity(&Identity::new("hello"))
        .await
        .expect("resolved");
    assert_eq!(found, endpoints(&["tcp://p:1"]));
}

#[tokio::test(start_paused = true)]
async fn responders_in_other_domains_stay_silent() {
    let bus = TestBus::new();
    let registry = Arc::new(Registry::new());
    registry.register_adapter("A1", endpoints(&["tcp://a:1"])).await;
    let config = ResponderConfig {
        domain_id: "blue".into(),
        ..ResponderConfig::default()
    };
    bus.add_responder(config, registry, TestProbe::default(), Duration::from_millis(5))
        .await;

    let mut config = locator_config(100, 0, 1);
    config.domain_id = "red".into();
    let (locator, _) = test_locator(&bus, config, 1).await;

    let err = locator.resolve_adapter("A1").await.expect_err("filtered");
    assert!(matches!(err, DiscoveryError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn bounded_wait_leaves_the_query_running() {
    let bus = TestBus::new();
    let registry = bus.add_registry(Duration::from_millis(250)).await;
    registry.register_adapter("A1", endpoints(&["tcp://a:1"])).await;
    let (locator, _) = test_locator(&bus, locator_config(300, 0, 1), 1).await;
    let key = QueryKey::Adapter("A1".into());

    let err = locator
        .resolve_within(key.clone(), Duration::from_millis(50))
        .await
        .expect_err("budget");
    assert_eq!(err, DiscoveryError::WaitBudgetExceeded);
    assert_eq!(locator.pending_queries().await, 1);

    let resolved = locator
        .resolve_within(key, Duration::from_millis(500))
        .await
        .expect("resolved");
    assert_eq!(resolved, Resolved::Endpoints(endpoints(&["tcp://a:1"])));
}

#[tokio::test(start_paused = true)]
async fn duplicate_replies_are_dropped() {
    let bus = TestBus::new();
    let (locator, channels) = test_locator(&bus, locator_config(100, 0, 1), 1).await;
    let key = QueryKey::Adapter("G".into());

    let pending = locator.begin(key.clone()).await;
    let request_id = channels[0].sent().await[0].request_id;
    let reply = ReplyMessage::new(
        request_id,
        key.clone(),
        ReplyPayload::Adapter {
            endpoints: endpoints(&["tcp://r1:1"]),
            is_replica_group: true,
        },
    );
    locator.handle_reply(reply.clone()).await;
    locator.handle_reply(reply).await;

    assert_eq!(
        pending.await.expect("resolved"),
        Resolved::Endpoints(endpoints(&["tcp://r1:1"]))
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_every_waiter() {
    let bus = TestBus::new();
    let (locator, _) = test_locator(&bus, locator_config(300, 3, 1), 1).await;

    let first = locator.begin(QueryKey::Adapter("A1".into())).await;
    let second = locator.begin(QueryKey::Entity(Identity::new("x"))).await;
    locator.shutdown().await;

    assert_eq!(first.await, Err(DiscoveryError::Shutdown));
    assert_eq!(second.await, Err(DiscoveryError::Shutdown));
    assert_eq!(
        locator.resolve_adapter("A1").await,
        Err(DiscoveryError::Shutdown)
    );
}
