//! Lifecycle Scheduling Tests
//!
//! Tests for:
//! - No sweep before the initial delay
//! - Sweeps on the fixed interval afterwards
//! - Shutdown stops the ticker

use std::sync::Arc;
use std::time::Duration;

use rp_broker::InMemoryBroker;
use rp_config::TopologyConfig;
use rp_pipeline::{
    IdleQueueReclaimer, LifecycleConfig, LifecycleManager, NodeIdentity, TopologyHandle,
    TopologyProvisioner,
};

async fn provision(broker: &InMemoryBroker, suffix: &str) -> TopologyHandle {
    let config = TopologyConfig {
        queue_count: 1,
        ..Default::default()
    };
    TopologyProvisioner::new(Arc::new(broker.clone()), config)
        .provision(NodeIdentity::from_suffix(suffix))
        .await
        .unwrap()
}

fn lifecycle(broker: &InMemoryBroker, live: TopologyHandle, enabled: bool) -> LifecycleManager {
    let reclaimer = Arc::new(IdleQueueReclaimer::new(Arc::new(broker.clone()), Arc::new(live)));
    LifecycleManager::start(
        reclaimer,
        LifecycleConfig {
            reclamation_enabled: enabled,
            reclamation_initial_delay: Duration::from_secs(60),
            reclamation_interval: Duration::from_secs(300),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_sweeps_after_initial_delay_then_on_interval() {
    let broker = InMemoryBroker::new();
    provision(&broker, "first").await;
    let live = provision(&broker, "live").await;
    let lifecycle = lifecycle(&broker, live, true);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(broker.has_queue("reporting.first.0"));

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(!broker.has_queue("reporting.first.0"));

    // next sweep is due at 360s
    provision(&broker, "second").await;
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(broker.has_queue("reporting.second.0"));

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(!broker.has_queue("reporting.second.0"));
    assert!(broker.has_queue("reporting.live.0"));

    lifecycle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_sweeps() {
    let broker = InMemoryBroker::new();
    let live = provision(&broker, "live").await;
    let lifecycle = lifecycle(&broker, live, true);

    tokio::time::sleep(Duration::from_secs(30)).await;
    lifecycle.shutdown().await;

    provision(&broker, "orphan").await;
    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert!(broker.has_queue("reporting.orphan.0"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_reclamation_never_sweeps() {
    let broker = InMemoryBroker::new();
    provision(&broker, "orphan").await;
    let live = provision(&broker, "live").await;
    let lifecycle = lifecycle(&broker, live, false);

    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert!(broker.has_queue("reporting.orphan.0"));

    lifecycle.shutdown().await;
}
