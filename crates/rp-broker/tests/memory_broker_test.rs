//! In-Memory Broker Tests
//!
//! Tests for:
//! - Consistent-hash routing stability
//! - Dead-lettering on reject and on expiry
//! - Exclusive subscriptions and stream end on queue deletion
//! - Shovels with delete-after

use std::time::Duration;

use futures::StreamExt;
use rp_broker::{
    BindingSpec, BrokerAdmin, BrokerError, DeliverySource, EnvelopePublisher, ExchangeSpec,
    InMemoryBroker, QueueSpec, ShovelDeleteAfter, ShovelSpec,
};
use rp_common::{headers, Envelope};

async fn hash_topology(broker: &InMemoryBroker, queues: usize) -> Vec<String> {
    broker
        .declare_exchange(&ExchangeSpec::consistent_hash("reporting", headers::HASH_ON))
        .await
        .unwrap();

    let mut names = Vec::new();
    for index in 0..queues {
        let name = format!("reporting.test.{}", index);
        broker.declare_queue(&QueueSpec::durable(&name)).await.unwrap();
        broker
            .bind_queue(&BindingSpec::new("reporting", &name, "1"))
            .await
            .unwrap();
        names.push(name);
    }
    names
}

fn keyed(key: &str) -> Envelope {
    Envelope::new(key.as_bytes().to_vec()).with_header(headers::HASH_ON, key)
}

#[tokio::test]
async fn test_equal_keys_route_to_one_queue() {
    let broker = InMemoryBroker::new();
    let queues = hash_topology(&broker, 5).await;

    for _ in 0..20 {
        broker.publish("reporting", "1", &keyed("launch-7")).await.unwrap();
    }

    let holding: Vec<&String> = queues
        .iter()
        .filter(|q| broker.queue_depth(q) != Some(0))
        .collect();
    assert_eq!(holding.len(), 1);
    assert_eq!(broker.queue_depth(holding[0]), Some(20));
}

#[tokio::test]
async fn test_keys_spread_over_queues() {
    let broker = InMemoryBroker::new();
    let queues = hash_topology(&broker, 4).await;

    for key in 0..200 {
        broker
            .publish("reporting", "1", &keyed(&format!("launch-{}", key)))
            .await
            .unwrap();
    }

    let used = queues
        .iter()
        .filter(|q| broker.queue_depth(q).unwrap_or(0) > 0)
        .count();
    assert!(used > 1);
}

#[tokio::test]
async fn test_unknown_exchange_is_error() {
    let broker = InMemoryBroker::new();
    let err = broker
        .publish("missing", "1", &keyed("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::ExchangeNotFound(_)));
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = InMemoryBroker::new();
    broker
        .declare_queue(&QueueSpec::durable("parkingLot.reporting"))
        .await
        .unwrap();

    broker
        .publish("", "parkingLot.reporting", &keyed("a"))
        .await
        .unwrap();
    broker.publish("", "nowhere", &keyed("a")).await.unwrap();

    assert_eq!(broker.queue_depth("parkingLot.reporting"), Some(1));
}

#[tokio::test]
async fn test_reject_dead_letters_with_x_death() {
    let broker = InMemoryBroker::new();
    broker
        .declare_exchange(&ExchangeSpec::direct("reporting.retry"))
        .await
        .unwrap();
    broker
        .declare_queue(&QueueSpec::durable("source").with_dead_letter("reporting.retry", "retry.reporting"))
        .await
        .unwrap();
    broker
        .declare_queue(&QueueSpec::durable("retry.reporting"))
        .await
        .unwrap();
    broker
        .bind_queue(&BindingSpec::new("reporting.retry", "retry.reporting", "retry.reporting"))
        .await
        .unwrap();

    broker.publish("", "source", &keyed("a")).await.unwrap();

    let mut subscription = broker.subscribe("source", "test", 1).await.unwrap();
    let delivery = subscription.next().await.unwrap().unwrap();
    delivery.reject().await.unwrap();

    let dead = broker.messages("retry.reporting");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].death_count(), 1);
}

#[tokio::test]
async fn test_expiry_follows_dead_letter_target() {
    let broker = InMemoryBroker::new();
    let queues = hash_topology(&broker, 1).await;
    broker
        .declare_queue(
            &QueueSpec::durable("retry.reporting.fast")
                .with_message_ttl(Duration::from_secs(10))
                .with_dead_letter("reporting", "1"),
        )
        .await
        .unwrap();

    broker.publish("", "retry.reporting.fast", &keyed("a")).await.unwrap();
    assert_eq!(broker.expire_queue("retry.reporting.fast"), 1);

    assert_eq!(broker.queue_depth("retry.reporting.fast"), Some(0));
    assert_eq!(broker.queue_depth(&queues[0]), Some(1));
}

#[tokio::test]
async fn test_subscription_is_exclusive() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("q")).await.unwrap();

    let first = broker.subscribe("q", "one", 10).await.unwrap();
    assert_eq!(broker.consumer_count("q"), Some(1));

    let err = broker.subscribe("q", "two", 10).await.err().unwrap();
    assert!(matches!(err, BrokerError::ExclusiveConsumer(_)));

    drop(first);
    assert_eq!(broker.consumer_count("q"), Some(0));
    assert!(broker.subscribe("q", "two", 10).await.is_ok());
}

#[tokio::test]
async fn test_subscription_ends_when_queue_deleted() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("q")).await.unwrap();
    let mut subscription = broker.subscribe("q", "one", 10).await.unwrap();

    let deleter = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        deleter.delete_queue("q").await.unwrap();
    });

    let next = tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn test_subscribe_to_missing_queue() {
    let broker = InMemoryBroker::new();
    let err = broker.subscribe("nope", "one", 10).await.err().unwrap();
    assert!(matches!(err, BrokerError::QueueNotFound(_)));
}

#[tokio::test]
async fn test_shovel_moves_messages_and_removes_itself() {
    let broker = InMemoryBroker::new();
    let queues = hash_topology(&broker, 1).await;
    broker.declare_queue(&QueueSpec::durable("orphan")).await.unwrap();
    for _ in 0..3 {
        broker.publish("", "orphan", &keyed("a")).await.unwrap();
    }

    broker
        .declare_shovel(&ShovelSpec {
            name: "drain.orphan".to_string(),
            source_queue: "orphan".to_string(),
            destination_exchange: "reporting".to_string(),
            destination_routing_key: "1".to_string(),
            delete_after: ShovelDeleteAfter::QueueLength,
        })
        .await
        .unwrap();

    assert_eq!(broker.run_shovels(), 3);
    assert_eq!(broker.queue_depth("orphan"), Some(0));
    assert_eq!(broker.queue_depth(&queues[0]), Some(3));
    assert!(broker.shovels().is_empty());
}

#[tokio::test]
async fn test_list_reports_consumers_and_depth() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("a")).await.unwrap();
    broker.declare_queue(&QueueSpec::durable("b")).await.unwrap();
    broker.publish("", "b", &keyed("x")).await.unwrap();
    broker.attach_foreign_consumer("a").unwrap();

    let queues = broker.list_queues().await.unwrap();
    let a = queues.iter().find(|q| q.name == "a").unwrap();
    let b = queues.iter().find(|q| q.name == "b").unwrap();

    assert_eq!((a.consumers, a.messages_ready), (1, 0));
    assert_eq!((b.consumers, b.messages_ready), (0, 1));
}
