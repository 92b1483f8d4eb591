//! Broker seams for the reporting pipeline
//!
//! This crate provides:
//! - BrokerAdmin: declare/bind/unbind/delete/list/shovel administrative operations
//! - EnvelopePublisher: publish an envelope to an exchange
//! - DeliverySource: exclusive, prefetch-bounded subscriptions to a queue
//! - ManagementClient: BrokerAdmin over the RabbitMQ management HTTP API
//! - AmqpBroker: publisher and delivery source over AMQP 0-9-1 (`amqp` feature)
//! - InMemoryBroker: a single-process broker with the same routing contract

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rp_common::{Envelope, HeaderValue, Headers};
use serde::Deserialize;

pub mod error;
pub mod management;
pub mod memory;
#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::{BrokerError, Result};
pub use management::{ManagementClient, ManagementConfig};
pub use memory::InMemoryBroker;
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

/// Exchange argument naming the header a consistent-hash exchange hashes on
pub const HASH_HEADER_ARGUMENT: &str = "hash-header";
pub const MESSAGE_TTL_ARGUMENT: &str = "x-message-ttl";
pub const DEAD_LETTER_EXCHANGE_ARGUMENT: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARGUMENT: &str = "x-dead-letter-routing-key";

/// The AMQP default exchange: routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

// ============================================================================
// Topology Descriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    ConsistentHash,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::ConsistentHash => "x-consistent-hash",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub arguments: Headers,
}

impl ExchangeSpec {
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
            arguments: Headers::new(),
        }
    }

    /// Consistent-hash exchange hashing on the given header instead of the routing key
    pub fn consistent_hash(name: impl Into<String>, hash_header: &str) -> Self {
        let mut arguments = Headers::new();
        arguments.insert(HASH_HEADER_ARGUMENT.to_string(), HeaderValue::from(hash_header));
        Self {
            name: name.into(),
            kind: ExchangeKind::ConsistentHash,
            durable: true,
            arguments,
        }
    }

    pub fn hash_header(&self) -> Option<&str> {
        self.arguments
            .get(HASH_HEADER_ARGUMENT)
            .and_then(HeaderValue::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub message_ttl: Option<Duration>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    /// Queue arguments as the broker expects them
    pub fn arguments(&self) -> Headers {
        let mut arguments = Headers::new();
        if let Some(ttl) = self.message_ttl {
            let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            arguments.insert(MESSAGE_TTL_ARGUMENT.to_string(), HeaderValue::Int(millis));
        }
        if let Some(ref exchange) = self.dead_letter_exchange {
            arguments.insert(DEAD_LETTER_EXCHANGE_ARGUMENT.to_string(), HeaderValue::from(exchange.as_str()));
        }
        if let Some(ref routing_key) = self.dead_letter_routing_key {
            arguments.insert(DEAD_LETTER_ROUTING_KEY_ARGUMENT.to_string(), HeaderValue::from(routing_key.as_str()));
        }
        arguments
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Broker-reported facts about a queue
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub consumers: u32,
    #[serde(default)]
    pub messages_ready: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShovelDeleteAfter {
    Never,
    /// Move the messages present at start, then remove the shovel
    QueueLength,
}

/// A broker-administered mover draining a queue into an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShovelSpec {
    pub name: String,
    pub source_queue: String,
    pub destination_exchange: String,
    pub destination_routing_key: String,
    pub delete_after: ShovelDeleteAfter,
}

// ============================================================================
// Broker Traits
// ============================================================================

/// Administrative operations on broker topology.
///
/// Declares are idempotent; unbinding or deleting something already gone succeeds.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()>;

    async fn unbind_queue(&self, binding: &BindingSpec) -> Result<()>;

    /// Delete regardless of remaining messages or consumers
    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn list_queues(&self) -> Result<Vec<QueueInfo>>;

    async fn declare_shovel(&self, shovel: &ShovelSpec) -> Result<()>;

    async fn delete_shovel(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()>;
}

/// Settles a single delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Reject without requeue; the broker dead-letters the message if the queue has a target
    async fn reject(&self) -> Result<()>;
}

/// An envelope received from a queue, settled exactly once
pub struct Delivery {
    pub envelope: Envelope,
    pub queue: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, queue: impl Into<String>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            queue: queue.into(),
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("envelope", &self.envelope)
            .finish()
    }
}

pub type Subscription = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Start an exclusive consumer holding at most `prefetch` unacknowledged deliveries
    async fn subscribe(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<Subscription>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_arguments() {
        let spec = QueueSpec::durable("retry.reporting.fast")
            .with_message_ttl(Duration::from_secs(10))
            .with_dead_letter("reporting", "1");
        let arguments = spec.arguments();

        assert_eq!(arguments.get(MESSAGE_TTL_ARGUMENT), Some(&HeaderValue::Int(10_000)));
        assert_eq!(arguments.get(DEAD_LETTER_EXCHANGE_ARGUMENT), Some(&HeaderValue::from("reporting")));
        assert_eq!(arguments.get(DEAD_LETTER_ROUTING_KEY_ARGUMENT), Some(&HeaderValue::from("1")));
    }

    #[test]
    fn test_plain_queue_has_no_arguments() {
        assert!(QueueSpec::durable("parkingLot.reporting").arguments().is_empty());
    }

    #[test]
    fn test_consistent_hash_exchange() {
        let spec = ExchangeSpec::consistent_hash("reporting", "hash-on");
        assert_eq!(spec.kind.as_str(), "x-consistent-hash");
        assert_eq!(spec.hash_header(), Some("hash-on"));
        assert!(spec.durable);
    }
}
