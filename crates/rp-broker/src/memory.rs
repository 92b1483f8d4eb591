//! In-memory broker
//!
//! Single-process stand-in for the broker used by tests and local runs. It
//! keeps the routing contract of the real topology:
//! - direct exchanges route on exact routing key
//! - consistent-hash exchanges send equal hash values to the same bound queue
//! - the default exchange routes by queue name
//! - rejected or expired messages follow the queue's dead-letter target and
//!   gain an `x-death` entry
//!
//! Time does not pass on its own: TTL expiry and shovel transfers happen when
//! [`InMemoryBroker::expire_queue`] and [`InMemoryBroker::run_shovels`] are called.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rp_common::{headers, Envelope, HeaderValue};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    Acknowledger, BindingSpec, BrokerAdmin, BrokerError, Delivery, DeliverySource, EnvelopePublisher,
    ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec, Result, ShovelDeleteAfter, ShovelSpec,
    Subscription, DEFAULT_EXCHANGE,
};

struct MemoryQueue {
    spec: QueueSpec,
    messages: VecDeque<Envelope>,
    consumers: u32,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            messages: VecDeque::new(),
            consumers: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, envelope: Envelope) {
        self.messages.push_back(envelope);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: BTreeMap<String, MemoryQueue>,
    bindings: Vec<BindingSpec>,
    shovels: BTreeMap<String, ShovelSpec>,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut bound: Vec<&BindingSpec> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && self.queues.contains_key(&b.queue))
            .collect();

        match spec.kind {
            ExchangeKind::Direct => {
                let mut targets: Vec<String> = bound
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect();
                targets.dedup();
                Ok(targets)
            }
            ExchangeKind::ConsistentHash => {
                if bound.is_empty() {
                    return Ok(Vec::new());
                }
                bound.sort_by(|a, b| a.queue.cmp(&b.queue));
                bound.dedup_by(|a, b| a.queue == b.queue);

                let hash_value = spec
                    .hash_header()
                    .and_then(|name| envelope.header(name))
                    .and_then(HeaderValue::to_text)
                    .unwrap_or_else(|| routing_key.to_string());
                let index = jump_consistent_hash(stable_hash(&hash_value), bound.len());
                Ok(vec![bound[index].queue.clone()])
            }
        }
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<usize> {
        let targets = self.route(exchange, routing_key, envelope)?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
        }
        for target in &targets {
            if let Some(queue) = self.queues.get_mut(target) {
                queue.push(envelope.clone());
            }
        }
        Ok(targets.len())
    }

    /// Forward to the queue's dead-letter target, recording provenance in `x-death`
    fn dead_letter(&mut self, queue: &str, mut envelope: Envelope, reason: &str) {
        let Some(spec) = self.queues.get(queue).map(|q| q.spec.clone()) else {
            return;
        };
        let Some(ref exchange) = spec.dead_letter_exchange else {
            debug!(queue, reason, "No dead-letter target, message dropped");
            return;
        };

        record_death(&mut envelope, queue, reason);
        let routing_key = spec.dead_letter_routing_key.clone().unwrap_or_default();
        if let Err(e) = self.publish(exchange, &routing_key, &envelope) {
            debug!(queue, error = %e, "Dead-lettering failed, message dropped");
        }
    }
}

fn record_death(envelope: &mut Envelope, queue: &str, reason: &str) {
    let mut entries = match envelope.headers.remove(headers::X_DEATH) {
        Some(HeaderValue::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let existing = entries.iter_mut().find_map(|entry| match entry {
        HeaderValue::Table(table)
            if table.get("queue").and_then(HeaderValue::as_str) == Some(queue)
                && table.get("reason").and_then(HeaderValue::as_str) == Some(reason) =>
        {
            Some(table)
        }
        _ => None,
    });

    match existing {
        Some(table) => {
            let count = table.get("count").and_then(HeaderValue::as_i64).unwrap_or(0);
            table.insert("count".to_string(), HeaderValue::Int(count + 1));
        }
        None => {
            let mut table = BTreeMap::new();
            table.insert("count".to_string(), HeaderValue::Int(1));
            table.insert("queue".to_string(), HeaderValue::from(queue));
            table.insert("reason".to_string(), HeaderValue::from(reason));
            entries.insert(0, HeaderValue::Table(table));
        }
    }

    envelope
        .headers
        .insert(headers::X_DEATH.to_string(), HeaderValue::Array(entries));
}

fn stable_hash(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Lamping & Veach jump consistent hash: maps a key onto `buckets` slots,
/// moving only ~1/n of keys when a slot is added.
fn jump_consistent_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b.max(0) as usize
}

/// In-memory broker implementing admin, publish and consume seams
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state.lock().queues.keys().cloned().collect()
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.state.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<u32> {
        self.state.lock().queues.get(name).map(|q| q.consumers)
    }

    /// Snapshot of the ready messages of a queue
    pub fn messages(&self, name: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .queues
            .get(name)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.state.lock().bindings.clone()
    }

    pub fn shovels(&self) -> Vec<ShovelSpec> {
        self.state.lock().shovels.values().cloned().collect()
    }

    /// Simulate a consumer attached from another process
    pub fn attach_foreign_consumer(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))?;
        queue.consumers += 1;
        Ok(())
    }

    /// Expire every ready message in a queue as if its TTL elapsed
    pub fn expire_queue(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<Envelope> = match state.queues.get_mut(name) {
            Some(queue) => queue.messages.drain(..).collect(),
            None => return 0,
        };
        let count = expired.len();
        for envelope in expired {
            state.dead_letter(name, envelope, "expired");
        }
        count
    }

    /// Run every declared shovel once, returning the number of messages moved
    pub fn run_shovels(&self) -> usize {
        let mut state = self.state.lock();
        let shovels: Vec<ShovelSpec> = state.shovels.values().cloned().collect();
        let mut moved = 0;

        for shovel in shovels {
            let drained: Vec<Envelope> = match state.queues.get_mut(&shovel.source_queue) {
                Some(queue) => queue.messages.drain(..).collect(),
                None => Vec::new(),
            };
            for envelope in drained {
                if state
                    .publish(&shovel.destination_exchange, &shovel.destination_routing_key, &envelope)
                    .is_ok()
                {
                    moved += 1;
                }
            }
            if shovel.delete_after == ShovelDeleteAfter::QueueLength {
                state.shovels.remove(&shovel.name);
            }
        }
        moved
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.state
            .lock()
            .exchanges
            .entry(exchange.name.clone())
            .or_insert_with(|| exchange.clone());
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.state
            .lock()
            .queues
            .entry(queue.name.clone())
            .or_insert_with(|| MemoryQueue::new(queue.clone()));
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::ExchangeNotFound(binding.exchange.clone()));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::QueueNotFound(binding.queue.clone()));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn unbind_queue(&self, binding: &BindingSpec) -> Result<()> {
        self.state.lock().bindings.retain(|b| b != binding);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.remove(name) {
            queue.notify.notify_one();
        }
        state.bindings.retain(|b| b.queue != name);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        Ok(self
            .state
            .lock()
            .queues
            .values()
            .map(|q| QueueInfo {
                name: q.spec.name.clone(),
                consumers: q.consumers,
                messages_ready: q.messages.len() as u64,
            })
            .collect())
    }

    async fn declare_shovel(&self, shovel: &ShovelSpec) -> Result<()> {
        self.state
            .lock()
            .shovels
            .insert(shovel.name.clone(), shovel.clone());
        Ok(())
    }

    async fn delete_shovel(&self, name: &str) -> Result<()> {
        self.state.lock().shovels.remove(name);
        Ok(())
    }
}

#[async_trait]
impl EnvelopePublisher for InMemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<()> {
        self.state.lock().publish(exchange, routing_key, envelope)?;
        Ok(())
    }
}

enum Polled {
    Message(Envelope),
    Empty(Arc<Notify>),
    Gone,
}

/// Holds the consumer slot of a queue for the lifetime of a subscription
struct ConsumerSlot {
    state: Arc<Mutex<State>>,
    queue: String,
}

impl ConsumerSlot {
    fn poll(&self) -> Polled {
        let mut state = self.state.lock();
        match state.queues.get_mut(&self.queue) {
            Some(queue) => match queue.messages.pop_front() {
                Some(envelope) => Polled::Message(envelope),
                None => Polled::Empty(queue.notify.clone()),
            },
            None => Polled::Gone,
        }
    }
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        if let Some(queue) = self.state.lock().queues.get_mut(&self.queue) {
            queue.consumers = queue.consumers.saturating_sub(1);
        }
    }
}

struct MemoryAcker {
    state: Arc<Mutex<State>>,
    queue: String,
    envelope: Envelope,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        self.state
            .lock()
            .dead_letter(&self.queue, self.envelope.clone(), "rejected");
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for InMemoryBroker {
    async fn subscribe(&self, queue: &str, consumer_tag: &str, _prefetch: u16) -> Result<Subscription> {
        {
            let mut state = self.state.lock();
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if entry.consumers > 0 {
                return Err(BrokerError::ExclusiveConsumer(queue.to_string()));
            }
            entry.consumers += 1;
        }
        debug!(queue, consumer_tag, "Subscribed");

        let slot = ConsumerSlot {
            state: self.state.clone(),
            queue: queue.to_string(),
        };

        let subscription = stream::unfold(slot, |slot| async move {
            loop {
                match slot.poll() {
                    Polled::Message(envelope) => {
                        let acker = MemoryAcker {
                            state: slot.state.clone(),
                            queue: slot.queue.clone(),
                            envelope: envelope.clone(),
                        };
                        let delivery = Delivery::new(envelope, slot.queue.clone(), Box::new(acker));
                        return Some((Ok::<_, BrokerError>(delivery), slot));
                    }
                    Polled::Empty(notify) => notify.notified().await,
                    Polled::Gone => return None,
                }
            }
        });

        Ok(subscription.boxed())
    }
}
