//! ConsumerPool - one exclusive consumer task per partition queue
//!
//! - Deliveries of a queue are processed one at a time, in delivery order
//! - The broker bounds in-flight work per queue through the prefetch count
//! - A subscription that ends or fails is re-established after a delay
//! - A queue that disappeared (e.g. removed by a peer's sweep) is redeclared
//!   and rebound before resubscribing
//! - All tasks stop on the shutdown signal

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rp_broker::{BrokerAdmin, BrokerError, DeliverySource, Subscription};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::processor::MessageProcessor;
use crate::topology::restore_partition_queue;

#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    pub prefetch_count: u16,
    /// Delay before resubscribing to a queue
    pub restart_delay: Duration,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            restart_delay: Duration::from_secs(5),
        }
    }
}

pub struct ConsumerPool {
    source: Arc<dyn DeliverySource>,
    admin: Arc<dyn BrokerAdmin>,
    processor: Arc<MessageProcessor>,
    config: ConsumerPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    subscribed: Arc<AtomicUsize>,
}

impl ConsumerPool {
    pub fn new(
        source: Arc<dyn DeliverySource>,
        admin: Arc<dyn BrokerAdmin>,
        processor: Arc<MessageProcessor>,
        config: ConsumerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            source,
            admin,
            processor,
            config,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            subscribed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn a consumer for each queue
    pub fn start(&self, queues: &[String]) {
        info!(
            queues = queues.len(),
            prefetch = self.config.prefetch_count,
            "Starting consumer pool"
        );

        let mut handles = self.handles.lock();
        for queue in queues {
            let worker = ConsumerWorker {
                queue: queue.clone(),
                consumer_tag: format!("rp-ingest.{}", queue),
                source: self.source.clone(),
                admin: self.admin.clone(),
                processor: self.processor.clone(),
                config: self.config.clone(),
                subscribed: self.subscribed.clone(),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(worker.run(shutdown_rx)));
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Consumers currently holding a live subscription
    pub fn subscribed_count(&self) -> usize {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Signal every consumer and wait for in-progress deliveries to settle
    pub async fn stop(&self) {
        info!("Consumer pool shutting down...");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }
        info!("Consumer pool stopped");
    }
}

struct ConsumerWorker {
    queue: String,
    consumer_tag: String,
    source: Arc<dyn DeliverySource>,
    admin: Arc<dyn BrokerAdmin>,
    processor: Arc<MessageProcessor>,
    config: ConsumerPoolConfig,
    subscribed: Arc<AtomicUsize>,
}

/// Why a subscription stopped delivering
enum Stopped {
    Shutdown,
    Interrupted,
}

impl ConsumerWorker {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = self.source.subscribe(&self.queue, &self.consumer_tag, self.config.prefetch_count) => result,
            };

            match subscribed {
                Ok(subscription) => {
                    info!(queue = %self.queue, "Consumer subscribed");
                    self.subscribed.fetch_add(1, Ordering::SeqCst);
                    let stopped = self.consume(subscription, &mut shutdown_rx).await;
                    self.subscribed.fetch_sub(1, Ordering::SeqCst);
                    if let Stopped::Shutdown = stopped {
                        break;
                    }
                }
                Err(BrokerError::QueueNotFound(_)) => {
                    warn!(queue = %self.queue, "Partition queue missing, redeclaring");
                    if let Err(e) = restore_partition_queue(self.admin.as_ref(), &self.queue).await {
                        warn!(queue = %self.queue, error = %e, "Failed to redeclare partition queue");
                    }
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to subscribe");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.config.restart_delay) => {
                    debug!(queue = %self.queue, "Resubscribing");
                }
            }
        }

        info!(queue = %self.queue, "Consumer shutting down");
    }

    async fn consume(&self, mut subscription: Subscription, shutdown_rx: &mut broadcast::Receiver<()>) -> Stopped {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Stopped::Shutdown,
                next = subscription.next() => match next {
                    Some(Ok(delivery)) => {
                        let outcome = self.processor.process(delivery).await;
                        debug!(queue = %self.queue, outcome = outcome.as_str(), "Delivery settled");
                    }
                    Some(Err(e)) => {
                        warn!(queue = %self.queue, error = %e, "Subscription failed");
                        return Stopped::Interrupted;
                    }
                    None => {
                        warn!(queue = %self.queue, "Subscription ended");
                        return Stopped::Interrupted;
                    }
                }
            }
        }
    }
}
