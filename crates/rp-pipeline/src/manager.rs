//! IngestManager - wires the pipeline together
//!
//! Start order: provision topology, start consumers, start lifecycle tasks.
//! Shutdown reverses it: stop lifecycle tasks, stop consumers, release the
//! instance's bindings and queues.

use std::sync::Arc;
use std::time::Duration;

use rp_broker::{BrokerAdmin, DeliverySource, EnvelopePublisher};
use rp_config::IngestConfig;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::consumer::{ConsumerPool, ConsumerPoolConfig};
use crate::error::PipelineError;
use crate::handler::HandlerRegistry;
use crate::lifecycle::{LifecycleConfig, LifecycleManager};
use crate::processor::MessageProcessor;
use crate::reclamation::IdleQueueReclaimer;
use crate::retry::{ErrorRouter, RetryPolicy};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::topology::{NodeIdentity, TopologyHandle, TopologyProvisioner};
use crate::Result;

/// Snapshot of the pipeline for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHealth {
    pub running: bool,
    /// Partition queues owned by this instance
    pub queues: usize,
    /// Partition queues with a live subscription
    pub subscribed: usize,
}

impl PipelineHealth {
    /// Running with every owned partition queue consumed
    pub fn is_up(&self) -> bool {
        self.running && self.subscribed == self.queues
    }
}

struct Running {
    topology: Arc<TopologyHandle>,
    consumers: ConsumerPool,
    lifecycle: LifecycleManager,
}

pub struct IngestManager {
    config: IngestConfig,
    admin: Arc<dyn BrokerAdmin>,
    publisher: Arc<dyn EnvelopePublisher>,
    source: Arc<dyn DeliverySource>,
    handlers: Arc<HandlerRegistry>,
    running: Mutex<Option<Running>>,
}

impl IngestManager {
    pub fn new(
        config: IngestConfig,
        admin: Arc<dyn BrokerAdmin>,
        publisher: Arc<dyn EnvelopePublisher>,
        source: Arc<dyn DeliverySource>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            config,
            admin,
            publisher,
            source,
            handlers,
            running: Mutex::new(None),
        }
    }

    /// Provision this instance's topology and start consuming
    pub async fn start(&self, identity: NodeIdentity) -> Result<Arc<TopologyHandle>> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let provisioner = TopologyProvisioner::new(self.admin.clone(), self.config.topology.clone());
        let topology = Arc::new(provisioner.provision(identity).await?);

        let errors = ErrorRouter::new(
            self.publisher.clone(),
            RetryPolicy::new(self.config.retry.max_retry_count),
        );
        let processor = Arc::new(MessageProcessor::new(self.handlers.clone(), errors));
        let consumers = ConsumerPool::new(
            self.source.clone(),
            self.admin.clone(),
            processor,
            ConsumerPoolConfig {
                prefetch_count: self.config.consumer.prefetch_count,
                restart_delay: Duration::from_millis(self.config.consumer.restart_delay_ms),
            },
        );
        consumers.start(&topology.queues);

        let reclaimer = Arc::new(IdleQueueReclaimer::new(self.admin.clone(), topology.clone()));
        let lifecycle = LifecycleManager::start(reclaimer, LifecycleConfig::from(&self.config.reclamation));

        info!(
            suffix = %topology.identity.suffix(),
            queues = topology.queues.len(),
            "Ingest pipeline started"
        );

        *running = Some(Running {
            topology: topology.clone(),
            consumers,
            lifecycle,
        });
        Ok(topology)
    }

    pub async fn topology(&self) -> Option<Arc<TopologyHandle>> {
        self.running.lock().await.as_ref().map(|r| r.topology.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn health(&self) -> PipelineHealth {
        match self.running.lock().await.as_ref() {
            Some(running) => PipelineHealth {
                running: true,
                queues: running.topology.queues.len(),
                subscribed: running.consumers.subscribed_count(),
            },
            None => PipelineHealth {
                running: false,
                queues: 0,
                subscribed: 0,
            },
        }
    }

    /// Graceful shutdown. Returns `None` when the pipeline was not running.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let running = self.running.lock().await.take()?;
        info!("Ingest pipeline shutting down...");

        running.lifecycle.shutdown().await;
        running.consumers.stop().await;

        let report = ShutdownCoordinator::new(self.admin.clone(), running.topology.clone())
            .release()
            .await;
        if !report.is_clean() {
            warn!(failures = ?report.failures, "Shutdown left broker resources behind");
        }

        info!("Ingest pipeline shutdown complete");
        Some(report)
    }
}
