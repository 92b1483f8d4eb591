//! Topology Provisioner
//!
//! Declares everything the pipeline needs on the broker at startup:
//! - `reporting`: consistent-hash router keyed on the `hash-on` header
//! - `reporting.retry`: direct exchange feeding the retry queues
//! - `retry.reporting` plus one TTL queue per retry tier, all dead-lettering
//!   back into the router
//! - `parkingLot.reporting`: quarantine for poison messages
//! - `reporting.<suffix>.<n>`: this instance's partition queues
//!
//! Shared queues are declared idempotently by every instance. Partition
//! queues belong to the instance and are returned in a [`TopologyHandle`].

use std::sync::Arc;

use rp_broker::{
    BindingSpec, BrokerAdmin, BrokerError, ExchangeSpec, QueueInfo, QueueSpec,
};
use rp_common::{headers, RetryTier};
use rp_config::TopologyConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::Result;

pub const REPORTING_EXCHANGE: &str = "reporting";
pub const RETRY_EXCHANGE: &str = "reporting.retry";
pub const PARTITION_QUEUE_PREFIX: &str = "reporting";
/// General retry entry; also the dead-letter route of partition queues
pub const RETRY_QUEUE: &str = "retry.reporting";
pub const PARKING_LOT_QUEUE: &str = "parkingLot.reporting";
/// Routing key shared by every partition binding and every return to the router
pub const DEFAULT_ROUTING_KEY: &str = "1";

pub fn tier_queue_name(tier: RetryTier) -> String {
    format!("{}.{}", RETRY_QUEUE, tier.name())
}

/// Whether a queue name has the `reporting.<suffix>.<n>` shape
pub fn is_partition_queue(name: &str) -> bool {
    let mut parts = name.split('.');
    matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(PARTITION_QUEUE_PREFIX), Some(suffix), Some(index), None)
            if !suffix.is_empty() && index.parse::<u32>().is_ok()
    )
}

/// Identity of this process among all instances sharing the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    suffix: String,
}

impl NodeIdentity {
    /// Fresh identity: the last dash-separated segment of a random UUID
    pub fn generate() -> Self {
        let id = Uuid::new_v4().to_string();
        let suffix = id.rsplit('-').next().unwrap_or(&id).to_string();
        Self { suffix }
    }

    pub fn from_suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn partition_queue(&self, index: u32) -> String {
        format!("{}.{}.{}", PARTITION_QUEUE_PREFIX, self.suffix, index)
    }
}

/// Queues and bindings owned by this instance
#[derive(Debug, Clone)]
pub struct TopologyHandle {
    pub identity: NodeIdentity,
    pub queues: Vec<String>,
    pub bindings: Vec<BindingSpec>,
}

impl TopologyHandle {
    pub fn owns(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }
}

pub struct TopologyProvisioner {
    admin: Arc<dyn BrokerAdmin>,
    config: TopologyConfig,
}

impl TopologyProvisioner {
    pub fn new(admin: Arc<dyn BrokerAdmin>, config: TopologyConfig) -> Self {
        Self { admin, config }
    }

    /// Declare shared topology and this instance's partition queues
    pub async fn provision(&self, identity: NodeIdentity) -> Result<TopologyHandle> {
        self.declare_shared().await?;

        let mut queues = if self.config.adopt_orphaned_queues {
            self.find_orphans().await?
        } else {
            Vec::new()
        };
        let adopted = queues.len();

        let remaining = (self.config.queue_count as usize).saturating_sub(adopted);
        queues.extend((0..remaining).map(|index| identity.partition_queue(index as u32)));

        // Adopted queues are redeclared too: a peer's sweep may have removed them since listing
        let mut bindings = Vec::with_capacity(queues.len());
        for queue in &queues {
            let binding = restore_partition_queue(self.admin.as_ref(), queue)
                .await
                .map_err(|e| provisioning(queue, e))?;
            bindings.push(binding);
        }

        info!(
            suffix = %identity.suffix(),
            queues = queues.len(),
            adopted,
            "Reporting topology provisioned"
        );

        Ok(TopologyHandle {
            identity,
            queues,
            bindings,
        })
    }

    async fn declare_shared(&self) -> Result<()> {
        let exchanges = [
            ExchangeSpec::consistent_hash(REPORTING_EXCHANGE, headers::HASH_ON),
            ExchangeSpec::direct(RETRY_EXCHANGE),
        ];
        for exchange in &exchanges {
            self.admin
                .declare_exchange(exchange)
                .await
                .map_err(|e| provisioning(&exchange.name, e))?;
        }

        let mut retry_queues = vec![(
            QueueSpec::durable(RETRY_QUEUE)
                .with_message_ttl(self.config.tier_ttl(RetryTier::Fast))
                .with_dead_letter(REPORTING_EXCHANGE, DEFAULT_ROUTING_KEY),
            RETRY_QUEUE.to_string(),
        )];
        for tier in RetryTier::ALL {
            retry_queues.push((
                QueueSpec::durable(tier_queue_name(tier))
                    .with_message_ttl(self.config.tier_ttl(tier))
                    .with_dead_letter(REPORTING_EXCHANGE, DEFAULT_ROUTING_KEY),
                tier.name().to_string(),
            ));
        }

        for (queue, routing_key) in &retry_queues {
            self.admin
                .declare_queue(queue)
                .await
                .map_err(|e| provisioning(&queue.name, e))?;
            self.admin
                .bind_queue(&BindingSpec::new(RETRY_EXCHANGE, &queue.name, routing_key))
                .await
                .map_err(|e| provisioning(&queue.name, e))?;
        }

        let parking_lot =
            QueueSpec::durable(PARKING_LOT_QUEUE).with_message_ttl(self.config.parking_lot_ttl());
        self.admin
            .declare_queue(&parking_lot)
            .await
            .map_err(|e| provisioning(PARKING_LOT_QUEUE, e))?;

        debug!("Shared reporting topology declared");
        Ok(())
    }

    /// Idle partition queues of other instances, up to the configured count
    async fn find_orphans(&self) -> Result<Vec<String>> {
        let listed = self
            .admin
            .list_queues()
            .await
            .map_err(|e| provisioning("queue listing", e))?;

        let mut orphans: Vec<String> = listed
            .into_iter()
            .filter(|q: &QueueInfo| q.consumers == 0 && is_partition_queue(&q.name))
            .map(|q| q.name)
            .collect();
        orphans.sort();
        orphans.truncate(self.config.queue_count as usize);

        for name in &orphans {
            info!(queue = %name, "Adopting idle partition queue");
        }
        Ok(orphans)
    }
}

/// Declare a partition queue and bind it to the router. Idempotent.
pub async fn restore_partition_queue(
    admin: &dyn BrokerAdmin,
    queue: &str,
) -> std::result::Result<BindingSpec, BrokerError> {
    admin.declare_queue(&partition_queue_spec(queue)).await?;
    let binding = BindingSpec::new(REPORTING_EXCHANGE, queue, DEFAULT_ROUTING_KEY);
    admin.bind_queue(&binding).await?;
    Ok(binding)
}

fn partition_queue_spec(name: &str) -> QueueSpec {
    QueueSpec::durable(name).with_dead_letter(RETRY_EXCHANGE, RETRY_QUEUE)
}

fn provisioning(target: &str, source: BrokerError) -> PipelineError {
    PipelineError::Provisioning {
        target: target.to_string(),
        source,
    }
}
