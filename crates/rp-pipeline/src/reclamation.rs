//! Idle-queue reclamation
//!
//! Partition queues outlive instances that crash or are killed. A sweep finds
//! partition queues that are not ours and have no consumers, detaches them
//! from the router, then either deletes them (empty) or hands their backlog
//! to a self-removing shovel that drains it back into the router.
//!
//! Queues with a live consumer belong to a running instance and are skipped.

use std::sync::Arc;

use metrics::counter;
use rp_broker::{BindingSpec, BrokerAdmin, QueueInfo, ShovelDeleteAfter, ShovelSpec};
use tracing::{debug, info, warn};

use crate::topology::{is_partition_queue, TopologyHandle, DEFAULT_ROUTING_KEY, REPORTING_EXCHANGE};
use crate::Result;

/// Name of the shovel draining a reclaimed queue
pub fn drain_shovel_name(queue: &str) -> String {
    format!("drain.{}", queue)
}

/// What a single sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclamationReport {
    pub unbound: Vec<String>,
    pub shoveled: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

impl ReclamationReport {
    pub fn is_empty(&self) -> bool {
        self.unbound.is_empty() && self.failed.is_empty()
    }
}

pub struct IdleQueueReclaimer {
    admin: Arc<dyn BrokerAdmin>,
    topology: Arc<TopologyHandle>,
}

impl IdleQueueReclaimer {
    pub fn new(admin: Arc<dyn BrokerAdmin>, topology: Arc<TopologyHandle>) -> Self {
        Self { admin, topology }
    }

    /// Run one sweep. Only the queue listing can fail the sweep as a whole.
    pub async fn sweep(&self) -> Result<ReclamationReport> {
        let queues = self.admin.list_queues().await?;
        let mut report = ReclamationReport::default();

        for queue in queues
            .iter()
            .filter(|q| is_partition_queue(&q.name) && !self.topology.owns(&q.name))
        {
            if queue.consumers > 0 {
                debug!(queue = %queue.name, consumers = queue.consumers, "Partition queue in use");
                continue;
            }
            self.reclaim(queue, &mut report).await;
        }

        if !report.is_empty() {
            info!(
                unbound = report.unbound.len(),
                shoveled = report.shoveled.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Idle queue reclamation finished"
            );
        }
        Ok(report)
    }

    async fn reclaim(&self, queue: &QueueInfo, report: &mut ReclamationReport) {
        let binding = BindingSpec::new(REPORTING_EXCHANGE, &queue.name, DEFAULT_ROUTING_KEY);
        if let Err(e) = self.admin.unbind_queue(&binding).await {
            warn!(queue = %queue.name, error = %e, "Failed to unbind idle queue");
            report.failed.push(queue.name.clone());
            return;
        }
        report.unbound.push(queue.name.clone());

        let shovel_name = drain_shovel_name(&queue.name);
        if queue.messages_ready > 0 {
            let shovel = ShovelSpec {
                name: shovel_name,
                source_queue: queue.name.clone(),
                destination_exchange: REPORTING_EXCHANGE.to_string(),
                destination_routing_key: DEFAULT_ROUTING_KEY.to_string(),
                delete_after: ShovelDeleteAfter::QueueLength,
            };
            match self.admin.declare_shovel(&shovel).await {
                Ok(()) => {
                    info!(queue = %queue.name, messages = queue.messages_ready, "Draining idle queue");
                    counter!("rp_reclaimed_queues_total", "action" => "shoveled").increment(1);
                    report.shoveled.push(queue.name.clone());
                }
                Err(e) => {
                    warn!(queue = %queue.name, error = %e, "Failed to declare drain shovel");
                    report.failed.push(queue.name.clone());
                }
            }
            return;
        }

        match self.admin.delete_queue(&queue.name).await {
            Ok(()) => {
                if let Err(e) = self.admin.delete_shovel(&shovel_name).await {
                    warn!(shovel = %shovel_name, error = %e, "Failed to remove drain shovel");
                }
                info!(queue = %queue.name, "Deleted idle queue");
                counter!("rp_reclaimed_queues_total", "action" => "deleted").increment(1);
                report.deleted.push(queue.name.clone());
            }
            Err(e) => {
                warn!(queue = %queue.name, error = %e, "Failed to delete idle queue");
                report.failed.push(queue.name.clone());
            }
        }
    }
}
