//! Shutdown coordinator
//!
//! Removes everything this instance declared for itself: first the router
//! bindings, so nothing new lands in its queues, then the queues themselves.
//! Failures are collected rather than aborting, so one stuck queue does not
//! leave the rest behind.

use std::sync::Arc;

use rp_broker::BrokerAdmin;
use tracing::{info, warn};

use crate::topology::TopologyHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub unbound: usize,
    pub deleted: usize,
    pub failures: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ShutdownCoordinator {
    admin: Arc<dyn BrokerAdmin>,
    topology: Arc<TopologyHandle>,
}

impl ShutdownCoordinator {
    pub fn new(admin: Arc<dyn BrokerAdmin>, topology: Arc<TopologyHandle>) -> Self {
        Self { admin, topology }
    }

    pub async fn release(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for binding in &self.topology.bindings {
            match self.admin.unbind_queue(binding).await {
                Ok(()) => report.unbound += 1,
                Err(e) => {
                    warn!(queue = %binding.queue, exchange = %binding.exchange, error = %e, "Failed to remove binding");
                    report
                        .failures
                        .push(format!("unbind {} from {}: {}", binding.queue, binding.exchange, e));
                }
            }
        }

        for queue in &self.topology.queues {
            match self.admin.delete_queue(queue).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to delete queue");
                    report.failures.push(format!("delete {}: {}", queue, e));
                }
            }
        }

        info!(
            suffix = %self.topology.identity.suffix(),
            unbound = report.unbound,
            deleted = report.deleted,
            failures = report.failures.len(),
            "Instance topology released"
        );
        report
    }
}
