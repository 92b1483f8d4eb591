//! Retry ladder
//!
//! A failed envelope either climbs the ladder (retry count incremented, sent
//! to the tier queue whose TTL delays its return to the router) or is parked.
//! Parking happens for non-retryable failures and once the retry budget is
//! spent; the retry count is left as it was.

use std::sync::Arc;

use rp_broker::{EnvelopePublisher, DEFAULT_EXCHANGE};
use rp_common::{Envelope, RetryTier};
use tracing::{info, warn};

use crate::topology::{PARKING_LOT_QUEUE, RETRY_EXCHANGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retry_count: 20 }
    }
}

/// Where a failed envelope goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { tier: RetryTier, retry_count: u32 },
    Park,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32) -> Self {
        Self { max_retry_count }
    }

    pub fn decide(&self, retryable: bool, retry_count: u32) -> FailureDecision {
        if !retryable || retry_count >= self.max_retry_count {
            return FailureDecision::Park;
        }
        let next = retry_count + 1;
        FailureDecision::Retry {
            tier: RetryTier::for_retry_count(next),
            retry_count: next,
        }
    }
}

/// Publishes failed envelopes to a retry tier or the parking lot
pub struct ErrorRouter {
    publisher: Arc<dyn EnvelopePublisher>,
    policy: RetryPolicy,
}

impl ErrorRouter {
    pub fn new(publisher: Arc<dyn EnvelopePublisher>, policy: RetryPolicy) -> Self {
        Self { publisher, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn route(
        &self,
        envelope: &Envelope,
        retryable: bool,
        reason: &str,
    ) -> rp_broker::Result<FailureDecision> {
        let retry_count = envelope.retry_count();
        let decision = self.policy.decide(retryable, retry_count);

        let mut forwarded = envelope.clone();
        forwarded.set_exception(reason);

        match decision {
            FailureDecision::Retry { tier, retry_count } => {
                forwarded.set_retry_count(retry_count);
                self.publisher
                    .publish(RETRY_EXCHANGE, tier.name(), &forwarded)
                    .await?;
                info!(
                    tier = %tier,
                    retry_count,
                    partition_key = ?envelope.partition_key(),
                    "Envelope scheduled for retry"
                );
            }
            FailureDecision::Park => {
                self.publisher
                    .publish(DEFAULT_EXCHANGE, PARKING_LOT_QUEUE, &forwarded)
                    .await?;
                warn!(
                    retry_count,
                    retryable,
                    reason,
                    partition_key = ?envelope.partition_key(),
                    "Envelope parked"
                );
            }
        }

        Ok(decision)
    }
}
