//! Per-delivery processing: validate, dispatch, settle
//!
//! Every delivery is settled exactly once. It is acknowledged on success,
//! after a malformed payload is dropped, and after a failure has been handed
//! to the retry ladder. It is rejected (dead-lettered by the broker) only when
//! that hand-off itself fails.

use std::sync::Arc;

use metrics::counter;
use rp_broker::Delivery;
use rp_common::RetryTier;
use tracing::{debug, error, warn};

use crate::handler::{HandlerOutcome, HandlerRegistry};
use crate::retry::{ErrorRouter, FailureDecision};
use crate::validator::MessageValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Handled,
    /// Malformed input, acknowledged and discarded
    Dropped,
    Retried { tier: RetryTier, retry_count: u32 },
    Parked,
    /// Forwarding failed; rejected to the broker's dead-letter route
    Rejected,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Handled => "handled",
            ProcessingOutcome::Dropped => "dropped",
            ProcessingOutcome::Retried { .. } => "retried",
            ProcessingOutcome::Parked => "parked",
            ProcessingOutcome::Rejected => "rejected",
        }
    }
}

pub struct MessageProcessor {
    validator: MessageValidator,
    handlers: Arc<HandlerRegistry>,
    errors: ErrorRouter,
}

impl MessageProcessor {
    pub fn new(handlers: Arc<HandlerRegistry>, errors: ErrorRouter) -> Self {
        Self {
            validator: MessageValidator::new(),
            handlers,
            errors,
        }
    }

    pub async fn process(&self, delivery: Delivery) -> ProcessingOutcome {
        let outcome = self.process_inner(delivery).await;
        counter!("rp_envelopes_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn process_inner(&self, delivery: Delivery) -> ProcessingOutcome {
        let validated = match self.validator.validate(&delivery.envelope) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(queue = %delivery.queue, error = %e, "Dropping invalid envelope");
                settle_ack(delivery).await;
                return ProcessingOutcome::Dropped;
            }
        };

        let (retryable, reason) = match self.handlers.invoke(&validated).await {
            HandlerOutcome::Success => {
                debug!(queue = %delivery.queue, request_type = %validated.request_type(), "Envelope handled");
                settle_ack(delivery).await;
                return ProcessingOutcome::Handled;
            }
            HandlerOutcome::RetryableFailure(reason) => (true, reason),
            HandlerOutcome::FatalFailure(reason) => (false, reason),
        };

        match self.errors.route(&delivery.envelope, retryable, &reason).await {
            Ok(decision) => {
                settle_ack(delivery).await;
                match decision {
                    FailureDecision::Retry { tier, retry_count } => {
                        ProcessingOutcome::Retried { tier, retry_count }
                    }
                    FailureDecision::Park => ProcessingOutcome::Parked,
                }
            }
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    error = %e,
                    "Failed to forward envelope, rejecting to dead-letter route"
                );
                let queue = delivery.queue.clone();
                if let Err(e) = delivery.reject().await {
                    error!(queue = %queue, error = %e, "Failed to reject delivery");
                }
                ProcessingOutcome::Rejected
            }
        }
    }
}

async fn settle_ack(delivery: Delivery) {
    let queue = delivery.queue.clone();
    if let Err(e) = delivery.ack().await {
        warn!(queue = %queue, error = %e, "Failed to acknowledge delivery");
    }
}
