//! Reporting Ingestion Pipeline
//!
//! This crate provides the broker-driven ingestion core with:
//! - TopologyProvisioner: instance-scoped partition queues, retry tiers and parking lot
//! - MessageValidator: typed, constraint-checked reporting requests
//! - HandlerRegistry: request-type dispatch with error classification
//! - ErrorRouter: three-tier retry ladder and poison-message parking
//! - ConsumerPool: one exclusive, prefetch-bounded consumer per partition queue
//! - IdleQueueReclaimer: retires partition queues orphaned by dead instances
//! - ShutdownCoordinator: removes this instance's bindings and queues on exit
//! - Lifecycle: background reclamation schedule
//! - IngestManager: wires the above in start/shutdown order
//! - HttpHandler: handler provider over the reporting backend's HTTP API

pub mod error;
pub mod topology;
pub mod request;
pub mod validator;
pub mod handler;
pub mod retry;
pub mod processor;
pub mod consumer;
pub mod reclamation;
pub mod shutdown;
pub mod lifecycle;
pub mod manager;
pub mod http_handler;

pub use error::PipelineError;
pub use topology::{NodeIdentity, TopologyHandle, TopologyProvisioner};
pub use request::ReportingRequest;
pub use validator::{MessageValidator, ValidatedRequest, ValidationError};
pub use handler::{ErrorType, HandlerError, HandlerOutcome, HandlerRegistry, ReportingHandler, RetryCatalog};
pub use retry::{ErrorRouter, FailureDecision, RetryPolicy};
pub use processor::{MessageProcessor, ProcessingOutcome};
pub use consumer::{ConsumerPool, ConsumerPoolConfig};
pub use reclamation::{IdleQueueReclaimer, ReclamationReport};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use manager::{IngestManager, PipelineHealth};
pub use http_handler::{HttpHandler, HttpHandlerConfig};

pub type Result<T> = std::result::Result<T, PipelineError>;
