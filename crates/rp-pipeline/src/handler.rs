//! Handler provider seam and error classification
//!
//! Business logic lives behind [`ReportingHandler`]. The registry invokes the
//! handler for a request's type and classifies any failure against the
//! [`RetryCatalog`]: errors meaning "the referenced launch or item is not
//! visible yet" are worth retrying, everything else is fatal.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rp_common::RequestType;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::validator::ValidatedRequest;

/// Error codes reported by the handler provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    LaunchNotFound,
    TestItemNotFound,
    ProjectNotFound,
    IncorrectRequest,
    AccessDenied,
    LaunchIsNotFinished,
    FinishTimeEarlierThanStartTime,
    #[serde(other)]
    Unclassified,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::LaunchNotFound => "LAUNCH_NOT_FOUND",
            ErrorType::TestItemNotFound => "TEST_ITEM_NOT_FOUND",
            ErrorType::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorType::IncorrectRequest => "INCORRECT_REQUEST",
            ErrorType::AccessDenied => "ACCESS_DENIED",
            ErrorType::LaunchIsNotFinished => "LAUNCH_IS_NOT_FINISHED",
            ErrorType::FinishTimeEarlierThanStartTime => "FINISH_TIME_EARLIER_THAN_START_TIME",
            ErrorType::Unclassified => "UNCLASSIFIED",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error_type}: {message}")]
pub struct HandlerError {
    pub error_type: ErrorType,
    pub message: String,
}

impl HandlerError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unclassified, message)
    }
}

/// Business logic for one or more request types
#[async_trait]
pub trait ReportingHandler: Send + Sync {
    async fn handle(&self, request: &ValidatedRequest) -> Result<(), HandlerError>;
}

/// The single set of error types that send a message down the retry ladder
#[derive(Debug, Clone)]
pub struct RetryCatalog {
    retryable: HashSet<ErrorType>,
}

impl Default for RetryCatalog {
    fn default() -> Self {
        Self {
            retryable: [ErrorType::LaunchNotFound, ErrorType::TestItemNotFound]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryCatalog {
    pub fn is_retryable(&self, error: &HandlerError) -> bool {
        self.retryable.contains(&error.error_type)
    }
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

/// Request-type to handler lookup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestType, Arc<dyn ReportingHandler>>,
    catalog: RetryCatalog,
}

impl HandlerRegistry {
    pub fn new(catalog: RetryCatalog) -> Self {
        Self {
            handlers: HashMap::new(),
            catalog,
        }
    }

    pub fn register(&mut self, request_type: RequestType, handler: Arc<dyn ReportingHandler>) {
        self.handlers.insert(request_type, handler);
    }

    /// Register one handler for every request type
    pub fn register_all(&mut self, handler: Arc<dyn ReportingHandler>) {
        for request_type in RequestType::ALL {
            self.register(request_type, handler.clone());
        }
    }

    pub fn with_handler(mut self, request_type: RequestType, handler: Arc<dyn ReportingHandler>) -> Self {
        self.register(request_type, handler);
        self
    }

    pub fn catalog(&self) -> &RetryCatalog {
        &self.catalog
    }

    pub async fn invoke(&self, request: &ValidatedRequest) -> HandlerOutcome {
        let request_type = request.request_type();
        let Some(handler) = self.handlers.get(&request_type) else {
            return HandlerOutcome::FatalFailure(format!(
                "No handler registered for {}",
                request_type
            ));
        };

        match handler.handle(request).await {
            Ok(()) => HandlerOutcome::Success,
            Err(e) if self.catalog.is_retryable(&e) => {
                debug!(request_type = %request_type, error = %e, "Retryable handler failure");
                HandlerOutcome::RetryableFailure(e.to_string())
            }
            Err(e) => {
                debug!(request_type = %request_type, error = %e, "Fatal handler failure");
                HandlerOutcome::FatalFailure(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FinishExecutionRq, ReportingRequest, Timestamp};
    use rp_common::ReportingContext;

    struct FailingHandler(HandlerError);

    #[async_trait]
    impl ReportingHandler for FailingHandler {
        async fn handle(&self, _request: &ValidatedRequest) -> Result<(), HandlerError> {
            Err(self.0.clone())
        }
    }

    fn finish_launch() -> ValidatedRequest {
        ValidatedRequest {
            request: ReportingRequest::FinishLaunch(FinishExecutionRq {
                end_time: Timestamp::Millis(1_700_000_000_000),
                status: None,
                description: None,
                attributes: Vec::new(),
            }),
            context: ReportingContext::default(),
        }
    }

    #[test]
    fn test_error_type_parsing() {
        let parsed: ErrorType = serde_json::from_str("\"TEST_ITEM_NOT_FOUND\"").unwrap();
        assert_eq!(parsed, ErrorType::TestItemNotFound);

        let unknown: ErrorType = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(unknown, ErrorType::Unclassified);
    }

    #[test]
    fn test_catalog() {
        let catalog = RetryCatalog::default();
        assert!(catalog.is_retryable(&HandlerError::new(ErrorType::LaunchNotFound, "")));
        assert!(catalog.is_retryable(&HandlerError::new(ErrorType::TestItemNotFound, "")));
        assert!(!catalog.is_retryable(&HandlerError::new(ErrorType::AccessDenied, "")));
        assert!(!catalog.is_retryable(&HandlerError::unclassified("boom")));
    }

    #[tokio::test]
    async fn test_invoke_classifies_failures() {
        let registry = HandlerRegistry::default()
            .with_handler(
                RequestType::FinishLaunch,
                Arc::new(FailingHandler(HandlerError::new(ErrorType::LaunchNotFound, "launch 7"))),
            );

        assert_eq!(
            registry.invoke(&finish_launch()).await,
            HandlerOutcome::RetryableFailure("LAUNCH_NOT_FOUND: launch 7".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_handler_is_fatal() {
        let registry = HandlerRegistry::default();
        assert!(matches!(
            registry.invoke(&finish_launch()).await,
            HandlerOutcome::FatalFailure(_)
        ));
    }
}
