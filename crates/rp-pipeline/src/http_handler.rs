//! HTTP handler provider
//!
//! Sends validated requests to the reporting backend.
//! `POST <base>/v1/reporting/<REQUEST_TYPE>` with the request and its context;
//! error responses carry `{"errorType": "...", "message": "..."}`.

use std::time::Duration;

use async_trait::async_trait;
use rp_common::ReportingContext;
use rp_config::HandlerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::handler::{ErrorType, HandlerError, ReportingHandler};
use crate::request::ReportingRequest;
use crate::validator::ValidatedRequest;
use crate::Result;

/// HTTP handler configuration
#[derive(Debug, Clone)]
pub struct HttpHandlerConfig {
    /// Reporting backend base URL
    pub base_url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpHandlerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8585".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&HandlerConfig> for HttpHandlerConfig {
    fn from(config: &HandlerConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HandlerRequest<'a> {
    context: &'a ReportingContext,
    payload: &'a ReportingRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_type: ErrorType,
    #[serde(default)]
    message: String,
}

pub struct HttpHandler {
    config: HttpHandlerConfig,
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new(config: HttpHandlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self, request: &ValidatedRequest) -> String {
        format!(
            "{}/v1/reporting/{}",
            self.config.base_url.trim_end_matches('/'),
            request.request_type()
        )
    }
}

#[async_trait]
impl ReportingHandler for HttpHandler {
    async fn handle(&self, request: &ValidatedRequest) -> std::result::Result<(), HandlerError> {
        let url = self.url(request);
        let body = HandlerRequest {
            context: &request.context,
            payload: &request.request,
        };
        debug!(%url, "Dispatching reporting request");

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "Reporting backend unreachable");
                return Err(HandlerError::unclassified(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(error) => Err(HandlerError::new(error.error_type, error.message)),
            Err(_) => {
                warn!(%url, status = status.as_u16(), body = %text, "Unrecognised error response");
                Err(HandlerError::unclassified(format!("HTTP {}: {}", status, text)))
            }
        }
    }
}
