//! RabbitMQ management HTTP API client
//!
//! Implements [`BrokerAdmin`] against `/api/...` endpoints:
//! exchanges, queues, bindings and dynamic shovel parameters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    BindingSpec, BrokerAdmin, BrokerError, ExchangeSpec, QueueInfo, QueueSpec, Result,
    ShovelDeleteAfter, ShovelSpec,
};

/// Management client configuration
#[derive(Debug, Clone)]
pub struct ManagementConfig {
    /// e.g. `http://localhost:15672`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub request_timeout: Duration,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:15672".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ManagementClient {
    config: ManagementConfig,
    client: reqwest::Client,
}

impl ManagementClient {
    pub fn new(config: ManagementConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    pub fn virtual_host(&self) -> &str {
        &self.config.virtual_host
    }

    /// `<base>/api/<segment>/<segment>...` with every segment percent-encoded
    fn url(&self, segments: &[&str]) -> String {
        let mut url = format!("{}/api", self.config.base_url.trim_end_matches('/'));
        for segment in segments {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        url
    }

    /// Shovel endpoint URI for this node and virtual host
    fn local_uri(&self) -> String {
        format!("amqp:///{}", urlencoding::encode(&self.config.virtual_host))
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: String,
        body: Option<Value>,
        allow_not_found: bool,
    ) -> Result<reqwest::Response> {
        debug!(operation, %url, "Management API request");

        let mut request = self
            .client
            .request(method, &url)
            .basic_auth(&self.config.username, Some(&self.config.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(operation, status = status.as_u16(), body = %body, "Management API request failed");
        Err(BrokerError::ManagementStatus {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Properties key RabbitMQ assigns to a binding without arguments
fn binding_properties_key(routing_key: &str) -> &str {
    if routing_key.is_empty() {
        "~"
    } else {
        routing_key
    }
}

#[async_trait]
impl BrokerAdmin for ManagementClient {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let url = self.url(&["exchanges", &self.config.virtual_host, &exchange.name]);
        let body = json!({
            "type": exchange.kind.as_str(),
            "durable": exchange.durable,
            "auto_delete": false,
            "internal": false,
            "arguments": exchange.arguments,
        });
        self.send("declare_exchange", Method::PUT, url, Some(body), false).await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let url = self.url(&["queues", &self.config.virtual_host, &queue.name]);
        let body = json!({
            "durable": queue.durable,
            "auto_delete": false,
            "arguments": queue.arguments(),
        });
        self.send("declare_queue", Method::PUT, url, Some(body), false).await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let url = self.url(&[
            "bindings",
            &self.config.virtual_host,
            "e",
            &binding.exchange,
            "q",
            &binding.queue,
        ]);
        let body = json!({
            "routing_key": binding.routing_key,
            "arguments": {},
        });
        self.send("bind_queue", Method::POST, url, Some(body), false).await?;
        Ok(())
    }

    async fn unbind_queue(&self, binding: &BindingSpec) -> Result<()> {
        let url = self.url(&[
            "bindings",
            &self.config.virtual_host,
            "e",
            &binding.exchange,
            "q",
            &binding.queue,
            binding_properties_key(&binding.routing_key),
        ]);
        self.send("unbind_queue", Method::DELETE, url, None, true).await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let url = self.url(&["queues", &self.config.virtual_host, name]);
        self.send("delete_queue", Method::DELETE, url, None, true).await?;
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        let url = format!(
            "{}?columns=name,consumers,messages_ready",
            self.url(&["queues", &self.config.virtual_host])
        );
        let response = self.send("list_queues", Method::GET, url, None, false).await?;
        let queues = response.json::<Vec<QueueInfo>>().await?;
        Ok(queues)
    }

    async fn declare_shovel(&self, shovel: &ShovelSpec) -> Result<()> {
        let url = self.url(&["parameters", "shovel", &self.config.virtual_host, &shovel.name]);
        let mut value = json!({
            "src-protocol": "amqp091",
            "src-uri": self.local_uri(),
            "src-queue": shovel.source_queue,
            "dest-protocol": "amqp091",
            "dest-uri": self.local_uri(),
            "dest-exchange": shovel.destination_exchange,
            "dest-exchange-key": shovel.destination_routing_key,
            "ack-mode": "on-confirm",
        });
        if shovel.delete_after == ShovelDeleteAfter::QueueLength {
            value["src-delete-after"] = json!("queue-length");
        }
        self.send("declare_shovel", Method::PUT, url, Some(json!({ "value": value })), false)
            .await?;
        Ok(())
    }

    async fn delete_shovel(&self, name: &str) -> Result<()> {
        let url = self.url(&["parameters", "shovel", &self.config.virtual_host, name]);
        self.send("delete_shovel", Method::DELETE, url, None, true).await?;
        Ok(())
    }
}
