#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rp_broker::InMemoryBroker;
use rp_common::{headers, Envelope, RequestType};
use rp_config::IngestConfig;
use rp_pipeline::request::ReportingRequest;
use rp_pipeline::{HandlerError, HandlerRegistry, IngestManager, ReportingHandler, RetryCatalog, ValidatedRequest};

/// Records every LOG request it sees as (launchUuid, message), optionally failing each call
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(String, String)>>,
    failure: Option<HandlerError>,
}

impl RecordingHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failure: None,
        })
    }

    pub fn failing(error: HandlerError) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failure: Some(error),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn messages_for(&self, launch: &str) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|(l, _)| l == launch)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl ReportingHandler for RecordingHandler {
    async fn handle(&self, request: &ValidatedRequest) -> Result<(), HandlerError> {
        if let ReportingRequest::Log(log) = &request.request {
            self.seen.lock().push((
                log.left.launch_uuid.clone(),
                log.left.message.clone().unwrap_or_default(),
            ));
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

pub fn registry(handler: Arc<RecordingHandler>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new(RetryCatalog::default());
    registry.register_all(handler);
    Arc::new(registry)
}

pub fn log_envelope(launch: &str, message: &str) -> Envelope {
    let body = format!(
        r#"{{"left": {{"launchUuid": "{}", "time": 1700000000000, "message": "{}"}}}}"#,
        launch, message
    );
    Envelope::reporting(RequestType::Log, launch, body.into_bytes())
}

pub fn raw_envelope(request_type: &str, launch: &str, body: &str) -> Envelope {
    Envelope::new(body.as_bytes().to_vec())
        .with_header(headers::REQUEST_TYPE, request_type)
        .with_header(headers::HASH_ON, launch)
}

pub fn test_config(queue_count: u32) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.topology.queue_count = queue_count;
    config.reclamation.enabled = false;
    config.consumer.restart_delay_ms = 20;
    config
}

pub fn manager(config: IngestConfig, broker: &InMemoryBroker, handlers: Arc<HandlerRegistry>) -> IngestManager {
    let broker = Arc::new(broker.clone());
    IngestManager::new(config, broker.clone(), broker.clone(), broker, handlers)
}

/// Poll until the condition holds or the timeout elapses
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
