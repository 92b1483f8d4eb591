//! Pipeline Error Types

use rp_broker::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Topology provisioning failed while declaring {target}: {source}")]
    Provisioning {
        target: String,
        #[source]
        source: BrokerError,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] rp_config::ConfigError),

    #[error("Ingest pipeline is already running")]
    AlreadyRunning,
}
