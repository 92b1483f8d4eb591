//! Broker Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Management API returned {status} for {operation}: {body}")]
    ManagementStatus {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[error("No broker address reachable: {0}")]
    Unreachable(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue {0} already has an exclusive consumer")]
    ExclusiveConsumer(String),

    #[error("Publish of {exchange}/{routing_key} was not confirmed by the broker")]
    NotConfirmed { exchange: String, routing_key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Amqp(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
