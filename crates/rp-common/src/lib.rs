use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Header Names
// ============================================================================

/// Wire names of the envelope headers.
pub mod headers {
    /// Partition key read by the consistent-hash exchange
    pub const HASH_ON: &str = "hash-on";
    pub const REQUEST_TYPE: &str = "requestType";
    pub const USERNAME: &str = "username";
    pub const PROJECT_KEY: &str = "projectKey";
    pub const PROJECT_ID: &str = "projectId";
    pub const LAUNCH_ID: &str = "launchId";
    pub const ITEM_ID: &str = "itemId";
    pub const PARENT_ITEM_ID: &str = "parentItemId";
    pub const BASE_URL: &str = "baseUrl";
    pub const LIMIT: &str = "limit";
    /// Populated by the broker whenever it dead-letters a message
    pub const X_DEATH: &str = "x-death";
    pub const RETRY_COUNT: &str = "x-retry-count";
    pub const EXCEPTION: &str = "exception";
}

// ============================================================================
// Header Values
// ============================================================================

/// A typed header value. Unknown headers survive a round trip through the
/// pipeline unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<HeaderValue>),
    Table(BTreeMap<String, HeaderValue>),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String form for identifiers that producers send either as text or as numbers
    pub fn to_text(&self) -> Option<String> {
        match self {
            HeaderValue::Str(s) => Some(s.clone()),
            HeaderValue::Int(i) => Some(i.to_string()),
            HeaderValue::Bool(b) => Some(b.to_string()),
            HeaderValue::Float(f) => Some(f.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

// ============================================================================
// Envelope
// ============================================================================

/// The wire-level unit that flows through the pipeline.
///
/// An envelope is moved between queues, never duplicated: retries and parking
/// republish the same body and headers with only `x-retry-count` and
/// `exception` updated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl Envelope {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Envelope as a producer emits it: request type and partition key set,
    /// retry count at zero.
    pub fn reporting(
        request_type: RequestType,
        partition_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(body)
            .with_header(headers::REQUEST_TYPE, request_type.as_str())
            .with_header(headers::HASH_ON, partition_key.into())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn partition_key(&self) -> Option<String> {
        self.header(headers::HASH_ON).and_then(HeaderValue::to_text)
    }

    /// Raw request type tag, as sent by the producer
    pub fn request_type_tag(&self) -> Option<&str> {
        self.header(headers::REQUEST_TYPE).and_then(HeaderValue::as_str)
    }

    /// Number of retries already spent. Missing or negative values count as zero.
    pub fn retry_count(&self) -> u32 {
        self.header(headers::RETRY_COUNT)
            .and_then(HeaderValue::as_i64)
            .map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.headers
            .insert(headers::RETRY_COUNT.to_string(), HeaderValue::from(count));
    }

    pub fn exception(&self) -> Option<&str> {
        self.header(headers::EXCEPTION).and_then(HeaderValue::as_str)
    }

    pub fn set_exception(&mut self, description: impl Into<String>) {
        self.headers.insert(
            headers::EXCEPTION.to_string(),
            HeaderValue::Str(description.into()),
        );
    }

    /// Total dead-letter count recorded by the broker in `x-death`
    pub fn death_count(&self) -> i64 {
        match self.header(headers::X_DEATH) {
            Some(HeaderValue::Array(entries)) => entries
                .iter()
                .filter_map(|entry| match entry {
                    HeaderValue::Table(table) => table.get("count").and_then(HeaderValue::as_i64),
                    _ => None,
                })
                .sum(),
            _ => 0,
        }
    }

    pub fn context(&self) -> ReportingContext {
        let text = |name: &str| self.header(name).and_then(HeaderValue::to_text);
        let number = |name: &str| self.header(name).and_then(HeaderValue::as_i64);

        ReportingContext {
            username: text(headers::USERNAME),
            project_key: text(headers::PROJECT_KEY),
            project_id: number(headers::PROJECT_ID),
            launch_id: text(headers::LAUNCH_ID),
            item_id: text(headers::ITEM_ID),
            parent_item_id: text(headers::PARENT_ITEM_ID),
            base_url: text(headers::BASE_URL),
            limit: number(headers::LIMIT),
        }
    }
}

/// Pass-through request context carried in envelope headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

// ============================================================================
// Request Types
// ============================================================================

/// Request-type tag selecting the handler for an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    StartLaunch,
    FinishLaunch,
    StartTest,
    FinishTest,
    Log,
}

impl RequestType {
    pub const ALL: [RequestType; 5] = [
        RequestType::StartLaunch,
        RequestType::FinishLaunch,
        RequestType::StartTest,
        RequestType::FinishTest,
        RequestType::Log,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::StartLaunch => "START_LAUNCH",
            RequestType::FinishLaunch => "FINISH_LAUNCH",
            RequestType::StartTest => "START_TEST",
            RequestType::FinishTest => "FINISH_TEST",
            RequestType::Log => "LOG",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        RequestType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CommonError::UnknownRequestType(s.to_string()))
    }
}

// ============================================================================
// Retry Tiers
// ============================================================================

/// TTL bucket of the retry ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryTier {
    Fast,
    Medium,
    Slow,
}

/// Highest retry count still served by the fast tier
pub const FAST_TIER_MAX_RETRY: u32 = 5;
/// Highest retry count still served by the medium tier
pub const MEDIUM_TIER_MAX_RETRY: u32 = 10;

impl RetryTier {
    pub const ALL: [RetryTier; 3] = [RetryTier::Fast, RetryTier::Medium, RetryTier::Slow];

    /// Tier for a post-increment retry count
    pub fn for_retry_count(retry_count: u32) -> Self {
        match retry_count {
            0..=FAST_TIER_MAX_RETRY => RetryTier::Fast,
            n if n <= MEDIUM_TIER_MAX_RETRY => RetryTier::Medium,
            _ => RetryTier::Slow,
        }
    }

    /// Routing key on the retry exchange
    pub fn name(&self) -> &'static str {
        match self {
            RetryTier::Fast => "fast",
            RetryTier::Medium => "medium",
            RetryTier::Slow => "slow",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            RetryTier::Fast => Duration::from_secs(10),
            RetryTier::Medium => Duration::from_secs(60),
            RetryTier::Slow => Duration::from_secs(300),
        }
    }
}

impl fmt::Display for RetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
