//! Typed reporting requests
//!
//! Payload shapes for each request type. Field names follow the producers'
//! camelCase JSON.

use chrono::{DateTime, TimeZone, Utc};
use rp_common::RequestType;
use serde::{Deserialize, Serialize};

/// Point in time as producers send it: RFC 3339 text or epoch milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

impl Timestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Millis(millis) => Utc.timestamp_millis_opt(*millis).single(),
            Timestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAttribute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub value: String,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchMode {
    Default,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestItemType {
    Suite,
    Story,
    Test,
    Scenario,
    Step,
    BeforeClass,
    BeforeGroups,
    BeforeMethod,
    BeforeSuite,
    BeforeTest,
    AfterClass,
    AfterGroups,
    AfterMethod,
    AfterSuite,
    AfterTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Stopped,
    Skipped,
    Interrupted,
    Cancelled,
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartLaunchRq {
    pub name: String,
    pub start_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<LaunchMode>,
    #[serde(default)]
    pub rerun: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerun_of: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
}

/// Finishes a launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishExecutionRq {
    pub end_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTestItemRq {
    pub name: String,
    pub start_time: Timestamp,
    #[serde(rename = "type")]
    pub item_type: TestItemType,
    pub launch_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterResource>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
    #[serde(default = "default_true")]
    pub has_stats: bool,
    #[serde(default)]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub issue_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub auto_analyzed: bool,
    #[serde(default)]
    pub ignore_analyzer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishTestItemRq {
    pub end_time: Timestamp,
    pub launch_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ItemAttribute>,
    #[serde(default)]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveLogRq {
    pub launch_uuid: String,
    pub time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<LogFile>,
}

/// Where an attachment already uploaded by the producer is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDataMetaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Log entry and its optional attachment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRq {
    pub left: SaveLogRq,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<BinaryDataMetaInfo>,
}

/// A deserialized reporting payload, one variant per request type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReportingRequest {
    StartLaunch(StartLaunchRq),
    FinishLaunch(FinishExecutionRq),
    StartTest(StartTestItemRq),
    FinishTest(FinishTestItemRq),
    Log(LogRq),
}

impl ReportingRequest {
    /// Deserialize a body as the payload of the given request type
    pub fn from_slice(request_type: RequestType, body: &[u8]) -> serde_json::Result<Self> {
        Ok(match request_type {
            RequestType::StartLaunch => ReportingRequest::StartLaunch(serde_json::from_slice(body)?),
            RequestType::FinishLaunch => ReportingRequest::FinishLaunch(serde_json::from_slice(body)?),
            RequestType::StartTest => ReportingRequest::StartTest(serde_json::from_slice(body)?),
            RequestType::FinishTest => ReportingRequest::FinishTest(serde_json::from_slice(body)?),
            RequestType::Log => ReportingRequest::Log(serde_json::from_slice(body)?),
        })
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            ReportingRequest::StartLaunch(_) => RequestType::StartLaunch,
            ReportingRequest::FinishLaunch(_) => RequestType::FinishLaunch,
            ReportingRequest::StartTest(_) => RequestType::StartTest,
            ReportingRequest::FinishTest(_) => RequestType::FinishTest,
            ReportingRequest::Log(_) => RequestType::Log,
        }
    }
}
