//! Message Validator
//!
//! Turns an envelope into a [`ValidatedRequest`] or explains why it cannot be
//! processed. Anything rejected here is malformed input: the consumer drops it
//! without retrying or parking.

use rp_common::{headers, Envelope, ReportingContext, RequestType};
use thiserror::Error;

use crate::request::{
    FinishExecutionRq, FinishTestItemRq, ItemAttribute, LogRq, ReportingRequest, StartLaunchRq,
    StartTestItemRq, Timestamp,
};

const MAX_LAUNCH_NAME_LENGTH: usize = 256;
const MAX_ITEM_NAME_LENGTH: usize = 1024;
const MAX_ATTRIBUTE_LENGTH: usize = 512;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing {} header", headers::REQUEST_TYPE)]
    MissingRequestType,

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("Malformed {request_type} payload: {source}")]
    Malformed {
        request_type: RequestType,
        #[source]
        source: serde_json::Error,
    },

    #[error("{request_type} requires the {header} header")]
    MissingHeader {
        request_type: RequestType,
        header: &'static str,
    },

    #[error("Invalid {request_type} request: {}", .violations.join("; "))]
    Constraints {
        request_type: RequestType,
        violations: Vec<String>,
    },
}

/// A request that passed validation, with the context it was sent in
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub request: ReportingRequest,
    pub context: ReportingContext,
}

impl ValidatedRequest {
    pub fn request_type(&self) -> RequestType {
        self.request.request_type()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, envelope: &Envelope) -> Result<ValidatedRequest, ValidationError> {
        let tag = envelope
            .request_type_tag()
            .ok_or(ValidationError::MissingRequestType)?;
        let request_type: RequestType = tag
            .parse()
            .map_err(|_| ValidationError::UnknownRequestType(tag.to_string()))?;

        let context = envelope.context();
        for &header in required_headers(request_type) {
            let present = match header {
                headers::USERNAME => context.username.is_some(),
                headers::LAUNCH_ID => context.launch_id.is_some(),
                headers::ITEM_ID => context.item_id.is_some(),
                _ => envelope.header(header).is_some(),
            };
            if !present {
                return Err(ValidationError::MissingHeader {
                    request_type,
                    header,
                });
            }
        }

        let request = ReportingRequest::from_slice(request_type, &envelope.body)
            .map_err(|source| ValidationError::Malformed {
                request_type,
                source,
            })?;

        let mut violations = Violations::default();
        match &request {
            ReportingRequest::StartLaunch(rq) => check_start_launch(rq, &mut violations),
            ReportingRequest::FinishLaunch(rq) => check_finish_launch(rq, &mut violations),
            ReportingRequest::StartTest(rq) => check_start_test(rq, &mut violations),
            ReportingRequest::FinishTest(rq) => check_finish_test(rq, &mut violations),
            ReportingRequest::Log(rq) => check_log(rq, &mut violations),
        }
        if !violations.0.is_empty() {
            return Err(ValidationError::Constraints {
                request_type,
                violations: violations.0,
            });
        }

        Ok(ValidatedRequest { request, context })
    }
}

fn required_headers(request_type: RequestType) -> &'static [&'static str] {
    match request_type {
        RequestType::StartLaunch | RequestType::StartTest => &[headers::USERNAME],
        RequestType::FinishLaunch => &[headers::USERNAME, headers::LAUNCH_ID],
        RequestType::FinishTest => &[headers::USERNAME, headers::ITEM_ID],
        RequestType::Log => &[],
    }
}

#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn not_blank(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.0.push(format!("{} must not be blank", field));
        }
    }

    fn max_length(&mut self, field: &str, value: &str, max: usize) {
        if value.chars().count() > max {
            self.0.push(format!("{} must be at most {} characters", field, max));
        }
    }

    fn timestamp(&mut self, field: &str, value: &Timestamp) {
        if value.to_datetime().is_none() {
            self.0.push(format!("{} is not a valid timestamp", field));
        }
    }

    fn attributes(&mut self, attributes: &[ItemAttribute]) {
        for (index, attribute) in attributes.iter().enumerate() {
            let field = format!("attributes[{}]", index);
            self.not_blank(&format!("{}.value", field), &attribute.value);
            self.max_length(&format!("{}.value", field), &attribute.value, MAX_ATTRIBUTE_LENGTH);
            if let Some(ref key) = attribute.key {
                self.max_length(&format!("{}.key", field), key, MAX_ATTRIBUTE_LENGTH);
            }
        }
    }
}

fn check_start_launch(rq: &StartLaunchRq, v: &mut Violations) {
    v.not_blank("name", &rq.name);
    v.max_length("name", &rq.name, MAX_LAUNCH_NAME_LENGTH);
    v.timestamp("startTime", &rq.start_time);
    v.attributes(&rq.attributes);
}

fn check_finish_launch(rq: &FinishExecutionRq, v: &mut Violations) {
    v.timestamp("endTime", &rq.end_time);
    v.attributes(&rq.attributes);
}

fn check_start_test(rq: &StartTestItemRq, v: &mut Violations) {
    v.not_blank("name", &rq.name);
    v.max_length("name", &rq.name, MAX_ITEM_NAME_LENGTH);
    v.timestamp("startTime", &rq.start_time);
    v.not_blank("launchUuid", &rq.launch_uuid);
    v.attributes(&rq.attributes);
}

fn check_finish_test(rq: &FinishTestItemRq, v: &mut Violations) {
    v.timestamp("endTime", &rq.end_time);
    v.not_blank("launchUuid", &rq.launch_uuid);
    v.attributes(&rq.attributes);
}

fn check_log(rq: &LogRq, v: &mut Violations) {
    v.not_blank("launchUuid", &rq.left.launch_uuid);
    v.timestamp("time", &rq.left.time);
    if let Some(ref file) = rq.left.file {
        v.not_blank("file.name", &file.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(request_type: &str, body: &str) -> Envelope {
        Envelope::new(body.as_bytes().to_vec())
            .with_header(headers::REQUEST_TYPE, request_type)
            .with_header(headers::HASH_ON, "launch-1")
            .with_header(headers::USERNAME, "default")
    }

    #[test]
    fn test_valid_start_launch() {
        let validated = MessageValidator::new()
            .validate(&envelope(
                "START_LAUNCH",
                r#"{"name": "nightly", "startTime": "2024-03-01T10:00:00Z"}"#,
            ))
            .unwrap();

        assert_eq!(validated.request_type(), RequestType::StartLaunch);
        assert_eq!(validated.context.username.as_deref(), Some("default"));
    }

    #[test]
    fn test_missing_request_type() {
        let envelope = Envelope::new(b"{}".to_vec());
        assert!(matches!(
            MessageValidator::new().validate(&envelope),
            Err(ValidationError::MissingRequestType)
        ));
    }

    #[test]
    fn test_unknown_request_type() {
        assert!(matches!(
            MessageValidator::new().validate(&envelope("DELETE_LAUNCH", "{}")),
            Err(ValidationError::UnknownRequestType(tag)) if tag == "DELETE_LAUNCH"
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            MessageValidator::new().validate(&envelope("START_LAUNCH", "{not json")),
            Err(ValidationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_blank_name_violates_constraints() {
        let result = MessageValidator::new().validate(&envelope(
            "START_LAUNCH",
            r#"{"name": "  ", "startTime": 1700000000000, "attributes": [{"value": ""}]}"#,
        ));

        match result {
            Err(ValidationError::Constraints { violations, .. }) => {
                assert_eq!(violations.len(), 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_launch_name_length_limit() {
        let name = "x".repeat(MAX_LAUNCH_NAME_LENGTH + 1);
        let body = format!(r#"{{"name": "{}", "startTime": 1700000000000}}"#, name);
        assert!(matches!(
            MessageValidator::new().validate(&envelope("START_LAUNCH", &body)),
            Err(ValidationError::Constraints { .. })
        ));
    }

    #[test]
    fn test_finish_test_requires_item_id() {
        let result = MessageValidator::new().validate(&envelope(
            "FINISH_TEST",
            r#"{"endTime": 1700000000000, "launchUuid": "l-1"}"#,
        ));
        assert!(matches!(
            result,
            Err(ValidationError::MissingHeader { header: headers::ITEM_ID, .. })
        ));
    }

    #[test]
    fn test_finish_test_with_item_id() {
        let envelope = envelope("FINISH_TEST", r#"{"endTime": 1700000000000, "launchUuid": "l-1", "status": "PASSED"}"#)
            .with_header(headers::ITEM_ID, "item-9");
        assert!(MessageValidator::new().validate(&envelope).is_ok());
    }

    #[test]
    fn test_log_needs_no_username() {
        let envelope = Envelope::new(
            br#"{"left": {"launchUuid": "l-1", "time": 1700000000000, "file": {"name": "shot.png"}}}"#.to_vec(),
        )
        .with_header(headers::REQUEST_TYPE, "LOG");
        assert!(MessageValidator::new().validate(&envelope).is_ok());
    }

    #[test]
    fn test_request_type_is_case_insensitive() {
        let validated = MessageValidator::new()
            .validate(&envelope("start_launch", r#"{"name": "n", "startTime": 1}"#))
            .unwrap();
        assert_eq!(validated.request_type(), RequestType::StartLaunch);
    }
}
