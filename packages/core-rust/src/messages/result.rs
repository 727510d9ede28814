//! Result envelope, status codes and the error envelope returned to callers.

use serde::{Deserialize, Serialize};

use super::invoke::Attachments;
use crate::types::Value;

/// Outcome classification carried by every [`RemoteResultMessage`].
///
/// Business failures travel as a result with an error status rather than as
/// a transport failure, so callers can tell infrastructure faults apart from
/// handler-reported ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultStatus {
    Ok,
    BindingError,
    ValidationError,
    BusinessError,
    Unauthorized,
    NotFound,
    Timeout,
    TransportError,
    Overloaded,
    InternalError,
}

impl ResultStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == ResultStatus::Ok
    }

    /// Wire name, as serialized.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::BindingError => "bindingError",
            ResultStatus::ValidationError => "validationError",
            ResultStatus::BusinessError => "businessError",
            ResultStatus::Unauthorized => "unauthorized",
            ResultStatus::NotFound => "notFound",
            ResultStatus::Timeout => "timeout",
            ResultStatus::TransportError => "transportError",
            ResultStatus::Overloaded => "overloaded",
            ResultStatus::InternalError => "internalError",
        }
    }

    /// HTTP status code used by the gateway for this outcome.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            ResultStatus::Ok => 200,
            ResultStatus::BindingError
            | ResultStatus::ValidationError
            | ResultStatus::BusinessError => 400,
            ResultStatus::Unauthorized => 401,
            ResultStatus::NotFound => 404,
            ResultStatus::Overloaded => 503,
            ResultStatus::TransportError => 502,
            ResultStatus::Timeout => 504,
            ResultStatus::InternalError => 500,
        }
    }
}

/// One failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// Name of the offending parameter or property.
    pub member: String,
    pub message: String,
}

/// Error detail returned to callers on handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Numeric status (HTTP-compatible).
    pub status: u16,
    pub code: ResultStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validation_errors: Vec<ValidationError>,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(code: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            status: code.http_status(),
            code,
            message: message.into(),
            validation_errors: Vec::new(),
        }
    }
}

/// Result of one remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResultMessage {
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorEnvelope>,
    #[serde(default)]
    pub attachments: Attachments,
}

impl RemoteResultMessage {
    /// A successful result. `Value::Null` results are sent as `None`.
    #[must_use]
    pub fn ok(value: Value) -> Self {
        Self {
            status: ResultStatus::Ok,
            result: (!value.is_null()).then_some(value),
            error: None,
            attachments: Attachments::new(),
        }
    }

    /// A failed result carrying `envelope`.
    #[must_use]
    pub fn error(envelope: ErrorEnvelope) -> Self {
        Self {
            status: envelope.code,
            result: None,
            error: Some(envelope),
            attachments: Attachments::new(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Human-readable error message, or an empty string for successes.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map_or("", |e| e.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_omits_null_payload() {
        let result = RemoteResultMessage::ok(Value::Null);
        assert!(result.is_ok());
        assert!(result.result.is_none());
        assert_eq!(result.error_message(), "");
    }

    #[test]
    fn error_result_takes_status_from_envelope() {
        let result = RemoteResultMessage::error(ErrorEnvelope::new(
            ResultStatus::BusinessError,
            "insufficient stock",
        ));
        assert_eq!(result.status, ResultStatus::BusinessError);
        assert!(!result.is_ok());
        assert_eq!(result.error_message(), "insufficient stock");
        assert_eq!(result.error.map(|e| e.status), Some(400));
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ResultStatus::Ok.http_status(), 200);
        assert_eq!(ResultStatus::Unauthorized.http_status(), 401);
        assert_eq!(ResultStatus::NotFound.http_status(), 404);
        assert_eq!(ResultStatus::Timeout.http_status(), 504);
        assert_eq!(ResultStatus::InternalError.http_status(), 500);
    }

    #[test]
    fn status_name_matches_serialized_form() {
        for status in [
            ResultStatus::Ok,
            ResultStatus::BindingError,
            ResultStatus::Overloaded,
            ResultStatus::TransportError,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
    }

    #[test]
    fn envelope_skips_empty_validation_errors() {
        let envelope = ErrorEnvelope::new(ResultStatus::InternalError, "boom");
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert!(json.get("validationErrors").is_none());
        assert_eq!(json["code"], "internalError");
    }
}
