//! Invocation and error types flowing through the dispatch middleware stack.

use std::sync::Arc;

use meridian_core::{Attachments, CacheKeyFragment, ErrorEnvelope, RemoteResultMessage, ResultStatus, ValidationError, Value};

use crate::service::binder::BindingError;
use crate::service::entry::ServiceEntry;

/// One handler execution, after binding, as seen by the tower middleware.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub entry: Arc<ServiceEntry>,
    /// Correlation id of the inbound message (or HTTP request id).
    pub message_id: String,
    /// Bound arguments in declared parameter order.
    pub args: Vec<Value>,
    pub cache_keys: Vec<CacheKeyFragment>,
    pub service_key: Option<String>,
    pub attachments: Attachments,
    pub caller_address: Option<String>,
    /// Execution budget for this call, in milliseconds.
    pub timeout_ms: u64,
}

impl Invocation {
    /// Returns an attachment value by key.
    #[must_use]
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    /// Renders one of the entry's cache-key templates with this call's fragments.
    #[must_use]
    pub fn cache_key(&self, template: &str) -> String {
        meridian_core::render_cache_key(template, &self.cache_keys)
    }
}

/// Errors produced while dispatching or executing a call.
///
/// The first four variants are "friendly": they describe a problem with the
/// request or a business rule and are returned to callers verbatim. The rest
/// are unexpected faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        errors: Vec<ValidationError>,
    },
    #[error("{message}")]
    Business { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("no service entry for {target}")]
    NotFound { target: String },
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        CallError::Internal {
            message: format!("{err:#}"),
        }
    }
}

impl CallError {
    #[must_use]
    pub fn business(message: impl Into<String>) -> Self {
        CallError::Business {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        CallError::Internal {
            message: message.into(),
        }
    }

    /// Result status this error is reported with.
    #[must_use]
    pub fn status(&self) -> ResultStatus {
        match self {
            CallError::Binding(_) => ResultStatus::BindingError,
            CallError::Validation { .. } => ResultStatus::ValidationError,
            CallError::Business { .. } => ResultStatus::BusinessError,
            CallError::Unauthorized { .. } => ResultStatus::Unauthorized,
            CallError::NotFound { .. } => ResultStatus::NotFound,
            CallError::Timeout { .. } => ResultStatus::Timeout,
            CallError::Transport { .. } => ResultStatus::TransportError,
            CallError::Overloaded => ResultStatus::Overloaded,
            CallError::Internal { .. } => ResultStatus::InternalError,
        }
    }

    /// Friendly errors are expected outcomes of a well-formed system.
    #[must_use]
    pub fn is_friendly(&self) -> bool {
        matches!(
            self,
            CallError::Binding(_)
                | CallError::Validation { .. }
                | CallError::Business { .. }
                | CallError::Unauthorized { .. }
        )
    }

    #[must_use]
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let mut envelope = ErrorEnvelope::new(self.status(), self.to_string());
        match self {
            CallError::Validation { errors, .. } => envelope.validation_errors.clone_from(errors),
            CallError::Binding(binding) => {
                envelope.validation_errors = vec![ValidationError {
                    member: binding.member().to_string(),
                    message: binding.to_string(),
                }];
            }
            _ => {}
        }
        envelope
    }

    /// Rebuilds the error a remote peer reported in `result`.
    ///
    /// Remote binding errors lose their structure and come back as
    /// validation errors carrying the same members.
    #[must_use]
    pub fn from_remote(result: &RemoteResultMessage) -> Self {
        let message = result.error_message().to_string();
        let validation = result
            .error
            .as_ref()
            .map(|e| e.validation_errors.clone())
            .unwrap_or_default();
        match result.status {
            ResultStatus::BindingError | ResultStatus::ValidationError => CallError::Validation {
                message,
                errors: validation,
            },
            ResultStatus::BusinessError => CallError::Business { message },
            ResultStatus::Unauthorized => CallError::Unauthorized { message },
            ResultStatus::NotFound => CallError::NotFound { target: message },
            ResultStatus::Timeout => CallError::Timeout { timeout_ms: 0 },
            ResultStatus::TransportError => CallError::Transport { message },
            ResultStatus::Overloaded => CallError::Overloaded,
            ResultStatus::Ok | ResultStatus::InternalError => CallError::Internal { message },
        }
    }
}

impl From<CallError> for RemoteResultMessage {
    fn from(err: CallError) -> Self {
        RemoteResultMessage::error(err.to_envelope())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
