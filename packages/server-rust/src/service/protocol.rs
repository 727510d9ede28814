//! Inbound protocol shapes and the per-protocol message handlers.
//!
//! Both protocols share the call runner; they differ only in how arguments
//! are bound and how the outcome is rendered.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_core::{attachment_keys, Attachments, RemoteInvokeMessage, RemoteResultMessage, Value};

use crate::service::binder::{bind_http, bind_rpc};
use crate::service::entry::{HttpMethod, ServiceEntry};
use crate::service::operation::CallError;
use crate::service::pipeline::{CallRunner, InboundMeta};

/// Header names the gateway maps onto call attachments.
pub mod headers {
    pub const REQUEST_ID: &str = "x-request-id";
    pub const SERVICE_KEY: &str = "x-service-key";
    pub const USER_ID: &str = "x-user-id";
    pub const ROLES: &str = "x-roles";
}

// ---------------------------------------------------------------------------
// HTTP shapes
// ---------------------------------------------------------------------------

/// Transport-neutral view of an inbound HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub caller_address: Option<String>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            caller_address: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// First header value named `name`, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All query values named `name`, ignoring case, in request order.
    #[must_use]
    pub fn query_values(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Attachments derived from well-known headers and the peer address.
    #[must_use]
    pub fn attachments(&self) -> Attachments {
        let mut attachments = Attachments::new();
        for (header, key) in [
            (headers::SERVICE_KEY, attachment_keys::SERVICE_KEY),
            (headers::USER_ID, attachment_keys::USER_ID),
            (headers::ROLES, attachment_keys::ROLES),
        ] {
            if let Some(value) = self.header(header) {
                attachments.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(addr) = &self.caller_address {
            attachments.insert(attachment_keys::CALLER_ADDRESS.to_string(), addr.clone());
        }
        attachments
    }
}

/// Rendered outcome of an HTTP dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl HttpResponse {
    #[must_use]
    pub fn ok(value: &Value) -> Self {
        Self {
            status: 200,
            body: value.to_json(),
        }
    }

    #[must_use]
    pub fn from_error(error: &CallError) -> Self {
        let envelope = error.to_envelope();
        Self {
            status: envelope.status,
            body: serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageReceivedHandler
// ---------------------------------------------------------------------------

/// Handles one inbound message for a resolved entry. One implementation per
/// inbound protocol.
#[async_trait]
pub trait MessageReceivedHandler: Send + Sync {
    type Request: Send;
    type Response: Send;

    async fn handle(&self, runner: &CallRunner, entry: Arc<ServiceEntry>, request: Self::Request) -> Self::Response;
}

/// An HTTP request matched to an entry's route.
#[derive(Debug)]
pub struct HttpCall {
    pub message_id: String,
    pub request: HttpRequest,
    pub path_params: Vec<(String, String)>,
}

/// Binds from the HTTP request and renders an [`HttpResponse`].
#[derive(Debug, Clone, Default)]
pub struct HttpMessageHandler;

#[async_trait]
impl MessageReceivedHandler for HttpMessageHandler {
    type Request = HttpCall;
    type Response = HttpResponse;

    async fn handle(&self, runner: &CallRunner, entry: Arc<ServiceEntry>, call: HttpCall) -> HttpResponse {
        let meta = InboundMeta {
            message_id: call.message_id,
            attachments: call.request.attachments(),
            service_key: None,
        };
        let request = call.request;
        let path_params = call.path_params;
        match runner
            .run(entry, meta, move |entry| bind_http(entry, &request, &path_params))
            .await
        {
            Ok(value) => HttpResponse::ok(&value),
            Err(err) => HttpResponse::from_error(&err),
        }
    }
}

/// A decoded RPC invocation with its correlation id.
#[derive(Debug)]
pub struct RpcCall {
    pub message_id: String,
    pub message: RemoteInvokeMessage,
}

/// Binds positional arguments and renders a [`RemoteResultMessage`].
#[derive(Debug, Clone, Default)]
pub struct RpcMessageHandler;

#[async_trait]
impl MessageReceivedHandler for RpcMessageHandler {
    type Request = RpcCall;
    type Response = RemoteResultMessage;

    async fn handle(&self, runner: &CallRunner, entry: Arc<ServiceEntry>, call: RpcCall) -> RemoteResultMessage {
        let RemoteInvokeMessage {
            service_key,
            parameters,
            attachments,
            ..
        } = call.message;
        let meta = InboundMeta {
            message_id: call.message_id,
            attachments,
            service_key,
        };
        match runner.run(entry, meta, move |entry| bind_rpc(entry, parameters)).await {
            Ok(value) => RemoteResultMessage::ok(value),
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let request = HttpRequest::new(HttpMethod::Get, "/")
            .with_header("X-Service-Key", "shard-1")
            .with_header("X-User-Id", "u-7");
        assert_eq!(request.header("x-service-key"), Some("shard-1"));
        let attachments = request.attachments();
        assert_eq!(attachments.get(attachment_keys::SERVICE_KEY).map(String::as_str), Some("shard-1"));
        assert_eq!(attachments.get(attachment_keys::USER_ID).map(String::as_str), Some("u-7"));
    }

    #[test]
    fn error_response_carries_envelope() {
        let response = HttpResponse::from_error(&CallError::business("sold out"));
        assert_eq!(response.status, 400);
        assert_eq!(response.body["code"], "businessError");
        assert_eq!(response.body["message"], "sold out");
    }
}
