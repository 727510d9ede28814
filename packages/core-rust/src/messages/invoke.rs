//! Request envelope for one remote call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Key/value side channel propagated alongside a call.
///
/// `BTreeMap` keeps serialization order deterministic.
pub type Attachments = BTreeMap<String, String>;

/// Well-known attachment keys.
pub mod attachment_keys {
    /// Shard / tenant discriminator selecting a handler instance.
    pub const SERVICE_KEY: &str = "serviceKey";
    /// Global TCC transaction id.
    pub const TRANS_ID: &str = "transId";
    /// Participant id within a TCC transaction.
    pub const PARTICIPANT_ID: &str = "participantId";
    /// TCC phase of the call: `try`, `confirm` or `cancel`.
    pub const TCC_PHASE: &str = "tccPhase";
    /// Address of the original caller, for handle monitoring.
    pub const CALLER_ADDRESS: &str = "callerAddress";
    /// Authenticated user id, set by the gateway's authentication layer.
    pub const USER_ID: &str = "userId";
    /// Comma-separated roles of the authenticated user.
    pub const ROLES: &str = "roles";
}

/// One invocation of a service entry.
///
/// The message id is not part of the envelope: it travels in the enclosing
/// [`TransportMessage`](super::TransportMessage) so that retries of the same
/// logical call can reuse it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInvokeMessage {
    /// Stable id of the target service entry.
    pub service_entry_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub service_key: Option<String>,
    /// Ordered argument values matching the handler signature.
    #[serde(default)]
    pub parameters: Vec<Value>,
    #[serde(default)]
    pub attachments: Attachments,
}

impl RemoteInvokeMessage {
    /// Creates an invocation of `service_entry_id` with positional `parameters`.
    #[must_use]
    pub fn new(service_entry_id: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            service_entry_id: service_entry_id.into(),
            service_key: None,
            parameters,
            attachments: Attachments::new(),
        }
    }

    #[must_use]
    pub fn with_service_key(mut self, service_key: impl Into<String>) -> Self {
        self.service_key = Some(service_key.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Returns an attachment value by key.
    #[must_use]
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_key_and_attachments() {
        let msg = RemoteInvokeMessage::new("order.create", vec![Value::Int(1)])
            .with_service_key("tenant-a")
            .with_attachment(attachment_keys::TRANS_ID, "t-1");

        assert_eq!(msg.service_key.as_deref(), Some("tenant-a"));
        assert_eq!(msg.attachment(attachment_keys::TRANS_ID), Some("t-1"));
        assert_eq!(msg.attachment("absent"), None);
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let msg = RemoteInvokeMessage::new("e", Vec::new());
        let json = serde_json::to_value(&msg).expect("serialize");
        assert!(json.get("serviceEntryId").is_some());
        assert!(json.get("serviceKey").is_none(), "absent key is skipped");
    }
}
