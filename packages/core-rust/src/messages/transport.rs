//! The framed unit exchanged by message senders, and its `MsgPack` codec.

use serde::{Deserialize, Serialize};

use super::invoke::RemoteInvokeMessage;
use super::result::RemoteResultMessage;

/// Payload of a [`TransportMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum TransportContent {
    Invoke(RemoteInvokeMessage),
    Result(RemoteResultMessage),
}

/// An invocation or a result, correlated by the caller-generated message id.
///
/// A result reuses the id of the invocation it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub id: String,
    pub content: TransportContent,
}

impl TransportMessage {
    #[must_use]
    pub fn invoke(id: impl Into<String>, message: RemoteInvokeMessage) -> Self {
        Self {
            id: id.into(),
            content: TransportContent::Invoke(message),
        }
    }

    #[must_use]
    pub fn result(id: impl Into<String>, message: RemoteResultMessage) -> Self {
        Self {
            id: id.into(),
            content: TransportContent::Result(message),
        }
    }

    /// Encodes to named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be represented in `MsgPack`.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes from `MsgPack` produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns an error for truncated or malformed input.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorEnvelope, ResultStatus};
    use crate::types::Value;

    #[test]
    fn invoke_frame_survives_codec() {
        let frame = TransportMessage::invoke(
            "msg-1",
            RemoteInvokeMessage::new("stock.deduct", vec![Value::Int(3), Value::from("sku")])
                .with_attachment("transId", "t-9"),
        );
        let decoded = TransportMessage::decode(&frame.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn error_result_frame_survives_codec() {
        let frame = TransportMessage::result(
            "msg-2",
            RemoteResultMessage::error(ErrorEnvelope::new(ResultStatus::Timeout, "late")),
        );
        let decoded = TransportMessage::decode(&frame.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(TransportMessage::decode(&[0xc1, 0x00, 0x13]).is_err());
    }
}
