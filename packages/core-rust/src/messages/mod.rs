//! Wire envelopes for the `Meridian` RPC protocol.
//!
//! All types use named `MsgPack` serialization (`rmp_serde::to_vec_named()`)
//! with camelCase field names so that the envelopes stay self-describing
//! across node versions.
//!
//! - [`invoke`]: the request envelope and well-known attachment keys
//! - [`result`]: the result envelope, status codes and error envelope
//! - [`transport`]: the framed unit carried by message senders

pub mod invoke;
pub mod result;
pub mod transport;

pub use invoke::{attachment_keys, Attachments, RemoteInvokeMessage};
pub use result::{ErrorEnvelope, RemoteResultMessage, ResultStatus, ValidationError};
pub use transport::{TransportContent, TransportMessage};
