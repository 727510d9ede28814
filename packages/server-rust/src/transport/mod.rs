//! Transport client: sends one invocation to a peer and awaits its result.
//!
//! - [`client`]: [`DefaultTransportClient`], message-id correlation over any [`MessageSender`]
//! - [`loopback`]: in-process sender dispatching into a local pipeline
//! - [`tcp`]: length-delimited `MsgPack` frames over TCP, client and server side
//! - [`invoker`]: `Result`-returning convenience wrapper and a forwarding handler

pub mod client;
pub mod invoker;
pub mod loopback;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use meridian_core::{RemoteInvokeMessage, RemoteResultMessage};

use crate::service::CallError;

pub use client::{DefaultTransportClient, MessageSender};
pub use invoker::{RemoteHandler, RemoteInvoker};
pub use loopback::LoopbackSender;
pub use tcp::{TcpMessageSender, TcpRpcServer, TcpTransportConfig};

/// Infrastructure failures of a send. Business failures are not errors here:
/// they arrive as a [`RemoteResultMessage`] with an error status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no result within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("message {0} is already in flight")]
    DuplicateInFlight(String),
    #[error("transport closed before a result arrived")]
    Closed,
    #[error("codec failure: {0}")]
    Codec(String),
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => CallError::Timeout { timeout_ms },
            other => CallError::Transport {
                message: other.to_string(),
            },
        }
    }
}

/// Sends a serialized invocation and awaits the correlated result.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Sends `message` under `message_id`. Retries of the same logical call
    /// must reuse the same id. `None` waits without bound.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] when no result arrives in time; the remote
    /// effect is then indeterminate. Other variants report connection faults.
    async fn send(
        &self,
        message: RemoteInvokeMessage,
        message_id: &str,
        timeout: Option<Duration>,
    ) -> Result<RemoteResultMessage, TransportError>;
}
