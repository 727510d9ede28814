use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use meridian_core::{RemoteInvokeMessage, RemoteResultMessage, TransportContent, TransportMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{TransportClient, TransportError};

/// Writes frames toward a peer. Results come back on the receiver handed to
/// [`DefaultTransportClient::new`].
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] or [`TransportError::Codec`]
    /// if the frame could not be written.
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError>;
}

type PendingMap = DashMap<String, (u64, oneshot::Sender<RemoteResultMessage>)>;

// ---------------------------------------------------------------------------
// DefaultTransportClient
// ---------------------------------------------------------------------------

/// Correlates results to sends by message id.
///
/// A background task drains the result channel and completes the matching
/// pending slot. Results for unknown ids (late replies after a timeout) are
/// dropped. When the channel closes, every waiting send fails with
/// [`TransportError::Closed`].
pub struct DefaultTransportClient {
    sender: Arc<dyn MessageSender>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    next_token: AtomicU64,
    receive_loop: JoinHandle<()>,
}

impl DefaultTransportClient {
    #[must_use]
    pub fn new(sender: Arc<dyn MessageSender>, mut results: mpsc::Receiver<TransportMessage>) -> Self {
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let receive_loop = tokio::spawn({
            let pending = pending.clone();
            let closed = closed.clone();
            async move {
                while let Some(frame) = results.recv().await {
                    let TransportContent::Result(result) = frame.content else {
                        tracing::warn!(message_id = %frame.id, "ignoring non-result frame on client channel");
                        continue;
                    };
                    match pending.remove(&frame.id) {
                        Some((_, (_, tx))) => {
                            let _ = tx.send(result);
                        }
                        None => tracing::debug!(message_id = %frame.id, "dropping result with no waiting call"),
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with `Closed`.
                pending.clear();
            }
        });

        Self {
            sender,
            pending,
            closed,
            next_token: AtomicU64::new(0),
            receive_loop,
        }
    }

    /// Number of sends awaiting a result.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for DefaultTransportClient {
    fn drop(&mut self) {
        self.receive_loop.abort();
    }
}

/// Removes the pending slot on every exit path of a send, unless it has
/// already been completed or taken over by a later send of the same id.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: &'a str,
    token: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove_if(self.id, |_, (token, _)| *token == self.token);
    }
}

#[async_trait]
impl TransportClient for DefaultTransportClient {
    async fn send(
        &self,
        message: RemoteInvokeMessage,
        message_id: &str,
        timeout: Option<Duration>,
    ) -> Result<RemoteResultMessage, TransportError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(message_id.to_string()) {
            Entry::Occupied(_) => return Err(TransportError::DuplicateInFlight(message_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert((token, tx));
            }
        }
        let _slot = PendingSlot {
            pending: &self.pending,
            id: message_id,
            token,
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.sender
            .send(TransportMessage::invoke(message_id, message))
            .await?;

        let result = async { rx.await.map_err(|_| TransportError::Closed) };
        match timeout {
            Some(limit) => {
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = limit.as_millis() as u64;
                tokio::time::timeout(limit, result)
                    .await
                    .map_err(|_| TransportError::Timeout { timeout_ms })?
            }
            None => result.await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
