//! Participant-side helpers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_core::{attachment_keys, Value};
use tokio::sync::OnceCell;

use super::model::TccPhase;
use crate::service::{CallError, Invocation, ServiceHandler};

/// Wraps a confirm or cancel handler so that repeated deliveries for the
/// same `(transId, participantId, phase)` run the inner handler once.
///
/// Concurrent duplicates wait for the first delivery. A failed delivery is
/// not remembered, so the next retry runs the handler again. Calls without
/// TCC attachments, and try calls, pass straight through.
pub struct IdempotentPhase {
    inner: Arc<dyn ServiceHandler>,
    settled: DashMap<String, Arc<OnceCell<Value>>>,
}

impl IdempotentPhase {
    #[must_use]
    pub fn wrap(inner: Arc<dyn ServiceHandler>) -> Arc<dyn ServiceHandler> {
        Arc::new(Self::new(inner))
    }

    #[must_use]
    pub fn new(inner: Arc<dyn ServiceHandler>) -> Self {
        Self {
            inner,
            settled: DashMap::new(),
        }
    }

    /// Drops remembered outcomes of `trans_id`.
    pub fn forget(&self, trans_id: &str) {
        let prefix = format!("{trans_id}:");
        self.settled.retain(|key, _| !key.starts_with(&prefix));
    }

    #[must_use]
    pub fn remembered(&self) -> usize {
        self.settled.iter().filter(|e| e.value().initialized()).count()
    }

    fn dedup_key(invocation: &Invocation) -> Option<String> {
        let phase: TccPhase = invocation.attachment(attachment_keys::TCC_PHASE)?.parse().ok()?;
        if phase == TccPhase::Try {
            return None;
        }
        let trans_id = invocation.attachment(attachment_keys::TRANS_ID)?;
        let participant_id = invocation.attachment(attachment_keys::PARTICIPANT_ID)?;
        Some(format!("{trans_id}:{participant_id}:{phase}"))
    }
}

#[async_trait]
impl ServiceHandler for IdempotentPhase {
    async fn handle(&self, invocation: Invocation) -> Result<Value, CallError> {
        let Some(key) = Self::dedup_key(&invocation) else {
            return self.inner.handle(invocation).await;
        };
        let cell = self.settled.entry(key).or_default().clone();
        let inner = &self.inner;
        cell.get_or_try_init(|| async move {
            let message_id = invocation.message_id.clone();
            let value = inner.handle(invocation).await?;
            tracing::debug!(message_id = %message_id, "phase applied");
            Ok::<_, CallError>(value)
        })
        .await
        .cloned()
    }
}
