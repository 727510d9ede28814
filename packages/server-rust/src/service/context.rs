//! Per-call server context and its lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_core::{attachment_keys, Attachments};

use crate::service::entry::ServiceEntry;

/// Lifecycle states of one server-side call.
///
/// `Resolved -> Initialized -> Executing -> (Completed | Faulted) -> Ended`.
/// A call that fails before executing goes straight to `Faulted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Resolved,
    Initialized,
    Executing,
    Completed,
    Faulted,
    Ended,
}

impl CallState {
    fn can_transition_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (CallState::Resolved, CallState::Initialized | CallState::Faulted)
                | (CallState::Initialized, CallState::Executing | CallState::Faulted)
                | (CallState::Executing, CallState::Completed | CallState::Faulted)
                | (CallState::Completed | CallState::Faulted, CallState::Ended)
        )
    }
}

/// State carried through the pipeline for one inbound call.
///
/// [`end`](Self::end) consumes the context, so a call reaches `Ended`
/// exactly once.
#[derive(Debug)]
pub struct ServerCallContext {
    entry: Arc<ServiceEntry>,
    message_id: String,
    caller_address: Option<String>,
    service_key: Option<String>,
    attachments: Attachments,
    state: CallState,
    history: Vec<CallState>,
    started_at: Instant,
}

impl ServerCallContext {
    #[must_use]
    pub fn new(entry: Arc<ServiceEntry>, message_id: impl Into<String>) -> Self {
        Self {
            entry,
            message_id: message_id.into(),
            caller_address: None,
            service_key: None,
            attachments: Attachments::new(),
            state: CallState::Resolved,
            history: vec![CallState::Resolved],
            started_at: Instant::now(),
        }
    }

    /// Installs inbound attachments and the explicit service key, if any.
    /// An explicit key wins over the `serviceKey` attachment.
    pub fn initialize(&mut self, attachments: Attachments, service_key: Option<String>) {
        self.caller_address = attachments.get(attachment_keys::CALLER_ADDRESS).cloned();
        self.service_key = service_key.or_else(|| attachments.get(attachment_keys::SERVICE_KEY).cloned());
        self.attachments = attachments;
        self.transition(CallState::Initialized);
    }

    pub fn begin_execute(&mut self) {
        self.transition(CallState::Executing);
    }

    pub fn complete(&mut self) {
        self.transition(CallState::Completed);
    }

    pub fn fault(&mut self) {
        self.transition(CallState::Faulted);
    }

    /// Ends the call and returns its summary.
    #[must_use]
    pub fn end(mut self) -> FinishedCall {
        self.transition(CallState::Ended);
        FinishedCall {
            entry_id: self.entry.id.clone(),
            message_id: self.message_id,
            history: self.history,
            elapsed: self.started_at.elapsed(),
        }
    }

    fn transition(&mut self, next: CallState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                entry = %self.entry.id,
                message_id = %self.message_id,
                from = ?self.state,
                to = ?next,
                "ignoring illegal call state transition"
            );
            return;
        }
        self.state = next;
        self.history.push(next);
    }

    #[must_use]
    pub fn entry(&self) -> &Arc<ServiceEntry> {
        &self.entry
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn caller_address(&self) -> Option<&str> {
        self.caller_address.as_deref()
    }

    #[must_use]
    pub fn service_key(&self) -> Option<&str> {
        self.service_key.as_deref()
    }

    #[must_use]
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Summary of an ended call.
#[derive(Debug, Clone)]
pub struct FinishedCall {
    pub entry_id: String,
    pub message_id: String,
    pub history: Vec<CallState>,
    pub elapsed: Duration,
}
