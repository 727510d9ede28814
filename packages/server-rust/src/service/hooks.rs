//! Injectable pipeline hooks: handle monitoring, diagnostics and authorization.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meridian_core::{attachment_keys, Value};

use crate::service::context::{FinishedCall, ServerCallContext};
use crate::service::operation::CallError;

// ---------------------------------------------------------------------------
// HandleMonitor
// ---------------------------------------------------------------------------

/// Identifies a (service entry, caller) pair for handle statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub service_entry_id: String,
    pub caller_address: Option<String>,
}

impl HandleKey {
    #[must_use]
    pub fn of(ctx: &ServerCallContext) -> Self {
        Self {
            service_entry_id: ctx.entry().id.clone(),
            caller_address: ctx.caller_address().map(str::to_string),
        }
    }
}

/// Aggregated handle statistics for one [`HandleKey`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HandleStats {
    pub success: u64,
    pub fail: u64,
    /// Failures that were friendly (business, validation, binding, auth).
    pub friendly_fail: u64,
    pub last_elapsed_ms: f64,
    pub max_elapsed_ms: f64,
}

/// Receives one success or failure notification per executed call.
pub trait HandleMonitor: Send + Sync {
    fn exec_success(&self, key: &HandleKey, elapsed_ms: f64);
    fn exec_fail(&self, key: &HandleKey, friendly: bool, elapsed_ms: f64);
}

/// Keeps per-key statistics in memory and exports them through `metrics`.
#[derive(Debug, Default)]
pub struct MetricsHandleMonitor {
    stats: DashMap<HandleKey, HandleStats>,
}

impl MetricsHandleMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stats(&self, key: &HandleKey) -> Option<HandleStats> {
        self.stats.get(key).map(|s| *s)
    }

    /// Statistics summed over every caller of `service_entry_id`.
    #[must_use]
    pub fn entry_totals(&self, service_entry_id: &str) -> HandleStats {
        self.stats
            .iter()
            .filter(|e| e.key().service_entry_id == service_entry_id)
            .fold(HandleStats::default(), |mut acc, e| {
                acc.success += e.success;
                acc.fail += e.fail;
                acc.friendly_fail += e.friendly_fail;
                acc.max_elapsed_ms = acc.max_elapsed_ms.max(e.max_elapsed_ms);
                acc.last_elapsed_ms = e.last_elapsed_ms;
                acc
            })
    }

    fn record(&self, key: &HandleKey, elapsed_ms: f64, update: impl FnOnce(&mut HandleStats)) {
        let mut stats = self.stats.entry(key.clone()).or_default();
        update(&mut stats);
        stats.last_elapsed_ms = elapsed_ms;
        stats.max_elapsed_ms = stats.max_elapsed_ms.max(elapsed_ms);
    }
}

impl HandleMonitor for MetricsHandleMonitor {
    fn exec_success(&self, key: &HandleKey, elapsed_ms: f64) {
        self.record(key, elapsed_ms, |s| s.success += 1);
        metrics::counter!("meridian_calls_total", "entry" => key.service_entry_id.clone(), "outcome" => "ok")
            .increment(1);
        metrics::histogram!("meridian_call_duration_ms", "entry" => key.service_entry_id.clone())
            .record(elapsed_ms);
    }

    fn exec_fail(&self, key: &HandleKey, friendly: bool, elapsed_ms: f64) {
        self.record(key, elapsed_ms, |s| {
            s.fail += 1;
            if friendly {
                s.friendly_fail += 1;
            }
        });
        let outcome = if friendly { "friendly_error" } else { "error" };
        metrics::counter!("meridian_calls_total", "entry" => key.service_entry_id.clone(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("meridian_call_duration_ms", "entry" => key.service_entry_id.clone())
            .record(elapsed_ms);
    }
}

// ---------------------------------------------------------------------------
// DiagnosticListener
// ---------------------------------------------------------------------------

/// Observes handler execution. All methods default to no-ops.
pub trait DiagnosticListener: Send + Sync {
    fn before_execute(&self, _ctx: &ServerCallContext, _args: &[Value]) {}
    fn after_execute(&self, _ctx: &ServerCallContext, _result: &Value) {}
    fn on_error(&self, _ctx: &ServerCallContext, _error: &CallError) {}
    /// Called once per call, after its context reached `Ended`.
    fn on_end(&self, _finished: &FinishedCall) {}
}

/// Writes execution events to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingDiagnosticListener;

impl DiagnosticListener for TracingDiagnosticListener {
    fn before_execute(&self, ctx: &ServerCallContext, args: &[Value]) {
        tracing::debug!(
            entry = %ctx.entry().id,
            message_id = %ctx.message_id(),
            args = args.len(),
            "executing handler"
        );
    }

    fn after_execute(&self, ctx: &ServerCallContext, _result: &Value) {
        tracing::debug!(
            entry = %ctx.entry().id,
            message_id = %ctx.message_id(),
            elapsed_ms = ctx.elapsed().as_millis(),
            "handler completed"
        );
    }

    fn on_error(&self, ctx: &ServerCallContext, error: &CallError) {
        if error.is_friendly() {
            tracing::info!(entry = %ctx.entry().id, message_id = %ctx.message_id(), %error, "call rejected");
        } else {
            tracing::error!(entry = %ctx.entry().id, message_id = %ctx.message_id(), %error, "call failed");
        }
    }

    fn on_end(&self, finished: &FinishedCall) {
        tracing::trace!(
            entry = %finished.entry_id,
            message_id = %finished.message_id,
            states = ?finished.history,
            "call ended"
        );
    }
}

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

/// Decides whether the caller in `ctx` may execute the resolved entry.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CallError::Unauthorized`] to reject the call.
    async fn authorize(&self, ctx: &ServerCallContext) -> Result<(), CallError>;
}

/// Enforces entry governance against the `userId` and `roles` attachments.
///
/// Anonymous entries always pass. Other entries need a user id, and if they
/// name roles, at least one matching role.
///
/// The attachments are taken as received. They must be stamped by a trusted
/// edge (an authenticating proxy in front of the gateway, or a peer on a
/// private RPC network); a caller that reaches a listener directly can set
/// them to anything.
#[derive(Debug, Clone, Default)]
pub struct GovernanceAuthorizer;

#[async_trait]
impl Authorizer for GovernanceAuthorizer {
    async fn authorize(&self, ctx: &ServerCallContext) -> Result<(), CallError> {
        let governance = &ctx.entry().governance;
        if governance.allow_anonymous {
            return Ok(());
        }

        let attachments = ctx.attachments();
        if attachments
            .get(attachment_keys::USER_ID)
            .map_or(true, String::is_empty)
        {
            return Err(CallError::Unauthorized {
                message: format!("{} requires an authenticated caller", ctx.entry().id),
            });
        }

        if governance.authorize_roles.is_empty() {
            return Ok(());
        }
        let roles = attachments.get(attachment_keys::ROLES).map_or("", String::as_str);
        let granted = roles
            .split(',')
            .map(str::trim)
            .any(|role| governance.authorize_roles.iter().any(|r| r.eq_ignore_ascii_case(role)));
        if granted {
            Ok(())
        } else {
            Err(CallError::Unauthorized {
                message: format!("caller lacks a role required by {}", ctx.entry().id),
            })
        }
    }
}

/// Hooks injected into the dispatch pipeline.
#[derive(Clone)]
pub struct PipelineHooks {
    pub monitor: Arc<dyn HandleMonitor>,
    pub diagnostics: Arc<dyn DiagnosticListener>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl Default for PipelineHooks {
    fn default() -> Self {
        Self {
            monitor: Arc::new(MetricsHandleMonitor::new()),
            diagnostics: Arc::new(TracingDiagnosticListener),
            authorizer: Arc::new(GovernanceAuthorizer),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
