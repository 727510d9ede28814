//! Call stack composition: wraps handler execution in all middleware layers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use meridian_core::Value;
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder};

use super::admission::AdmissionLayer;
use super::outcome::{OutcomeLayer, OutcomeTally};
use super::timeout::TimeoutLayer;
use crate::service::config::ServerConfig;
use crate::service::operation::{CallError, Invocation};

/// Type-erased middleware stack around handler execution.
pub type CallStack = BoxCloneService<Invocation, Value, CallError>;

// ---------------------------------------------------------------------------
// HandlerExecutor
// ---------------------------------------------------------------------------

/// Innermost service: runs the entry's handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerExecutor;

impl Service<Invocation> for HandlerExecutor {
    type Response = Value;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let handler = invocation.entry.handler.clone();
        Box::pin(async move { handler.handle(invocation).await })
    }
}

/// Builds the call stack around [`HandlerExecutor`], outermost first:
/// outcome classification, admission, timeout.
#[must_use]
pub fn build_call_stack(config: &ServerConfig, tally: Arc<OutcomeTally>) -> CallStack {
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(OutcomeLayer::new(tally))
            .layer(AdmissionLayer::new(config.max_concurrent_calls))
            .layer(TimeoutLayer)
            .service(HandlerExecutor),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
