//! Per-call execution budget.
//!
//! The budget comes from the invocation itself (`timeout_ms`), already
//! resolved from the entry's governance or the server default.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use meridian_core::Value;
use tower::{Layer, Service};

use crate::service::operation::{CallError, Invocation};

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

/// Fails a call with [`CallError::Timeout`] once its budget is spent. The
/// handler future is dropped at that point.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<Invocation> for TimeoutService<S>
where
    S: Service<Invocation, Response = Value, Error = CallError> + Send,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let timeout_ms = invocation.timeout_ms;
        let budget = Duration::from_millis(timeout_ms);
        let call = self.inner.call(invocation);
        Box::pin(async move {
            tokio::time::timeout(budget, call)
                .await
                .unwrap_or(Err(CallError::Timeout { timeout_ms }))
        })
    }
}
