//! Outcome classes per service entry.
//!
//! The outermost layer of the call stack, so calls refused by admission or
//! cut off by their budget are classified too. A call is counted under the
//! [`ResultStatus`] its error maps to, which is the status the caller
//! receives, and runs inside a `call` span carrying that status.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use dashmap::DashMap;
use meridian_core::{ResultStatus, Value};
use tower::{Layer, Service};
use tracing::{field, info_span, Instrument};

use crate::service::operation::{CallError, Invocation};

/// Call counts by entry id and result status.
#[derive(Debug, Default)]
pub struct OutcomeTally {
    counts: DashMap<(String, ResultStatus), u64>,
}

impl OutcomeTally {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self, entry_id: &str, status: ResultStatus) -> u64 {
        self.counts
            .get(&(entry_id.to_string(), status))
            .map_or(0, |c| *c)
    }

    /// Non-zero counts for one entry.
    #[must_use]
    pub fn of_entry(&self, entry_id: &str) -> Vec<(ResultStatus, u64)> {
        let mut counts: Vec<_> = self
            .counts
            .iter()
            .filter(|e| e.key().0 == entry_id)
            .map(|e| (e.key().1, *e.value()))
            .collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        counts
    }

    fn record(&self, entry_id: &str, status: ResultStatus) {
        *self.counts.entry((entry_id.to_string(), status)).or_default() += 1;
        metrics::counter!(
            "meridian_call_outcomes_total",
            "entry" => entry_id.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
    }
}

#[derive(Debug, Clone)]
pub struct OutcomeLayer {
    tally: Arc<OutcomeTally>,
}

impl OutcomeLayer {
    #[must_use]
    pub fn new(tally: Arc<OutcomeTally>) -> Self {
        Self { tally }
    }
}

impl<S> Layer<S> for OutcomeLayer {
    type Service = OutcomeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OutcomeService {
            inner,
            tally: Arc::clone(&self.tally),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutcomeService<S> {
    inner: S,
    tally: Arc<OutcomeTally>,
}

impl<S> Service<Invocation> for OutcomeService<S>
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
        let entry = Arc::clone(&invocation.entry);
        let span = info_span!(
            "call",
            entry = %entry.id,
            message_id = %invocation.message_id,
            service_key = invocation.service_key.as_deref().unwrap_or_default(),
            status = field::Empty,
            elapsed_ms = field::Empty,
        );
        let tally = Arc::clone(&self.tally);
        let started = Instant::now();
        let call = self.inner.call(invocation);

        Box::pin(
            async move {
                let result = call.await;
                let status = result.as_ref().map_or_else(CallError::status, |_| ResultStatus::Ok);
                tally.record(&entry.id, status);

                #[allow(clippy::cast_possible_truncation)]
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let span = tracing::Span::current();
                span.record("status", status.as_str());
                span.record("elapsed_ms", elapsed_ms);
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::{ServiceBuilder, ServiceExt};

    use super::*;
    use crate::service::entry::{HttpMethod, ServiceEntry};
    use crate::service::handler::handler_fn;
    use crate::service::middleware::test_support::invocation;
    use crate::service::middleware::{AdmissionLayer, HandlerExecutor, TimeoutLayer};

    fn call_with(id: &str, handler: Arc<dyn crate::service::ServiceHandler>, timeout_ms: u64) -> Invocation {
        let mut call = invocation(timeout_ms);
        call.entry = Arc::new(
            ServiceEntry::builder(id, HttpMethod::Post, format!("/{id}"))
                .handler(handler)
                .build()
                .unwrap(),
        );
        call
    }

    #[tokio::test]
    async fn classifies_by_the_status_callers_receive() {
        let tally = Arc::new(OutcomeTally::new());
        let stack = ServiceBuilder::new()
            .layer(OutcomeLayer::new(Arc::clone(&tally)))
            .layer(TimeoutLayer)
            .service(HandlerExecutor);

        let ok = handler_fn(|_| async { Ok(Value::Null) });
        let rejected = handler_fn(|_| async { Err(CallError::business("sold out")) });
        let slow = handler_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        });

        stack.clone().oneshot(call_with("order.place", ok, 1_000)).await.unwrap();
        stack.clone().oneshot(call_with("order.place", rejected, 1_000)).await.unwrap_err();
        stack.clone().oneshot(call_with("order.place", slow, 10)).await.unwrap_err();

        assert_eq!(
            tally.of_entry("order.place"),
            vec![
                (ResultStatus::BusinessError, 1),
                (ResultStatus::Ok, 1),
                (ResultStatus::Timeout, 1),
            ]
        );
        assert!(tally.of_entry("order.cancel").is_empty());
    }

    #[tokio::test]
    async fn shed_calls_are_counted_as_overloaded() {
        let tally = Arc::new(OutcomeTally::new());
        let stack = ServiceBuilder::new()
            .layer(OutcomeLayer::new(Arc::clone(&tally)))
            .layer(AdmissionLayer::new(0))
            .service(HandlerExecutor);

        let err = stack.oneshot(invocation(1_000)).await.unwrap_err();
        assert!(matches!(err, CallError::Overloaded));
        assert_eq!(tally.count("test.noop", ResultStatus::Overloaded), 1);
        assert_eq!(tally.count("test.noop", ResultStatus::Ok), 0);
    }
}
