//! Admission control for handler execution.
//!
//! Two caps apply to every call: the node-wide `max_concurrent_calls` and,
//! when the entry declares one, its own `max_concurrency`. A call over
//! either cap is refused at once with [`CallError::Overloaded`]; nothing
//! queues.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use meridian_core::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::entry::ServiceEntry;
use crate::service::operation::{CallError, Invocation};

/// Which cap refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedScope {
    Node,
    Entry,
}

impl ShedScope {
    fn as_str(self) -> &'static str {
        match self {
            ShedScope::Node => "node",
            ShedScope::Entry => "entry",
        }
    }
}

/// Permits held while one admitted call runs.
struct Admitted {
    _node: OwnedSemaphorePermit,
    _entry: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct Limits {
    node: Arc<Semaphore>,
    /// Entry id -> (declared limit, semaphore). Rebuilt when a re-registered
    /// entry declares a different limit.
    entries: DashMap<String, (u32, Arc<Semaphore>)>,
}

impl Limits {
    fn admit(&self, entry: &ServiceEntry) -> Result<Admitted, ShedScope> {
        let node = Arc::clone(&self.node)
            .try_acquire_owned()
            .map_err(|_| ShedScope::Node)?;
        let Some(limit) = entry.governance.max_concurrency else {
            return Ok(Admitted { _node: node, _entry: None });
        };

        let semaphore = {
            let mut slot = self
                .entries
                .entry(entry.id.clone())
                .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit as usize))));
            if slot.0 != limit {
                *slot = (limit, Arc::new(Semaphore::new(limit as usize)));
            }
            Arc::clone(&slot.1)
        };
        let permit = semaphore.try_acquire_owned().map_err(|_| ShedScope::Entry)?;
        Ok(Admitted {
            _node: node,
            _entry: Some(permit),
        })
    }
}

/// Shares one set of limits between every clone of the call stack.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    limits: Arc<Limits>,
}

impl AdmissionLayer {
    #[must_use]
    pub fn new(max_concurrent_calls: u32) -> Self {
        Self {
            limits: Arc::new(Limits {
                node: Arc::new(Semaphore::new(max_concurrent_calls as usize)),
                entries: DashMap::new(),
            }),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            limits: Arc::clone(&self.limits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    limits: Arc<Limits>,
}

impl<S> Service<Invocation> for AdmissionService<S>
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
        match self.limits.admit(&invocation.entry) {
            Ok(permits) => {
                let call = self.inner.call(invocation);
                Box::pin(async move {
                    let result = call.await;
                    drop(permits);
                    result
                })
            }
            Err(scope) => {
                tracing::debug!(entry = %invocation.entry.id, scope = scope.as_str(), "call shed");
                metrics::counter!(
                    "meridian_calls_shed_total",
                    "entry" => invocation.entry.id.clone(),
                    "scope" => scope.as_str()
                )
                .increment(1);
                Box::pin(std::future::ready(Err(CallError::Overloaded)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tower::ServiceExt;

    use super::*;
    use crate::service::entry::HttpMethod;
    use crate::service::handler::handler_fn;
    use crate::service::middleware::test_support::invocation;
    use crate::service::middleware::HandlerExecutor;

    fn sleeper(id: &str, limit: Option<u32>) -> Arc<ServiceEntry> {
        let mut builder = ServiceEntry::builder(id, HttpMethod::Post, format!("/{id}")).handler(handler_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        }));
        if let Some(limit) = limit {
            builder = builder.max_concurrency(limit);
        }
        Arc::new(builder.build().unwrap())
    }

    fn call_to(entry: &Arc<ServiceEntry>) -> Invocation {
        let mut call = invocation(5_000);
        call.entry = Arc::clone(entry);
        call
    }

    /// Starts a call on a clone of `svc` and gives it time to take its permits.
    async fn occupy(svc: &AdmissionService<HandlerExecutor>, entry: &Arc<ServiceEntry>) {
        let busy = svc.clone();
        let call = call_to(entry);
        tokio::spawn(async move { busy.oneshot(call).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn node_cap_refuses_any_entry() {
        let svc = AdmissionLayer::new(1).layer(HandlerExecutor);
        let a = sleeper("a", None);
        let b = sleeper("b", None);
        occupy(&svc, &a).await;

        let err = svc.clone().oneshot(call_to(&b)).await.unwrap_err();
        assert!(matches!(err, CallError::Overloaded));
    }

    #[tokio::test]
    async fn entry_cap_only_refuses_that_entry() {
        let svc = AdmissionLayer::new(100).layer(HandlerExecutor);
        let capped = sleeper("capped", Some(1));
        let open = sleeper("open", None);
        occupy(&svc, &capped).await;

        let err = svc.clone().oneshot(call_to(&capped)).await.unwrap_err();
        assert!(matches!(err, CallError::Overloaded));
        assert_eq!(svc.clone().oneshot(call_to(&open)).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn permits_return_when_calls_finish() {
        let svc = AdmissionLayer::new(1).layer(HandlerExecutor);
        let entry = sleeper("once", Some(1));
        svc.clone().oneshot(call_to(&entry)).await.unwrap();
        svc.clone().oneshot(call_to(&entry)).await.unwrap();
    }

    #[tokio::test]
    async fn re_registered_entry_gets_its_new_limit() {
        let svc = AdmissionLayer::new(100).layer(HandlerExecutor);
        let narrow = sleeper("resized", Some(1));
        occupy(&svc, &narrow).await;
        assert!(svc.clone().oneshot(call_to(&narrow)).await.is_err());

        let widened = sleeper("resized", Some(2));
        assert_eq!(svc.clone().oneshot(call_to(&widened)).await.unwrap(), Value::Null);
    }
}
