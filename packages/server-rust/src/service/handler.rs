//! The handler capability bound to every service entry.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use meridian_core::Value;

use crate::service::operation::{CallError, Invocation};

/// Executes the business logic behind one service entry.
///
/// Handlers receive fully bound arguments and report business failures as
/// [`CallError::Business`] or [`CallError::Validation`].
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, invocation: Invocation) -> Result<Value, CallError>;
}

/// Adapts an async closure into a [`ServiceHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ServiceHandler for FnHandler<F, Fut>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CallError>> + Send,
{
    async fn handle(&self, invocation: Invocation) -> Result<Value, CallError> {
        (self.f)(invocation).await
    }
}

/// Wraps `f` as a shareable handler.
#[must_use]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}
