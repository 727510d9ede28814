//! The dispatch pipeline: resolve, initialize, authorize, bind, execute,
//! monitor, render.

use std::sync::Arc;

use meridian_core::{Attachments, RemoteInvokeMessage, RemoteResultMessage, Value};
use parking_lot::Mutex;
use tower::ServiceExt;

use crate::service::binder::{BindingError, BoundArguments};
use crate::service::config::ServerConfig;
use crate::service::context::ServerCallContext;
use crate::service::entry::ServiceEntry;
use crate::service::hooks::{HandleKey, PipelineHooks};
use crate::service::middleware::{build_call_stack, CallStack, OutcomeTally};
use crate::service::operation::{CallError, Invocation};
use crate::service::protocol::{
    HttpCall, HttpMessageHandler, HttpRequest, HttpResponse, MessageReceivedHandler, RpcCall,
    RpcMessageHandler,
};
use crate::service::registry::ServiceEntryRegistry;

/// Per-call metadata taken from the inbound message.
#[derive(Debug, Clone, Default)]
pub struct InboundMeta {
    pub message_id: String,
    pub attachments: Attachments,
    pub service_key: Option<String>,
}

// ---------------------------------------------------------------------------
// CallRunner
// ---------------------------------------------------------------------------

/// Runs one resolved call through its lifecycle.
///
/// The handle monitor sees exactly one success or failure per call, and the
/// call context always ends, whatever the outcome.
pub struct CallRunner {
    stack: Mutex<CallStack>,
    outcomes: Arc<OutcomeTally>,
    hooks: PipelineHooks,
    config: Arc<ServerConfig>,
}

impl CallRunner {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, hooks: PipelineHooks) -> Self {
        let outcomes = Arc::new(OutcomeTally::new());
        Self {
            stack: Mutex::new(build_call_stack(&config, Arc::clone(&outcomes))),
            outcomes,
            hooks,
            config,
        }
    }

    /// Executed calls by entry and result status.
    #[must_use]
    pub fn outcomes(&self) -> &Arc<OutcomeTally> {
        &self.outcomes
    }

    /// Runs `entry` with arguments produced by `bind`.
    ///
    /// # Errors
    ///
    /// Returns the authorization, binding or execution error of the call.
    pub async fn run<B>(&self, entry: Arc<ServiceEntry>, meta: InboundMeta, bind: B) -> Result<Value, CallError>
    where
        B: FnOnce(&ServiceEntry) -> Result<BoundArguments, BindingError> + Send,
    {
        let mut ctx = ServerCallContext::new(entry, meta.message_id);
        ctx.initialize(meta.attachments, meta.service_key);

        let mut call = SettleOnDrop {
            ctx: Some(ctx),
            hooks: &self.hooks,
        };
        let result = match call.ctx.as_mut() {
            Some(ctx) => self.execute(ctx, bind).await,
            None => Err(CallError::internal("call context already settled")),
        };
        call.settle(&result);
        result
    }

    async fn execute<B>(&self, ctx: &mut ServerCallContext, bind: B) -> Result<Value, CallError>
    where
        B: FnOnce(&ServiceEntry) -> Result<BoundArguments, BindingError> + Send,
    {
        self.hooks.authorizer.authorize(ctx).await?;
        let bound = bind(ctx.entry())?;

        ctx.begin_execute();
        self.hooks.diagnostics.before_execute(ctx, &bound.values);

        let entry = ctx.entry().clone();
        let invocation = Invocation {
            timeout_ms: self.config.timeout_for(entry.governance.timeout_ms),
            entry,
            message_id: ctx.message_id().to_string(),
            args: bound.values,
            cache_keys: bound.cache_keys,
            service_key: ctx.service_key().map(str::to_string),
            attachments: ctx.attachments().clone(),
            caller_address: ctx.caller_address().map(str::to_string),
        };

        let stack = self.stack.lock().clone();
        stack.oneshot(invocation).await
    }
}

/// Reports the outcome of one call to the hooks and ends its context.
///
/// If the running call is dropped first (the gateway gave up on it, or the
/// client went away), the drop reports an unexpected failure instead.
struct SettleOnDrop<'a> {
    ctx: Option<ServerCallContext>,
    hooks: &'a PipelineHooks,
}

impl SettleOnDrop<'_> {
    fn settle(&mut self, result: &Result<Value, CallError>) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        #[allow(clippy::cast_precision_loss)]
        let elapsed_ms = ctx.elapsed().as_micros() as f64 / 1000.0;
        let key = HandleKey::of(&ctx);
        match result {
            Ok(value) => {
                ctx.complete();
                self.hooks.diagnostics.after_execute(&ctx, value);
                self.hooks.monitor.exec_success(&key, elapsed_ms);
            }
            Err(err) => {
                ctx.fault();
                self.hooks.diagnostics.on_error(&ctx, err);
                self.hooks.monitor.exec_fail(&key, err.is_friendly(), elapsed_ms);
            }
        }
        self.hooks.diagnostics.on_end(&ctx.end());
    }
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.ctx.is_some() {
            self.settle(&Err(CallError::internal("call dropped before it completed")));
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchPipeline
// ---------------------------------------------------------------------------

/// Result of offering an HTTP request to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No external entry matched; the request falls through to other handlers.
    NotEngaged,
    Handled(HttpResponse),
}

/// Entry point for inbound HTTP and RPC calls.
pub struct DispatchPipeline {
    registry: Arc<ServiceEntryRegistry>,
    runner: CallRunner,
    http: HttpMessageHandler,
    rpc: RpcMessageHandler,
}

impl DispatchPipeline {
    #[must_use]
    pub fn new(registry: Arc<ServiceEntryRegistry>, config: Arc<ServerConfig>) -> Self {
        Self::with_hooks(registry, config, PipelineHooks::default())
    }

    #[must_use]
    pub fn with_hooks(registry: Arc<ServiceEntryRegistry>, config: Arc<ServerConfig>, hooks: PipelineHooks) -> Self {
        Self {
            registry,
            runner: CallRunner::new(config, hooks),
            http: HttpMessageHandler,
            rpc: RpcMessageHandler,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceEntryRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn outcomes(&self) -> &Arc<OutcomeTally> {
        self.runner.outcomes()
    }

    /// Dispatches an external HTTP request.
    ///
    /// Returns [`DispatchOutcome::NotEngaged`] when no external entry matches
    /// or the matched entry is not served over HTTP.
    pub async fn dispatch_http(&self, message_id: impl Into<String>, request: HttpRequest) -> DispatchOutcome {
        let Some(resolved) = self.registry.resolve(&request.path, request.method) else {
            return DispatchOutcome::NotEngaged;
        };
        if !resolved.entry.protocol.serves_http() {
            return DispatchOutcome::NotEngaged;
        }

        let call = HttpCall {
            message_id: message_id.into(),
            request,
            path_params: resolved.path_params,
        };
        DispatchOutcome::Handled(self.http.handle(&self.runner, resolved.entry, call).await)
    }

    /// Dispatches an RPC invocation by service entry id. Internal entries
    /// are reachable here; gateway-only and websocket entries are not.
    pub async fn dispatch_rpc(&self, message_id: impl Into<String>, message: RemoteInvokeMessage) -> RemoteResultMessage {
        let entry = self
            .registry
            .resolve_by_id(&message.service_entry_id)
            .filter(|e| e.protocol.serves_rpc());
        let Some(entry) = entry else {
            return CallError::NotFound {
                target: message.service_entry_id,
            }
            .into();
        };

        let call = RpcCall {
            message_id: message_id.into(),
            message,
        };
        self.rpc.handle(&self.runner, entry, call).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
