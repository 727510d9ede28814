use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_core::{attachment_keys, RemoteInvokeMessage, Value};

use super::TransportClient;
use crate::service::{CallError, Invocation, ServiceHandler};

/// Turns a transport send into a `Result<Value, CallError>`.
///
/// Remote failures are rebuilt with [`CallError::from_remote`]; transport
/// failures map through `From<TransportError>`.
#[derive(Clone)]
pub struct RemoteInvoker {
    client: Arc<dyn TransportClient>,
    default_timeout: Option<Duration>,
    caller_address: Option<String>,
}

impl RemoteInvoker {
    #[must_use]
    pub fn new(client: Arc<dyn TransportClient>) -> Self {
        Self {
            client,
            default_timeout: None,
            caller_address: None,
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Address stamped on outgoing calls that do not carry one already.
    #[must_use]
    pub fn with_caller_address(mut self, address: impl Into<String>) -> Self {
        self.caller_address = Some(address.into());
        self
    }

    /// Invokes under a fresh message id.
    ///
    /// # Errors
    ///
    /// Returns the remote error or the transport failure.
    pub async fn invoke(&self, message: RemoteInvokeMessage) -> Result<Value, CallError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.invoke_with_id(message, &id, None).await
    }

    /// Invokes under `message_id`; retries of one logical call reuse it.
    ///
    /// # Errors
    ///
    /// Returns the remote error or the transport failure.
    pub async fn invoke_with_id(
        &self,
        mut message: RemoteInvokeMessage,
        message_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        if let Some(address) = &self.caller_address {
            message
                .attachments
                .entry(attachment_keys::CALLER_ADDRESS.to_string())
                .or_insert_with(|| address.clone());
        }
        let entry_id = message.service_entry_id.clone();
        let result = self
            .client
            .send(message, message_id, timeout.or(self.default_timeout))
            .await
            .map_err(|e| {
                tracing::warn!(entry = %entry_id, message_id, error = %e, "remote invocation failed");
                CallError::from(e)
            })?;
        if result.is_ok() {
            Ok(result.result.unwrap_or(Value::Null))
        } else {
            Err(CallError::from_remote(&result))
        }
    }
}

/// Handler that forwards every invocation of its entry to a remote node
/// serving an entry with the same id.
pub struct RemoteHandler {
    invoker: RemoteInvoker,
}

impl RemoteHandler {
    #[must_use]
    pub fn new(invoker: RemoteInvoker) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl ServiceHandler for RemoteHandler {
    async fn handle(&self, invocation: Invocation) -> Result<Value, CallError> {
        let message = RemoteInvokeMessage {
            service_entry_id: invocation.entry.id.clone(),
            service_key: invocation.service_key,
            parameters: invocation.args,
            attachments: invocation.attachments,
        };
        let timeout = Duration::from_millis(invocation.timeout_ms);
        self.invoker
            .invoke_with_id(message, &invocation.message_id, Some(timeout))
            .await
    }
}

#[cfg(test)]
mod tests {
    use meridian_core::ResultStatus;

    use super::*;
    use crate::service::{
        handler_fn, DispatchPipeline, HttpMethod, ParameterFrom, ParameterType, RpcParameter, ServerConfig,
        ServiceEntry, ServiceEntryRegistry,
    };
    use crate::transport::LoopbackSender;

    fn remote_node() -> Arc<DispatchPipeline> {
        let registry = Arc::new(ServiceEntryRegistry::new());
        registry
            .replace_all(vec![
                ServiceEntry::builder("stock.deduct", HttpMethod::Post, "/stock/deduct")
                    .param(RpcParameter::builder("qty", ParameterFrom::Body, ParameterType::Int))
                    .handler(handler_fn(|inv: Invocation| async move {
                        match inv.args[0].as_i64() {
                            Some(q) if q > 10 => Err(CallError::business("insufficient stock")),
                            Some(q) => Ok(Value::Int(100 - q)),
                            None => Err(CallError::internal("qty missing")),
                        }
                    }))
                    .build()
                    .unwrap(),
                ServiceEntry::builder("stock.caller", HttpMethod::Get, "/stock/caller")
                    .handler(handler_fn(|inv: Invocation| async move {
                        Ok(Value::from(inv.caller_address.unwrap_or_default()))
                    }))
                    .build()
                    .unwrap(),
            ])
            .unwrap();
        Arc::new(DispatchPipeline::new(registry, Arc::new(ServerConfig::default())))
    }

    fn invoker() -> RemoteInvoker {
        RemoteInvoker::new(Arc::new(LoopbackSender::client(remote_node())))
            .with_default_timeout(Duration::from_secs(1))
            .with_caller_address("10.0.0.7")
    }

    #[tokio::test]
    async fn returns_remote_value() {
        let value = invoker()
            .invoke(RemoteInvokeMessage::new("stock.deduct", vec![Value::Int(3)]))
            .await
            .unwrap();
        assert_eq!(value, Value::Int(97));
    }

    #[tokio::test]
    async fn rebuilds_remote_business_error() {
        let err = invoker()
            .invoke(RemoteInvokeMessage::new("stock.deduct", vec![Value::Int(50)]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), ResultStatus::BusinessError);
        assert!(err.to_string().contains("insufficient stock"));
    }

    #[tokio::test]
    async fn stamps_caller_address() {
        let value = invoker()
            .invoke(RemoteInvokeMessage::new("stock.caller", vec![]))
            .await
            .unwrap();
        assert_eq!(value, Value::from("10.0.0.7"));
    }

    #[tokio::test]
    async fn remote_handler_forwards_local_entry() {
        let local_registry = Arc::new(ServiceEntryRegistry::new());
        local_registry
            .replace_all(vec![ServiceEntry::builder("stock.deduct", HttpMethod::Post, "/stock/deduct")
                .param(RpcParameter::builder("qty", ParameterFrom::Body, ParameterType::Int))
                .handler(Arc::new(RemoteHandler::new(invoker())))
                .build()
                .unwrap()])
            .unwrap();
        let local = DispatchPipeline::new(local_registry, Arc::new(ServerConfig::default()));

        let result = local
            .dispatch_rpc("fwd-1", RemoteInvokeMessage::new("stock.deduct", vec![Value::Int(4)]))
            .await;
        assert_eq!(result.result, Some(Value::Int(96)));

        let failed = local
            .dispatch_rpc("fwd-2", RemoteInvokeMessage::new("stock.deduct", vec![Value::Int(40)]))
            .await;
        assert_eq!(failed.status, ResultStatus::BusinessError);
    }
}
