use std::sync::Arc;

use async_trait::async_trait;
use meridian_core::{TransportContent, TransportMessage};
use tokio::sync::mpsc;

use super::client::{DefaultTransportClient, MessageSender};
use super::TransportError;
use crate::service::DispatchPipeline;

/// Result channel depth for in-process clients.
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// In-process sender: each frame goes through the `MsgPack` codec and is
/// dispatched into a local pipeline on its own task, as a remote node would.
pub struct LoopbackSender {
    pipeline: Arc<DispatchPipeline>,
    results: mpsc::Sender<TransportMessage>,
}

impl LoopbackSender {
    #[must_use]
    pub fn new(pipeline: Arc<DispatchPipeline>, results: mpsc::Sender<TransportMessage>) -> Self {
        Self { pipeline, results }
    }

    /// Builds a transport client wired to `pipeline` through a loopback sender.
    #[must_use]
    pub fn client(pipeline: Arc<DispatchPipeline>) -> DefaultTransportClient {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        DefaultTransportClient::new(Arc::new(Self::new(pipeline, tx)), rx)
    }
}

#[async_trait]
impl MessageSender for LoopbackSender {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let bytes = message.encode().map_err(|e| TransportError::Codec(e.to_string()))?;
        let frame = TransportMessage::decode(&bytes).map_err(|e| TransportError::Codec(e.to_string()))?;
        let TransportContent::Invoke(invoke) = frame.content else {
            return Err(TransportError::Codec("loopback accepts invocations only".to_string()));
        };

        let pipeline = self.pipeline.clone();
        let results = self.results.clone();
        let id = frame.id;
        tokio::spawn(async move {
            let result = pipeline.dispatch_rpc(id.clone(), invoke).await;
            if results.send(TransportMessage::result(id, result)).await.is_err() {
                tracing::debug!("loopback client dropped before result delivery");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use meridian_core::{RemoteInvokeMessage, ResultStatus, Value};

    use super::*;
    use crate::service::{
        handler_fn, HttpMethod, Invocation, ParameterFrom, ParameterType, RpcParameter, ServerConfig,
        ServiceEntry, ServiceEntryRegistry,
    };
    use crate::transport::TransportClient;

    fn pipeline() -> Arc<DispatchPipeline> {
        let registry = Arc::new(ServiceEntryRegistry::new());
        registry
            .replace_all(vec![ServiceEntry::builder("math.double", HttpMethod::Post, "/math/double")
                .param(RpcParameter::builder("n", ParameterFrom::Body, ParameterType::Int))
                .handler(handler_fn(|inv: Invocation| async move {
                    Ok(Value::Int(inv.args[0].as_i64().unwrap_or_default() * 2))
                }))
                .build()
                .unwrap()])
            .unwrap();
        Arc::new(DispatchPipeline::new(registry, Arc::new(ServerConfig::default())))
    }

    #[tokio::test]
    async fn round_trips_through_local_pipeline() {
        let client = LoopbackSender::client(pipeline());
        let result = client
            .send(
                RemoteInvokeMessage::new("math.double", vec![Value::Int(21)]),
                "m-1",
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(result.result, Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn unknown_entry_comes_back_as_not_found_result() {
        let client = LoopbackSender::client(pipeline());
        let result = client
            .send(RemoteInvokeMessage::new("math.triple", vec![]), "m-2", None)
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::NotFound);
    }
}
