//! Length-delimited `MsgPack` frames over TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use meridian_core::{attachment_keys, TransportContent, TransportMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::client::{DefaultTransportClient, MessageSender};
use super::TransportError;
use crate::service::DispatchPipeline;

/// Frames waiting for a connection's writer task.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Socket-level settings shared by both ends.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    pub connect_timeout_ms: u64,
    /// Frames larger than this are rejected by the codec.
    pub max_frame_bytes: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl TcpTransportConfig {
    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_bytes)
            .new_codec()
    }
}

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Writes invocation frames to one peer. Result frames are forwarded to the
/// channel returned by [`TcpMessageSender::connect`].
pub struct TcpMessageSender {
    sink: Mutex<FrameSink>,
    reader: JoinHandle<()>,
}

impl TcpMessageSender {
    /// Connects to `addr` and starts reading result frames.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connection`] if the connection cannot be
    /// established within the configured timeout.
    pub async fn connect(
        addr: SocketAddr,
        config: &TcpTransportConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportMessage>), TransportError> {
        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect)
            .await
            .map_err(|_| TransportError::Connection(format!("connect to {addr} timed out")))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (sink, mut stream) = Framed::new(stream, config.codec()).split();
        let (tx, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(peer = %addr, error = %e, "dropping tcp connection");
                        break;
                    }
                };
                match TransportMessage::decode(&bytes) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(peer = %addr, error = %e, "undecodable frame"),
                }
            }
        });

        Ok((
            Self {
                sink: Mutex::new(sink),
                reader,
            },
            rx,
        ))
    }

    /// Connects and wraps the connection in a correlating client.
    ///
    /// # Errors
    ///
    /// See [`TcpMessageSender::connect`].
    pub async fn client(
        addr: SocketAddr,
        config: &TcpTransportConfig,
    ) -> Result<DefaultTransportClient, TransportError> {
        let (sender, results) = Self::connect(addr, config).await?;
        Ok(DefaultTransportClient::new(Arc::new(sender), results))
    }
}

impl Drop for TcpMessageSender {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl MessageSender for TcpMessageSender {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let bytes = message.encode().map_err(|e| TransportError::Codec(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Accepts RPC connections and dispatches every invocation frame into the
/// pipeline on its own task. Results are written back in completion order.
pub struct TcpRpcServer {
    pipeline: Arc<DispatchPipeline>,
    config: TcpTransportConfig,
}

impl TcpRpcServer {
    #[must_use]
    pub fn new(pipeline: Arc<DispatchPipeline>, config: TcpTransportConfig) -> Self {
        Self { pipeline, config }
    }

    /// Serves `listener` until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting from the listener fails.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "rpc listener started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let pipeline = self.pipeline.clone();
                    let codec = self.config.codec();
                    tokio::spawn(serve_connection(pipeline, stream, peer, codec));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(addr = %local, "rpc listener stopped");
        Ok(())
    }
}

async fn serve_connection(
    pipeline: Arc<DispatchPipeline>,
    stream: TcpStream,
    peer: SocketAddr,
    codec: LengthDelimitedCodec,
) {
    tracing::debug!(peer = %peer, "rpc connection opened");
    let (mut sink, mut frames) = Framed::new(stream, codec).split();
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(OUTBOUND_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if let Err(e) = sink.send(bytes).await {
                tracing::debug!(peer = %peer, error = %e, "rpc write failed");
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "closing rpc connection");
                break;
            }
        };
        let message = match TransportMessage::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "undecodable frame");
                continue;
            }
        };
        let TransportContent::Invoke(mut invoke) = message.content else {
            tracing::warn!(peer = %peer, message_id = %message.id, "unexpected result frame on server side");
            continue;
        };
        // The peer address is the only caller address this listener vouches for.
        invoke
            .attachments
            .insert(attachment_keys::CALLER_ADDRESS.to_string(), peer.ip().to_string());

        let pipeline = pipeline.clone();
        let out_tx = out_tx.clone();
        let id = message.id;
        tokio::spawn(async move {
            let result = pipeline.dispatch_rpc(id.clone(), invoke).await;
            match TransportMessage::result(id, result).encode() {
                Ok(bytes) => {
                    let _ = out_tx.send(Bytes::from(bytes)).await;
                }
                Err(e) => tracing::error!(error = %e, "failed to encode result frame"),
            }
        });
    }

    drop(out_tx);
    let _ = writer.await;
    tracing::debug!(peer = %peer, "rpc connection closed");
}

#[cfg(test)]
mod tests {
    use meridian_core::{RemoteInvokeMessage, ResultStatus, Value};

    use super::*;
    use crate::service::{
        handler_fn, HttpMethod, Invocation, ServerConfig, ServiceEntry, ServiceEntryRegistry,
    };
    use crate::transport::TransportClient;

    async fn start_server() -> (SocketAddr, watch::Sender<bool>) {
        let registry = Arc::new(ServiceEntryRegistry::new());
        registry
            .replace_all(vec![ServiceEntry::builder("peer.whoami", HttpMethod::Get, "/peer")
                .handler(handler_fn(|inv: Invocation| async move {
                    Ok(Value::from(inv.caller_address.unwrap_or_default()))
                }))
                .build()
                .unwrap()])
            .unwrap();
        let pipeline = Arc::new(DispatchPipeline::new(registry, Arc::new(ServerConfig::default())));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(TcpRpcServer::new(pipeline, TcpTransportConfig::default()).serve(listener, rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn invocation_round_trips_over_tcp() {
        let (addr, _shutdown) = start_server().await;
        let client = TcpMessageSender::client(addr, &TcpTransportConfig::default())
            .await
            .unwrap();

        let result = client
            .send(RemoteInvokeMessage::new("peer.whoami", vec![]), "t-1", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.result, Some(Value::from("127.0.0.1")));

        let missing = client
            .send(RemoteInvokeMessage::new("peer.nobody", vec![]), "t-2", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(missing.status, ResultStatus::NotFound);
    }

    #[tokio::test]
    async fn claimed_caller_address_is_replaced_by_the_peer() {
        let (addr, _shutdown) = start_server().await;
        let client = TcpMessageSender::client(addr, &TcpTransportConfig::default())
            .await
            .unwrap();

        let spoofed =
            RemoteInvokeMessage::new("peer.whoami", vec![]).with_attachment(attachment_keys::CALLER_ADDRESS, "10.9.9.9");
        let result = client
            .send(spoofed, "t-3", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(result.result, Some(Value::from("127.0.0.1")));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpMessageSender::connect(addr, &TcpTransportConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connection(_)));
    }
}
