//! HTTP gateway lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the listener and
//! `serve()` accepts requests until shutdown. The split lets the node wire
//! the shutdown controller into the RPC listener and the recovery worker
//! before any request is accepted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::GatewayConfig;
use super::handlers::{gateway_handler, health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::DispatchPipeline;

pub struct GatewayModule {
    config: GatewayConfig,
    listener: Option<TcpListener>,
    pipeline: Arc<DispatchPipeline>,
    shutdown: Arc<ShutdownController>,
}

impl GatewayModule {
    #[must_use]
    pub fn new(config: GatewayConfig, pipeline: Arc<DispatchPipeline>) -> Self {
        Self::with_shutdown(config, pipeline, Arc::new(ShutdownController::new()))
    }

    /// Shares an existing controller, e.g. with the RPC listener.
    #[must_use]
    pub fn with_shutdown(
        config: GatewayConfig,
        pipeline: Arc<DispatchPipeline>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            listener: None,
            pipeline,
            shutdown,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - anything else goes to the dispatch pipeline
    pub fn build_router(&self) -> Router {
        let state = AppState::new(
            Arc::clone(&self.pipeline),
            Arc::clone(&self.shutdown),
            self.config.clone(),
        );

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback(gateway_handler)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "gateway listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests for
    /// up to `drain_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails.
    pub async fn serve(mut self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let Some(listener) = self.listener.take() else {
            anyhow::bail!("start() must be called before serve()");
        };
        let router = self.build_router();
        let controller = self.shutdown;

        controller.set_ready();
        info!("gateway serving");

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        controller.trigger_shutdown();
        if controller.wait_for_drain(self.config.drain_timeout).await {
            info!("gateway drained");
        } else {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain timed out with requests still in flight"
            );
        }
        Ok(())
    }
}
