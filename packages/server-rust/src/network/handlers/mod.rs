//! Axum handlers of the gateway and the state they share.

pub mod gateway;
pub mod health;

pub use gateway::gateway_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{GatewayConfig, ShutdownController};
use crate::service::DispatchPipeline;

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DispatchPipeline>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<GatewayConfig>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(pipeline: Arc<DispatchPipeline>, shutdown: Arc<ShutdownController>, config: GatewayConfig) -> Self {
        Self {
            pipeline,
            shutdown,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}
