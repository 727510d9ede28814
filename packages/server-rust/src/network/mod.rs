//! HTTP gateway: configuration, middleware, handlers and graceful shutdown.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::GatewayConfig;
pub use handlers::AppState;
pub use module::GatewayModule;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
