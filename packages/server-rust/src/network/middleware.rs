//! HTTP middleware wrapped around the gateway router.
//!
//! Outermost first: assign `x-request-id`, trace, bound the request time,
//! echo `x-request-id` on the response. The request id becomes the message
//! id of the dispatched call.

use axum::http::header::HeaderName;
use axum::http::StatusCode;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::GatewayConfig;
use crate::service::protocol::headers;

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<TraceLayer<SharedClassifier<ServerErrorsAsFailures>>, Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>>,
    >,
>;

#[must_use]
pub fn build_http_layers(config: &GatewayConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(headers::REQUEST_ID);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}
