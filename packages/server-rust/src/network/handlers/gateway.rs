//! Router fallback that hands unmatched requests to the dispatch pipeline.
//!
//! Requests the pipeline does not engage for get a 404 envelope; everything
//! else is rendered from the pipeline's [`HttpResponse`].

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use meridian_core::{ErrorEnvelope, ResultStatus};

use super::AppState;
use crate::service::protocol::headers;
use crate::service::{DispatchOutcome, HttpMethod, HttpRequest, HttpResponse};

pub async fn gateway_handler(State(state): State<AppState>, request: Request) -> Response {
    if !state.shutdown.accepts_requests() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, ResultStatus::Overloaded, "node is not accepting requests");
    }
    let _guard = state.shutdown.in_flight_guard();

    let (parts, body) = request.into_parts();
    let Ok(method) = parts.method.as_str().parse::<HttpMethod>() else {
        return reject(
            StatusCode::METHOD_NOT_ALLOWED,
            ResultStatus::NotFound,
            format!("method {} is not routed", parts.method),
        );
    };
    let query = match parts.uri.query() {
        Some(_) => match Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
            Ok(Query(pairs)) => pairs,
            Err(e) => return reject(StatusCode::BAD_REQUEST, ResultStatus::BindingError, e.body_text()),
        },
        None => Vec::new(),
    };

    let mut http_request = HttpRequest::new(method, parts.uri.path());
    http_request.query = query;
    http_request.headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    http_request.caller_address = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return reject(
                StatusCode::PAYLOAD_TOO_LARGE,
                ResultStatus::BindingError,
                format!("unreadable request body: {e}"),
            )
        }
    };
    if !bytes.is_empty() {
        match serde_json::from_slice(&bytes) {
            Ok(body) => http_request.body = Some(body),
            Err(e) => {
                return reject(
                    StatusCode::BAD_REQUEST,
                    ResultStatus::BindingError,
                    format!("request body is not valid JSON: {e}"),
                )
            }
        }
    }

    let message_id = http_request
        .header(headers::REQUEST_ID)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    match state.pipeline.dispatch_http(message_id, http_request).await {
        DispatchOutcome::Handled(response) => render(response),
        DispatchOutcome::NotEngaged => reject(
            StatusCode::NOT_FOUND,
            ResultStatus::NotFound,
            format!("no route for {method} {}", parts.uri.path()),
        ),
    }
}

fn render(response: HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

fn reject(status: StatusCode, code: ResultStatus, message: impl Into<String>) -> Response {
    let envelope = ErrorEnvelope {
        status: status.as_u16(),
        ..ErrorEnvelope::new(code, message)
    };
    (status, Json(envelope)).into_response()
}
