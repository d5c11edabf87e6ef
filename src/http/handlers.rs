//! Request handlers for the protected resource and policy updates.

use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::TollgateError;
use crate::ratelimit::{RateLimiter, RequestInfo};

/// Form body accepted by the policy endpoints.
///
/// Fields are kept as strings so malformed numbers produce a 400 with a
/// useful message instead of an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct LimitForm {
    pub limit: Option<String>,
    /// Window length in seconds
    pub window: Option<String>,
}

impl LimitForm {
    fn parse(&self) -> Result<(u64, Duration), String> {
        let (Some(limit), Some(window)) = (&self.limit, &self.window) else {
            return Err("Invalid request body.".to_string());
        };

        let limit = limit
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("Invalid limit: {}", limit))?;
        let window = window
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("Invalid window: {}", window))?;

        Ok((limit, Duration::from_secs(window)))
    }
}

/// Build the application router.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/api/resource", get(get_resource))
        .route("/api/limit", post(change_limit))
        .route("/api/limit/default", post(change_default_limit))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(limiter)
}

fn request_info(connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap) -> RequestInfo {
    RequestInfo {
        peer: connect_info.map(|ConnectInfo(addr)| addr),
        headers,
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn error_response(err: &TollgateError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn parse_form(form: Result<Form<LimitForm>, FormRejection>) -> Result<(u64, Duration), Response> {
    let Form(form) = form.map_err(|rejection| {
        warn!(error = %rejection, "Rejected policy update body");
        bad_request("Invalid request body.".to_string())
    })?;
    form.parse().map_err(bad_request)
}

#[instrument(skip_all)]
async fn get_resource(
    State(limiter): State<Arc<RateLimiter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let result = limiter.allow(&request_info(connect_info, headers)).await;

    if result.admitted {
        (
            StatusCode::OK,
            Json(json!({ "data": "This is a rate-limited resource." })),
        )
            .into_response()
    } else {
        info!(
            identity = %result.identity,
            reason = %result.reason,
            "Client has reached its rate limit"
        );
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Rate limit exceeded." })),
        )
            .into_response()
    }
}

#[instrument(skip_all)]
async fn change_limit(
    State(limiter): State<Arc<RateLimiter>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    form: Result<Form<LimitForm>, FormRejection>,
) -> Response {
    let (limit, window) = match parse_form(form) {
        Ok(values) => values,
        Err(response) => return response,
    };

    let identity = limiter.resolve(&request_info(connect_info, headers));
    match limiter.update_policy(&identity, limit, window).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "data": "Rate limit has been changed." })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[instrument(skip_all)]
async fn change_default_limit(
    State(limiter): State<Arc<RateLimiter>>,
    form: Result<Form<LimitForm>, FormRejection>,
) -> Response {
    let (limit, window) = match parse_form(form) {
        Ok(values) => values,
        Err(response) => return response,
    };

    match limiter.update_default_policy(limit, window) {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "data": "Default rate limit has been changed." })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}
