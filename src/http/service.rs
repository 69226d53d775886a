//! Rate limit check handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Span};

use crate::error::BouncerError;
use crate::ratelimit::{Decision, RateLimiter, Subject};

/// Message returned with every denial.
const BLOCKED_MESSAGE: &str = "Too many attempts. Please try again later.";

/// Shared state for the handlers.
#[derive(Clone)]
pub struct AppState {
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Class applied by `/rate-limit-check`
    check_class: Arc<str>,
}

impl AppState {
    /// Create handler state around a limiter.
    pub fn new(limiter: Arc<RateLimiter>, check_class: &str) -> Self {
        Self {
            limiter,
            check_class: Arc::from(check_class),
        }
    }
}

/// Body of `POST /rate-limit-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitCheckRequest {
    /// Client IP address
    pub subject_ip: String,
    /// Email the attempt is for, if any
    #[serde(default)]
    pub subject_email: Option<String>,
    /// Class to check against instead of the configured check class
    /// (e.g. `email` for verification sends)
    #[serde(default)]
    pub class: Option<String>,
}

/// Body of `POST /route-check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteCheckRequest {
    /// Request path, query string allowed
    pub path: String,
    /// Client IP address
    pub subject_ip: String,
    /// Authenticated account, if any
    #[serde(default)]
    pub account_id: Option<String>,
}

/// Response body of both check endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    /// Whether the request may proceed
    pub success: bool,
    /// Class the request was counted under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Attempts counted in the current window, this one included
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u64>,
    /// Attempts left in the current window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Set on denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    /// Seconds until the caller may retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<u64>,
    /// Client-facing reason for a failure or denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the router for the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rate-limit-check", post(rate_limit_check))
        .route("/route-check", post(route_check))
        .route("/health", get(health))
        .with_state(state)
}

/// Error side of a handler. Only client-safe text leaves the process.
enum ApiError {
    Bouncer(BouncerError),
    /// The request itself is unusable (bad JSON, unknown class)
    Rejected(StatusCode, String),
}

impl From<BouncerError> for ApiError {
    fn from(e: BouncerError) -> Self {
        ApiError::Bouncer(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Rejected(status, msg) => (status, msg),
            ApiError::Bouncer(BouncerError::InvalidSubject(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Bouncer(other) => {
                error!(error = %other, "Rate limit check failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "rate limit check unavailable".to_string(),
                )
            }
        };

        let body = CheckResponse {
            success: false,
            error: Some(message),
            ..Default::default()
        };
        (status, Json(body)).into_response()
    }
}

/// Turn a decision into a 200 or a 429 with `Retry-After`.
fn decision_response(decision: Decision, class: Option<String>) -> Response {
    if decision.allowed {
        let body = CheckResponse {
            success: true,
            class,
            attempts: Some(decision.attempts),
            remaining: Some(decision.remaining),
            ..Default::default()
        };
        return (StatusCode::OK, Json(body)).into_response();
    }

    let retry_after = decision.retry_after_seconds.unwrap_or(0);
    let body = CheckResponse {
        success: false,
        class,
        attempts: Some(decision.attempts),
        remaining: Some(0),
        blocked: Some(true),
        remaining_time: Some(retry_after),
        error: Some(BLOCKED_MESSAGE.to_string()),
    };
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(body),
    )
        .into_response()
}

/// Guard for login-style flows: checks the client IP and, when given, the
/// email under the requested class or the configured check class.
#[instrument(skip_all)]
async fn rate_limit_check(
    State(state): State<AppState>,
    payload: Result<Json<RateLimitCheckRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;

    let mut subjects = vec![Subject::ip(&body.subject_ip)?];
    if let Some(email) = body.subject_email.as_deref() {
        subjects.push(Subject::email(email)?);
    }

    let classifier = state.limiter.classifier();
    let class = match body.class.as_deref() {
        Some(requested) => classifier.class(requested).cloned().ok_or_else(|| {
            ApiError::Rejected(
                StatusCode::BAD_REQUEST,
                format!("unknown rate limit class '{}'", requested),
            )
        })?,
        None => classifier.class(&state.check_class).cloned().ok_or_else(|| {
            BouncerError::Config(format!("check class '{}' is not configured", state.check_class))
        })?,
    };

    debug!(class = %class.name, subjects = subjects.len(), "Processing rate limit check");

    let checks: Vec<_> = subjects.into_iter().map(|s| (s, class.clone())).collect();
    let decision = state.limiter.check(&checks).await?;

    info!(
        class = %class.name,
        allowed = decision.allowed,
        attempts = decision.attempts,
        "Rate limit decision made"
    );

    Ok(decision_response(decision, body.class.map(|_| class.name)))
}

/// Guard for API routes: classifies the path and checks the client IP and,
/// when given, the account under the matched class.
#[instrument(skip_all, fields(path = tracing::field::Empty))]
async fn route_check(
    State(state): State<AppState>,
    payload: Result<Json<RouteCheckRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;
    Span::current().record("path", body.path.as_str());

    let mut subjects = vec![Subject::ip(&body.subject_ip)?];
    if let Some(account) = body.account_id.as_deref() {
        subjects.push(Subject::account(account)?);
    }

    let (class, decision) = state.limiter.check_path(&body.path, subjects).await?;

    info!(
        class = %class.name,
        allowed = decision.allowed,
        attempts = decision.attempts,
        "Route rate limit decision made"
    );

    Ok(decision_response(decision, Some(class.name)))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
