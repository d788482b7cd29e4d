//! HTTP surface of the price service.

pub mod lifecycle;

use crate::core::{FetchParams, PriceResult};
use crate::fetch::FetchService;
use crate::rate_limit::{RateLimitDecision, RateLimitStore};
use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use lifecycle::LifecycleState;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub fetch: Arc<FetchService>,
    pub limiter: Arc<RateLimitStore>,
    pub lifecycle: watch::Receiver<LifecycleState>,
}

impl AppState {
    fn is_running(&self) -> bool {
        *self.lifecycle.borrow() == LifecycleState::Running
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_code: &'static str,
    error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_at: Option<DateTime<Utc>>,
}

/// Request-level failures that never reach the price source.
#[derive(Debug)]
enum ApiError {
    ShuttingDown,
    InvalidParams,
    RateLimited { retry_after: Duration },
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error_code: "shutting_down",
                    error_message: "Service is shutting down".to_string(),
                    retry_after: None,
                    reset_at: None,
                }),
            )
                .into_response(),
            ApiError::InvalidParams => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error_code: "invalid_params",
                    error_message: "At least one query parameter is required".to_string(),
                    retry_after: None,
                    reset_at: None,
                }),
            )
                .into_response(),
            ApiError::RateLimited { retry_after } => {
                let secs = retry_after_secs(retry_after);
                let reset_at = chrono::Duration::from_std(retry_after)
                    .ok()
                    .map(|wait| Utc::now() + wait);
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorBody {
                        error_code: "rate_limited",
                        error_message: format!("Too many requests, retry in {secs}s"),
                        retry_after: Some(secs),
                        reset_at,
                    }),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
        }
    }
}

/// First `X-Forwarded-For` hop when present, otherwise the peer address.
fn client_key(headers: &HeaderMap, peer: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn health(State(state): State<AppState>) -> Response {
    if state.is_running() {
        Json(serde_json::json!({ "status": "ok" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "draining" })),
        )
            .into_response()
    }
}

async fn price(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    if !state.is_running() {
        return Err(ApiError::ShuttingDown);
    }

    // Malformed requests do not spend the client's quota
    let params: FetchParams = query.into_iter().collect();
    if params.is_empty() {
        return Err(ApiError::InvalidParams);
    }

    let client = client_key(&headers, &peer);
    let decision = state.limiter.check_and_increment(&client);
    if let RateLimitDecision::Rejected { .. } = decision {
        let retry_after = decision.retry_after(state.limiter.clock().now());
        debug!(client = %client, ?retry_after, "Rejected by rate limit");
        return Err(ApiError::RateLimited { retry_after });
    }

    let result = state.fetch.fetch(&params).await;
    Ok(price_response(&result))
}

fn price_response(result: &PriceResult) -> Response {
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(result.to_record())).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/price", get(price))
        .with_state(state)
}

pub async fn bind(address: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serves until `shutdown` resolves, then waits for open connections to finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server failed")
}
