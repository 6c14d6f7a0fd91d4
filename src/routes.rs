use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ratelimit::{RateGovernor, Rejection, RouteLimit};
use crate::scheduler::Pipeline;
use crate::storage::read_result;

pub const FETCH_LIMIT: RouteLimit = RouteLimit::new(2, Duration::from_secs(24 * 3600));
pub const FEED_LIMIT: RouteLimit = RouteLimit::new(5, Duration::from_secs(2 * 60));

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub governor: Arc<RateGovernor>,
    pub secret_key: String,
}

/// State for one route's rate-limit layer.
#[derive(Clone)]
pub struct RouteGuard {
    governor: Arc<RateGovernor>,
    limit: RouteLimit,
}

impl RouteGuard {
    pub fn new(governor: Arc<RateGovernor>, limit: RouteLimit) -> Self {
        Self { governor, limit }
    }
}

// Custom error type
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = match self {
            Rejection::InvalidRate => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::Blocked { .. } => StatusCode::TOO_MANY_REQUESTS,
        };
        AppError::new(status, self.to_string()).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let fetch_guard = RouteGuard::new(state.governor.clone(), FETCH_LIMIT);
    let feed_guard = RouteGuard::new(state.governor.clone(), FEED_LIMIT);

    Router::new()
        .route(
            "/fetch",
            get(fetch).layer(middleware::from_fn_with_state(fetch_guard, rate_limit)),
        )
        .route(
            "/feed",
            get(feed).layer(middleware::from_fn_with_state(feed_guard, rate_limit)),
        )
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn rate_limit(
    State(guard): State<RouteGuard>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_identity(&request);
    match guard.governor.check(&client, guard.limit) {
        Ok(()) => next.run(request).await,
        Err(rejection) => rejection.into_response(),
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
fn client_identity(request: &Request) -> String {
    let headers = request.headers();
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Deserialize)]
pub struct FetchQuery {
    #[serde(default)]
    pub key: String,
}

pub async fn fetch(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FetchQuery>,
) -> Result<impl IntoResponse, AppError> {
    if state.secret_key.is_empty() || query.key != state.secret_key {
        return Err(AppError::new(StatusCode::FORBIDDEN, "invalid access key"));
    }

    let Some(permit) = state.pipeline.try_begin() else {
        return Err(AppError::new(
            StatusCode::TOO_EARLY,
            "a crawl is already running, try again later",
        ));
    };

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        info!("Crawl triggered over HTTP");
        match pipeline.run(permit).await {
            Ok(result) => info!(
                "HTTP-triggered crawl finished: {} articles",
                result.meta.article_count
            ),
            Err(e) => error!("HTTP-triggered crawl failed: {}", e),
        }
    });

    Ok(Json(json!({ "message": "crawl started" })))
}

pub async fn feed(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let path = state.pipeline.output_file();
    let data = read_result(path).await.map_err(|e| {
        error!("Failed to read {}: {}", path.display(), e);
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to read feed data, try again later",
        )
    })?;

    Ok(([(header::CONTENT_TYPE, "application/json")], data))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}
