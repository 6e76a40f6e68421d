//! Web API Server
//!
//! HTTP surface over a shared [`Router`].
//!
//! ## Endpoints
//!
//! - `POST /route`: Route a prompt and return the response envelope
//! - `POST /complexity`: Estimate complexity without routing
//! - `GET  /stats`: Ledger snapshot and cache statistics
//! - `GET  /health`: Per-adapter liveness (503 when nothing is live)
//! - `GET  /metrics`: Prometheus metrics

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::router::{HealthReport, RouteResponse, Router, RouterStats};
use crate::routing::ComplexityFactors;
use crate::{AttemptFailure, RouteRequest, RouterError, Tier};

// ============================================================================
// Types
// ============================================================================

/// JSON body for `POST /route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBody {
    /// The prompt to route.
    pub prompt: String,
    /// Optional tier override (`cheap`, `mid`, `premium` or an alias).
    #[serde(default)]
    pub forced_backend: Option<String>,
    /// Optional caller-supplied request id.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// JSON body for `POST /complexity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityBody {
    /// The prompt to score.
    pub prompt: String,
}

/// JSON response for `POST /complexity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityResponse {
    /// Score in `[0, 1]`.
    pub complexity: f64,
    /// Human-readable rationale.
    pub reasoning: String,
    /// Per-factor subscores.
    pub factors: ComplexityFactors,
}

/// Request id resolved by [`request_id_middleware`].
#[derive(Debug, Clone)]
struct RequestId(String);

/// Shared application state available to all handlers.
#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
}

// ============================================================================
// Server
// ============================================================================

/// Build the axum application over `router`.
///
/// Exposed separately from [`start_server`] so it can be driven in-process.
pub fn app(router: Arc<Router>, max_request_size: usize) -> axum::Router {
    axum::Router::new()
        .route("/route", post(route_handler))
        .route("/complexity", post(complexity_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(AppState { router })
}

/// Start the web API server.
///
/// Binds to `config.host:config.port` and blocks until the server shuts down.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    config: &ServerConfig,
    router: Arc<Router>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Router API ready on http://{}", addr);
    axum::serve(listener, app(router, config.max_request_size)).await?;
    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Echoes the client's `X-Request-ID`, or a fresh UUID v4, on every response,
/// and hands the same id to the handler.
async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({
                    "error": "payload_too_large",
                    "message": format!("request body exceeds {max_size} bytes"),
                })),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Handlers
// ============================================================================

async fn route_handler(
    State(state): State<AppState>,
    header_id: Option<Extension<RequestId>>,
    Json(body): Json<RouteBody>,
) -> Result<Json<RouteResponse>, AppError> {
    let mut request = RouteRequest::new(body.prompt);
    if let Some(tier) = body.forced_backend.as_deref() {
        request = request.with_forced_backend(tier.parse::<Tier>()?);
    }
    let id = body
        .request_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| header_id.map(|Extension(RequestId(id))| id));
    if let Some(id) = id {
        request = request.with_request_id(id);
    }
    Ok(Json(state.router.handle(request).await?))
}

async fn complexity_handler(
    State(state): State<AppState>,
    Json(body): Json<ComplexityBody>,
) -> Result<Json<ComplexityResponse>, AppError> {
    let estimate = state.router.estimate(&body.prompt)?;
    Ok(Json(ComplexityResponse {
        complexity: estimate.score,
        reasoning: estimate.reasoning,
        factors: estimate.factors,
    }))
}

async fn stats_handler(State(state): State<AppState>) -> Json<RouterStats> {
    Json(state.router.stats())
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.router.health().await;
    let status = if report.any_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error Type
// ============================================================================

/// Wraps a [`RouterError`] for conversion into an HTTP response.
#[derive(Debug)]
struct AppError(RouterError);

impl From<RouterError> for AppError {
    fn from(e: RouterError) -> Self {
        AppError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<&'a [AttemptFailure]>,
}

fn status_for(e: &RouterError) -> StatusCode {
    match e {
        RouterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RouterError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        RouterError::ExhaustedFailed { .. } => StatusCode::BAD_GATEWAY,
        RouterError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RouterError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::Config(_) | RouterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let attempts = match &self.0 {
            RouterError::ExhaustedFailed { attempts } => Some(attempts.as_slice()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
            attempts,
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
