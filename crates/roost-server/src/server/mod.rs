//! HTTP/WebSocket front end for the mediator.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use roost_mediator::{metrics, Mediator, MediatorError};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

pub mod routes;

/// Server application state shared by every route.
pub struct AppState {
    pub mediator: Arc<Mediator>,
}

impl AppState {
    pub fn new(mediator: Arc<Mediator>) -> Self {
        Self { mediator }
    }
}

/// Mediator error wrapped for HTTP responses.
pub struct ApiError(pub MediatorError);

impl From<MediatorError> for ApiError {
    fn from(err: MediatorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MediatorError::Malformed(_) | MediatorError::EmptyRecipients => {
                StatusCode::BAD_REQUEST
            }
            MediatorError::NotFound(_) => StatusCode::NOT_FOUND,
            MediatorError::InvalidState(_) => StatusCode::CONFLICT,
            MediatorError::MediationDenied(_) => StatusCode::FORBIDDEN,
            MediatorError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Start the HTTP server and run until the token is cancelled.
pub async fn start(
    mediator: Arc<Mediator>,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(AppState::new(mediator));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Create the axum router with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(routes::websocket::websocket_handler))
        .merge(routes::messages::router())
        .merge(routes::connections::router())
        .merge(routes::mediation::router())
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// GET /health
///
/// Liveness for load balancers; always 200 while the process runs.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "roost-server",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": state.mediator.active_connections(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /ready
///
/// Readiness: a store round trip must succeed.
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.mediator.queue_stats().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// GET /metrics
///
/// Prometheus text exposition.
async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
