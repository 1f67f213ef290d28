//! Connection history for the admin surface.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use roost_mediator::MediatorError;
use serde_json::json;

use crate::server::{ApiError, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/connections", get(list_connections))
        .route("/api/v1/connections/:did", get(get_connection))
}

/// GET /api/v1/connections
///
/// Durable connection history, last-seen descending, with the in-memory
/// registry's view of which channels are live right now.
async fn list_connections(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let history = match state.mediator.connection_store() {
        Some(store) => store.list().await?,
        None => Vec::new(),
    };
    Ok(Json(json!({
        "active": state.mediator.registry_snapshot(),
        "history": history,
    })))
}

/// GET /api/v1/connections/:did
async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = match state.mediator.connection_store() {
        Some(store) => store.get(&did).await?,
        None => None,
    };
    let Some(record) = record else {
        return Err(MediatorError::not_found(&did).into());
    };
    Ok(Json(json!({
        "record": record,
        "live": state.mediator.registry().is_active(&did),
    })))
}
