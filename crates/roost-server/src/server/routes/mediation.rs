//! Mediation grant administration.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use roost_mediator::MediatorError;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::server::{ApiError, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/mediation", get(list_grants))
        .route(
            "/api/v1/mediation/:did",
            get(get_grant).post(set_grant),
        )
}

/// GET /api/v1/mediation
async fn list_grants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let grants = state.mediator.mediation_grants().await?;
    Ok(Json(json!({ "count": grants.len(), "grants": grants })))
}

/// GET /api/v1/mediation/:did
async fn get_grant(
    State(state): State<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.mediator.policy().status(&did).await? {
        Some(grant) => Ok(Json(json!(grant))),
        None => Err(MediatorError::not_found(&did).into()),
    }
}

#[derive(Debug, Deserialize)]
struct SetGrantRequest {
    granted: bool,
    reason: Option<String>,
}

/// POST /api/v1/mediation/:did
///
/// Operator override of the mediation decision for one DID. Works in
/// both directions; a previously denied agent can be granted later.
async fn set_grant(
    State(state): State<Arc<AppState>>,
    Path(did): Path<String>,
    Json(request): Json<SetGrantRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let policy = state.mediator.policy();
    if request.granted {
        policy.grant(&did, request.reason.as_deref()).await?;
    } else {
        policy.deny(&did, request.reason.as_deref()).await?;
    }
    info!(did = %did, granted = request.granted, "Mediation grant updated");

    let grant = policy
        .status(&did)
        .await?
        .ok_or_else(|| MediatorError::not_found(&did))?;
    Ok(Json(json!(grant)))
}
