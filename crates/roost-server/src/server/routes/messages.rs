//! Message submission and queue administration.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use roost_mediator::{Envelope, QueuedMessage};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::server::{ApiError, AppState};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/messages", post(submit_message))
        .route("/api/v1/messages/broadcast", post(broadcast_message))
        .route("/api/v1/messages/pending/:did", get(pending_messages))
        .route("/api/v1/messages/stats", get(queue_stats))
        .route("/api/v1/messages/history", get(message_history))
        .route("/api/v1/messages/:id/requeue", post(requeue_message))
}

/// POST /api/v1/messages
///
/// Submit one envelope for mediation. 202 means accepted for delivery,
/// never delivered; the durable write has happened by the time the
/// response leaves.
async fn submit_message(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<Envelope>,
) -> Result<impl IntoResponse, ApiError> {
    let message_id = envelope.id.clone();
    let receipt = state.mediator.handle_inbound(envelope).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message_id": message_id, "receipt": receipt })),
    ))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    recipients: Vec<String>,
    message: Envelope,
}

/// POST /api/v1/messages/broadcast
///
/// Fan one envelope out to many recipients. Per-recipient outcomes are
/// reported individually; one recipient's failure never fails the batch.
async fn broadcast_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let outcomes = state
        .mediator
        .broadcast(&request.recipients, &request.message)
        .await?;

    let results: Vec<_> = outcomes
        .into_iter()
        .map(|(did, outcome)| json!({ "did": did, "outcome": outcome }))
        .collect();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "recipients": results.len(), "results": results })),
    ))
}

/// GET /api/v1/messages/pending/:did
async fn pending_messages(
    State(state): State<Arc<AppState>>,
    Path(did): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let messages: Vec<QueuedMessage> = state.mediator.pending_for(&did).await?;
    Ok(Json(json!({
        "did": did,
        "count": messages.len(),
        "messages": messages,
    })))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    did: Option<String>,
}

/// GET /api/v1/messages/stats?did=
///
/// Global or per-recipient status counts, plus connection totals when a
/// durable connection store is wired in.
async fn queue_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = match &query.did {
        Some(did) => state.mediator.stats_for(did).await?,
        None => state.mediator.queue_stats().await?,
    };

    let connections = match state.mediator.connection_store() {
        Some(store) => {
            let counts = store.counts().await?;
            json!({ "online": counts.online, "offline": counts.offline })
        }
        None => json!({ "online": state.mediator.active_connections(), "offline": 0 }),
    };

    Ok(Json(json!({
        "did": query.did,
        "pending": stats.pending,
        "delivered": stats.delivered,
        "failed": stats.failed,
        "total": stats.total(),
        "connections": connections,
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

/// GET /api/v1/messages/history?limit=&offset=
///
/// Newest-first page across all statuses.
async fn message_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);

    // Fetch one extra row to detect whether a further page exists.
    let mut messages = state.mediator.history(limit + 1, offset).await?;
    let has_more = messages.len() > limit;
    messages.truncate(limit);

    Ok(Json(json!({
        "limit": limit,
        "offset": offset,
        "has_more": has_more,
        "messages": messages,
    })))
}

/// POST /api/v1/messages/:id/requeue
///
/// Resurrect a terminally failed message. 404 for unknown ids, 409 when
/// the message is not in the failed state.
async fn requeue_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.mediator.requeue_failed(&id).await?;
    info!(queue_id = %id, "Message requeued by operator");
    Ok(Json(json!({ "queue_id": id, "status": "pending" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{create_test_state, create_test_state_with};
    use crate::server::create_router;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use roost_mediator::{kinds, MediatorConfig, RetryPolicy};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn envelope_json(to: &str) -> serde_json::Value {
        json!(Envelope::new(kinds::BASIC_MESSAGE, to).with_from("did:example:sender"))
    }

    #[tokio::test]
    async fn test_submit_message_accepted() {
        let state = create_test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(post_json("/api/v1/messages", envelope_json("did:example:alice")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = body_json(response).await;
        assert_eq!(json["receipt"]["kind"], "routed");
        assert_eq!(json["receipt"]["outcome"]["outcome"], "enqueued");
    }

    #[tokio::test]
    async fn test_submit_malformed_message_rejected() {
        let state = create_test_state().await;
        let app = create_router(state);

        let mut envelope = envelope_json("did:example:alice");
        envelope["to"] = json!("");

        let response = app
            .oneshot(post_json("/api/v1/messages", envelope))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broadcast_empty_recipients_rejected() {
        let state = create_test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(post_json(
                "/api/v1/messages/broadcast",
                json!({ "recipients": [], "message": envelope_json("did:example:x") }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_broadcast_reports_per_recipient_outcomes() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        let response = app
            .oneshot(post_json(
                "/api/v1/messages/broadcast",
                json!({
                    "recipients": ["did:example:a", "did:example:b"],
                    "message": envelope_json("did:example:x"),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = body_json(response).await;
        assert_eq!(json["recipients"], 2);
        assert_eq!(json["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_and_stats() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        state
            .mediator
            .handle_inbound(
                Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice")
                    .with_from("did:example:sender"),
            )
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get_req("/api/v1/messages/pending/did:example:alice"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["count"], 1);

        let response = app
            .oneshot(get_req("/api/v1/messages/stats?did=did:example:alice"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["pending"], 1);
        assert_eq!(json["total"], 1);
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        for _ in 0..3 {
            state
                .mediator
                .handle_inbound(
                    Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice")
                        .with_from("did:example:sender"),
                )
                .await
                .unwrap();
        }

        let response = app
            .oneshot(get_req("/api/v1/messages/history?limit=2&offset=0"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(json["has_more"], true);
    }

    #[tokio::test]
    async fn test_requeue_unknown_id_is_404() {
        let state = create_test_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(post_json(
                "/api/v1/messages/no-such-id/requeue",
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_requeue_pending_message_is_409() {
        let state = create_test_state().await;
        let app = create_router(state.clone());

        state
            .mediator
            .handle_inbound(
                Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice")
                    .with_from("did:example:sender"),
            )
            .await
            .unwrap();
        let pending = state.mediator.pending_for("did:example:alice").await.unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/v1/messages/{}/requeue", pending[0].queue_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_requeue_failed_message() {
        let config = MediatorConfig::default()
            .with_retry(RetryPolicy::new(Duration::ZERO, 1));
        let state = create_test_state_with(config).await;
        let app = create_router(state.clone());

        state
            .mediator
            .handle_inbound(
                Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice")
                    .with_from("did:example:sender"),
            )
            .await
            .unwrap();
        let worker = state.mediator.delivery_worker(CancellationToken::new());
        worker.sweep().await.unwrap();

        let failed = state.mediator.history(10, 0).await.unwrap();
        let response = app
            .oneshot(post_json(
                &format!("/api/v1/messages/{}/requeue", failed[0].queue_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
