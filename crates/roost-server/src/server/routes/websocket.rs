//! WebSocket transport adapter.
//!
//! One socket carries one agent's traffic. The agent registers its DID,
//! receives its backlog immediately, and then exchanges JSON frames until
//! the socket closes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use roost_mediator::{Envelope, OutboundMessage};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

const OUTBOUND_BUFFER: usize = 64;

/// Frames the client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    /// Claim a DID for this socket and drain its backlog.
    Register { did: String },
    /// Submit an envelope for mediation.
    Message { message: Envelope },
}

/// GET /ws
///
/// Upgrades to the mediator's WebSocket transport.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // All outgoing frames (replies and deliveries) funnel through one
    // channel so the sink has a single owner.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut registered_did: Option<String> = None;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Some(reply) =
                    handle_frame(&text, &state, &out_tx, &mut registered_did).await
                {
                    if out_tx.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("Binary WebSocket frame ignored");
            }
            Ok(Message::Ping(data)) => {
                if out_tx.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("WebSocket close requested");
                break;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    if let Some(did) = registered_did {
        if let Err(e) = state.mediator.close_channel(&did).await {
            error!(did = %did, error = %e, "Failed to close channel");
        }
        info!(did = %did, "WebSocket connection closed");
    }
    writer.abort();
}

/// Handle one text frame; returns the reply frame, if any.
async fn handle_frame(
    text: &str,
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<Message>,
    registered_did: &mut Option<String>,
) -> Option<String> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Unparseable WebSocket frame");
            return Some(error_frame(&format!("invalid frame: {e}")));
        }
    };

    match frame {
        ClientFrame::Register { did } => {
            let (tx, rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_BUFFER);
            pump_deliveries(rx, out_tx.clone());

            match state.mediator.register_channel(&did, tx).await {
                Ok(drained) => {
                    info!(did = %did, drained, "Agent registered on WebSocket");
                    *registered_did = Some(did.clone());
                    Some(json!({ "type": "registered", "did": did, "drained": drained }).to_string())
                }
                Err(e) => {
                    warn!(did = %did, error = %e, "Registration failed");
                    Some(error_frame(&e.to_string()))
                }
            }
        }
        ClientFrame::Message { message } => {
            let id = message.id.clone();
            match state.mediator.handle_inbound(message).await {
                Ok(receipt) => Some(
                    json!({ "type": "accepted", "id": id, "receipt": receipt }).to_string(),
                ),
                Err(e) => {
                    debug!(id = %id, error = %e, "Inbound envelope rejected");
                    Some(error_frame(&e.to_string()))
                }
            }
        }
    }
}

/// Forward queued and routed deliveries onto the socket's write channel.
/// The task ends when the registry drops the sender (replacement or
/// unregister) or the socket's writer goes away.
fn pump_deliveries(mut rx: mpsc::Receiver<OutboundMessage>, out_tx: mpsc::Sender<Message>) {
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = json!({ "type": "message", "message": outbound.envelope }).to_string();
            if out_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
}

fn error_frame(error: &str) -> String {
    json!({ "type": "error", "error": error }).to_string()
}
