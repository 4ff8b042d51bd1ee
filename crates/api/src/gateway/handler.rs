//! WebSocket handler for Axum
//!
//! Upgrades first, then accepts; a refused accept is reported to the
//! client as a close frame carrying the close reason and its code.

use std::borrow::Cow;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use liverelay_shared::{SessionId, UserId};
use serde::Deserialize;
use uuid::Uuid;

use super::events::{CloseReason, ServerMessage};
use super::OverlayGateway;
use crate::auth::OptionalUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OverlayQuery {
    session_id: Uuid,
    token: Option<String>,
}

fn close_frame(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: Cow::Borrowed(reason.as_str()),
    }))
}

/// WebSocket handler - upgrades HTTP connection to an overlay stream
pub async fn overlay_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    OptionalUser(identity): OptionalUser,
    Query(params): Query<OverlayQuery>,
) -> Response {
    let session_id = SessionId::from(params.session_id);
    let gateway = state.gateway.clone();

    ws.on_upgrade(move |socket| handle_socket(socket, gateway, session_id, identity, params.token))
}

/// Handle individual overlay connection
async fn handle_socket(
    mut socket: WebSocket,
    gateway: OverlayGateway,
    session_id: SessionId,
    identity: Option<UserId>,
    token: Option<String>,
) {
    let subscription = match gateway
        .accept(session_id, identity.as_ref(), token.as_deref())
        .await
    {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::info!(session_id = %session_id, error = %e, "Overlay rejected");
            let _ = socket.send(close_frame(e.close_reason())).await;
            return;
        }
    };
    let subscription_id = subscription.subscription_id;

    let (mut sender, mut receiver) = socket.split();

    // Spawn task to send messages to client
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = subscription.next_message().await {
            let closing = match &message {
                ServerMessage::Closed { reason } => Some(*reason),
                _ => None,
            };

            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        return; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to serialize overlay message");
                }
            }

            if let Some(reason) = closing {
                let _ = sender.send(close_frame(reason)).await;
                return;
            }
        }
    });

    // Overlay clients only listen; inbound frames are read to notice the close
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.disconnect(session_id, subscription_id).await;
}
