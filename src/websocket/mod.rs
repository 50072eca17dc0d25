use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::hub::Subscription;
use crate::models::{SectionId, TrainId};
use crate::AppState;

/// Control messages a streaming client may send after connecting.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    SubscribeAll,
    SubscribeTrains { train_ids: Vec<TrainId> },
    SubscribeSections { section_ids: Vec<SectionId> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Connected { client_id: String },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// WebSocket upgrade endpoint. The caller authenticates with a session token
/// in the query string, since browsers cannot set headers on WS upgrades.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, StatusCode> {
    let claims = state
        .auth_service
        .validate_token(&query.token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    info!("websocket upgrade for controller {}", claims.sub);
    Ok(ws.on_upgrade(|socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection = state.hub.register(HashSet::new()).await;
    let client_id = connection.id.clone();

    let (mut sender, mut receiver) = socket.split();

    let connected = ServerMessage::Connected {
        client_id: client_id.clone(),
    };
    if let Ok(text) = serde_json::to_string(&connected) {
        if sender.send(Message::Text(text)).await.is_err() {
            warn!("client {} vanished before the handshake", client_id);
            state.hub.unregister(&client_id).await;
            return;
        }
    }

    // Outgoing: drain the hub backlog for this connection.
    let outgoing_connection = connection.clone();
    let outgoing = tokio::spawn(async move {
        while let Some(event) = outgoing_connection.next_event().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("failed to serialize event: {}", e),
            }
        }
    });

    // Incoming: subscription changes until the client hangs up.
    let incoming_connection = connection.clone();
    let incoming_id = client_id.clone();
    let incoming = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::SubscribeAll) => {
                        incoming_connection.add_subscription(Subscription::All);
                    }
                    Ok(ClientMessage::SubscribeTrains { train_ids }) => {
                        for id in train_ids {
                            incoming_connection.add_subscription(Subscription::Train(id));
                        }
                    }
                    Ok(ClientMessage::SubscribeSections { section_ids }) => {
                        for id in section_ids {
                            incoming_connection.add_subscription(Subscription::Section(id));
                        }
                    }
                    Err(e) => {
                        warn!("client {} sent an unparseable message: {}", incoming_id, e);
                    }
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    warn!("websocket error for client {}: {}", incoming_id, e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = outgoing => {},
        _ = incoming => {},
    }

    state.hub.unregister(&client_id).await;
}
