//! WebSocket handling

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use subchat_protocol::{ClientMessage, ServerMessage};

use crate::orchestrator::{Orchestrator, TurnSubscription};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages that can be sent through the WebSocket
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// A turn this connection is forwarding
struct Forwarder {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Turns owned by one connection, keyed by sub-chat id
#[derive(Default)]
struct ConnectionTurns {
    forwarders: HashMap<String, Forwarder>,
}

impl ConnectionTurns {
    /// Stop one forwarder and wait until its turn has torn down.
    async fn stop(&mut self, sub_chat_id: &str) -> bool {
        let Some(forwarder) = self.forwarders.remove(sub_chat_id) else {
            return false;
        };
        forwarder.stop.cancel();
        let _ = forwarder.task.await;
        true
    }

    async fn stop_all(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.stop.cancel();
            let _ = forwarder.task.await;
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Arc<Orchestrator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, orchestrator))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, orchestrator: Arc<Orchestrator>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut turns = ConnectionTurns::default();

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                send_json(
                    &outbound_tx,
                    ServerMessage::Error {
                        code: "parse_error".into(),
                        message: e.to_string(),
                        sub_chat_id: None,
                    },
                )
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &outbound_tx, &orchestrator, &mut turns, conn_id).await;
    }

    let owned = turns.forwarders.len();
    turns.stop_all().await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        torn_down = owned,
        "WebSocket connection closed"
    );
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    orchestrator: &Arc<Orchestrator>,
    turns: &mut ConnectionTurns,
    conn_id: u64,
) {
    match msg {
        ClientMessage::SubscribeTurn(request) => {
            let sub_chat_id = request.sub_chat_id.clone();
            info!(
                component = "websocket",
                event = "ws.turn.subscribe",
                connection_id = conn_id,
                sub_chat_id = %sub_chat_id,
                "Subscribe turn"
            );
            turns.forwarders.retain(|_, f| !f.task.is_finished());

            let subscription = orchestrator.subscribe(request);
            let stop = CancellationToken::new();
            let task = spawn_turn_forwarder(subscription, client_tx.clone(), stop.clone());
            // A live forwarder keeps its slot; the rejected duplicate runs untracked.
            if !turns.forwarders.contains_key(&sub_chat_id) {
                turns
                    .forwarders
                    .insert(sub_chat_id, Forwarder { stop, task });
            }
        }

        ClientMessage::UnsubscribeTurn { sub_chat_id } => {
            let stopped = turns.stop(&sub_chat_id).await;
            debug!(
                component = "websocket",
                event = "ws.turn.unsubscribe",
                connection_id = conn_id,
                sub_chat_id = %sub_chat_id,
                stopped = stopped,
                "Unsubscribe turn"
            );
        }

        ClientMessage::CancelTurn { sub_chat_id } => {
            let cancelled = orchestrator.cancel(&sub_chat_id);
            info!(
                component = "websocket",
                event = "ws.turn.cancel",
                connection_id = conn_id,
                sub_chat_id = %sub_chat_id,
                cancelled = cancelled,
                "Cancel turn"
            );
            send_json(
                client_tx,
                ServerMessage::TurnCancelled {
                    sub_chat_id,
                    cancelled,
                },
            )
            .await;
        }

        ClientMessage::IsTurnActive { sub_chat_id } => {
            let active = orchestrator.is_active(&sub_chat_id);
            send_json(
                client_tx,
                ServerMessage::TurnActive {
                    sub_chat_id,
                    active,
                },
            )
            .await;
        }

        ClientMessage::RespondToolApproval(response) => {
            let tool_use_id = response.tool_use_id.clone();
            let ok = orchestrator.respond_tool_approval(response);
            send_json(client_tx, ServerMessage::ToolApprovalAck { tool_use_id, ok }).await;
        }
    }
}

/// Forward one turn's chunks until `finish`, then report the outcome.
/// Stopping (unsubscribe or socket close) tears the turn down instead.
fn spawn_turn_forwarder(
    mut subscription: TurnSubscription,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sub_chat_id = subscription.turn_id().to_string();
        let detached = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break true,
                chunk = subscription.next() => match chunk {
                    Some(chunk) => {
                        let msg = ServerMessage::Chunk {
                            sub_chat_id: sub_chat_id.clone(),
                            chunk,
                        };
                        if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                            break true;
                        }
                    }
                    None => break false,
                },
            }
        };

        if detached {
            let outcome = subscription.unsubscribe().await;
            debug!(
                component = "websocket",
                event = "ws.turn.detached",
                sub_chat_id = %sub_chat_id,
                outcome = ?outcome,
                "Turn torn down after detach"
            );
            return;
        }

        let outcome = subscription.outcome().await;
        send_json(
            &outbound_tx,
            ServerMessage::TurnEnded {
                sub_chat_id,
                outcome,
            },
        )
        .await;
    })
}
