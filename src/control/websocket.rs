// ABOUTME: WebSocket endpoint for operator tools: JSON verbs in, acknowledgments and live events out
// ABOUTME: Each client gets a writer task (acks + broadcast events) and a reader task (verbs)

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chirp_core::{ControlAck, ControlEvent, ControlVerb};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use super::ControlState;

// =============================================================================
// WebSocket Messages
// =============================================================================

/// Messages from the server to the client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack { ack: ControlAck },
    Event { event: ControlEvent },
    Error { message: String },
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize control frame");
            None
        }
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// WebSocket upgrade handler at /control/ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ControlState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: ControlState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(64);
    let mut events = state.handle.subscribe();
    tracing::info!("Control client connected");

    // Writer task: acks and relayed events
    let mut writer_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                direct = rx.recv() => match direct {
                    Some(frame) => frame,
                    None => break,
                },
                relayed = events.recv() => match relayed {
                    Ok(event) => ServerFrame::Event { event },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Control client lagging, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let Some(json) = encode(&frame) else {
                continue;
            };
            if ws_sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Reader task: verbs from the client
    let handle = state.handle.clone();
    let mut reader_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                Message::Text(text) => {
                    let verb: ControlVerb = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::debug!(error = %e, "Invalid control message from client");
                            let frame = ServerFrame::Error {
                                message: format!("invalid verb: {}", e),
                            };
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let name = verb.as_str();
                    let frame = match handle.request(verb).await {
                        Ok(ack) => ServerFrame::Ack { ack },
                        Err(e) => ServerFrame::Error {
                            message: format!("{} failed: {}", name, e),
                        },
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut writer_task => reader_task.abort(),
        _ = &mut reader_task => writer_task.abort(),
    }

    tracing::info!("Control client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chirp_core::ConnectionState;

    #[test]
    fn test_ack_frame_serialize() {
        let ack = ControlAck::ok(&ControlVerb::DisablePlugin { name: "dice".to_string() }, "dice disabled");
        let json = serde_json::to_value(ServerFrame::Ack { ack }).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["ack"]["verb"], "DISABLE_PLUGIN");
        assert_eq!(json["ack"]["ok"], true);
    }

    #[test]
    fn test_event_frame_serialize() {
        let event = ControlEvent::Connection {
            state: ConnectionState::Connected,
            detail: None,
        };
        let json = serde_json::to_value(ServerFrame::Event { event }).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["type"], "connection");
        assert_eq!(json["event"]["state"], "connected");
    }
}
