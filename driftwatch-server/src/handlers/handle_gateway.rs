use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::gateway::messages::{self, Frame};
use crate::infra::app_state::AppState;

/// GET /api/ws, upgrade to the real-time gateway protocol.
pub async fn gateway_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One reader and one writer task per connection. The writer drains the
/// connection's bounded queue; the reader handles the subscription protocol
/// and liveness.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection = state.gateway.open_connection();
    let conn_id = connection.id;

    let writer_conn = connection.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_conn.closer.cancelled() => break,
                frame = writer_conn.next_frame() => {
                    let Ok(msg) = messages::frame_to_ws(&frame) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        let incoming = tokio::select! {
            _ = connection.closer.cancelled() => break,
            incoming = receiver.next() => incoming,
        };
        let Some(incoming) = incoming else { break };

        match incoming {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                connection.touch().await;
                match messages::ws_to_frame(&msg) {
                    Ok(frame) => handle_frame(&connection, frame).await,
                    Err(_) => {
                        connection
                            .enqueue(Frame::error("malformed frame"))
                            .await;
                    }
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                connection.touch().await;
            }
            Ok(Message::Close(_)) => {
                debug!(connection = %conn_id, "client closed");
                break;
            }
            Err(error) => {
                warn!(connection = %conn_id, %error, "gateway socket error");
                break;
            }
        }
    }

    state.gateway.remove_connection(conn_id);
    let _ = writer.await;
}

async fn handle_frame(connection: &crate::gateway::Connection, frame: Frame) {
    match frame.kind.as_str() {
        "subscribe" => match frame.topic {
            Some(topic) if messages::valid_topic(&topic) => {
                connection.subscribe(topic.clone()).await;
                connection.enqueue(Frame::ack("subscribed", &topic)).await;
            }
            Some(topic) => {
                connection
                    .enqueue(Frame::error(&format!("unknown topic '{topic}'")))
                    .await;
            }
            None => {
                connection
                    .enqueue(Frame::error("subscribe requires a topic"))
                    .await;
            }
        },
        "unsubscribe" => match frame.topic {
            Some(topic) => {
                connection.unsubscribe(&topic).await;
                connection
                    .enqueue(Frame::ack("unsubscribed", &topic))
                    .await;
            }
            None => {
                connection
                    .enqueue(Frame::error("unsubscribe requires a topic"))
                    .await;
            }
        },
        // Liveness-only frames; touch already happened.
        "heartbeat" | "ping" | "pong" => {}
        other => {
            connection
                .enqueue(Frame::error(&format!("unknown frame type '{other}'")))
                .await;
        }
    }
}
