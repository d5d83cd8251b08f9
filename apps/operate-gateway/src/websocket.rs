use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use operate_proto::{generate_id, OutboundEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{envelope, CallerConnection};
use crate::server::AppState;

pub async fn caller_ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_caller_socket(socket, state, Some(remote_addr)))
}

pub async fn handle_caller_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_addr: Option<SocketAddr>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEnvelope>();
    let connection_id = generate_id();
    let connection = CallerConnection::new(connection_id.clone(), remote_addr, tx);
    state.connections.add(connection.clone());
    counter!("operate_gateway_caller_connections_total", 1);
    info!(connection_id = %connection_id, remote_addr = ?remote_addr, "caller connected");

    let writer_connection = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %writer_connection, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %writer_connection, "caller writer finished");
    });

    connection.send(envelope::welcome(&connection_id, &state.dispatcher.actions()));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.dispatcher.dispatch(&connection, &text);
            }
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                state.dispatcher.dispatch(&connection, &text);
            }
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "caller closed websocket"
                );
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving caller message");
                break;
            }
        }
    }

    state.connections.remove(&connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "caller disconnected");
}
