//! `/ws/agent`: where desktop agents join the client pool.
//!
//! An agent must open with a `register` request. Until then only `ping` is
//! answered; anything else is rejected. Once registered, the socket feeds
//! responses and events into the registry and the registry writes requests
//! back through a [`ChannelTransport`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_transport::{AgentTransport, ChannelTransport, OutboundFrame};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use operate_proto::{AgentFrame, RegisterAck, RegisterParams, RequestFrame, ResponseFrame, REGISTER_ACTION};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::now_millis;
use crate::registry::{ClientMetadata, ClientRegistry};
use crate::server::AppState;

#[derive(Debug, Error)]
enum HandshakeError {
    #[error("agent did not register in time")]
    TimedOut,
    #[error("agent closed socket before registering")]
    SocketClosed,
    #[error("agent closed socket during registration: {0:?}")]
    Closed(Option<String>),
    #[error("invalid register params: {0}")]
    InvalidParams(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HandshakeError {
    fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::Closed(_) => "client_closed",
            HandshakeError::InvalidParams(_) => "invalid_params",
            HandshakeError::Protocol(_) => "protocol_error",
        }
    }
}

pub async fn agent_ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_agent_socket(
            socket,
            state.registry.clone(),
            state.handshake_timeout,
            Some(remote_addr),
        )
    })
}

pub async fn handle_agent_socket(
    socket: WebSocket,
    registry: ClientRegistry,
    handshake_timeout: Duration,
    remote_addr: Option<SocketAddr>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let started = Instant::now();
    let registration = timeout(handshake_timeout, await_registration(&mut ws_tx, &mut ws_rx)).await;
    let (request_id, params) = match registration {
        Ok(Ok(registration)) => registration,
        Ok(Err(err)) => return reject(ws_tx, err).await,
        Err(_) => return reject(ws_tx, HandshakeError::TimedOut).await,
    };

    let (transport, mut outbound) = ChannelTransport::new();
    if let Some(addr) = remote_addr {
        transport.set_label(addr.to_string());
    }
    let transport = Arc::new(transport);
    let machine_name = params.machine_name.clone();
    let client_id = registry.register_client(transport.clone(), ClientMetadata::from(params));

    let ack = RegisterAck {
        client_id: client_id.clone(),
        server_time: now_millis(),
    };
    let ack = ResponseFrame::ok(request_id, serde_json::json!(ack));
    if let Err(err) = send_frame(&mut ws_tx, &AgentFrame::Response(ack)).await {
        warn!(client_id = %client_id, error = %err, "failed to acknowledge registration");
        registry.unregister_client(&client_id);
        return;
    }
    counter!("operate_gateway_agent_handshakes_total", 1, "outcome" => "success");
    histogram!(
        "operate_gateway_agent_handshake_duration_ms",
        started.elapsed().as_secs_f64() * 1000.0
    );
    info!(
        client_id = %client_id,
        machine_name = %machine_name,
        remote_addr = ?remote_addr,
        "agent connected"
    );

    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                OutboundFrame::Data(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(client_id = %writer_client, "agent writer finished");
    });

    while let Some(message) = ws_rx.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => AgentFrame::from_slice(text.as_bytes()),
            Ok(Message::Binary(bytes)) => AgentFrame::from_slice(&bytes),
            Ok(Message::Close(frame)) => {
                debug!(
                    client_id = %client_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "agent closed websocket"
                );
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                registry.update_heartbeat(&client_id);
                continue;
            }
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "agent socket error");
                break;
            }
        };

        if !registry.update_heartbeat(&client_id) {
            debug!(client_id = %client_id, "agent no longer registered; dropping socket");
            break;
        }
        match frame {
            Ok(AgentFrame::Response(response)) => {
                registry.handle_response(response);
            }
            Ok(AgentFrame::Event(event)) => registry.handle_event(&client_id, event),
            Ok(AgentFrame::Ping) => reply(transport.as_ref(), &AgentFrame::Pong),
            Ok(AgentFrame::Pong) => {}
            Ok(AgentFrame::Request(request)) => {
                let response = unsupported_request(&request);
                reply(transport.as_ref(), &AgentFrame::Response(response));
            }
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "ignoring malformed agent frame");
            }
        }
    }

    registry.unregister_client(&client_id);
    writer.abort();
    info!(client_id = %client_id, peer = ?transport.label(), "agent disconnected");
}

/// Read frames until a valid `register` request arrives.
async fn await_registration(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<(String, RegisterParams), HandshakeError> {
    loop {
        let message = ws_rx
            .next()
            .await
            .ok_or(HandshakeError::SocketClosed)?
            .map_err(|err| HandshakeError::Protocol(err.to_string()))?;
        let frame = match message {
            Message::Text(text) => AgentFrame::from_slice(text.as_bytes()),
            Message::Binary(bytes) => AgentFrame::from_slice(&bytes),
            Message::Close(frame) => {
                return Err(HandshakeError::Closed(frame.map(|f| f.reason.to_string())))
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match frame {
            Ok(AgentFrame::Request(request)) if request.action == REGISTER_ACTION => {
                let params: RegisterParams = serde_json::from_value(request.params)
                    .map_err(|err| HandshakeError::InvalidParams(err.to_string()))?;
                return Ok((request.id, params));
            }
            Ok(AgentFrame::Ping) => {
                send_frame(ws_tx, &AgentFrame::Pong)
                    .await
                    .map_err(|err| HandshakeError::Protocol(err.to_string()))?;
            }
            Ok(AgentFrame::Request(request)) => {
                debug!(action = %request.action, "rejecting request from unregistered agent");
                let response = ResponseFrame::err(
                    request.id,
                    "NOT_REGISTERED",
                    "send a register request first",
                );
                send_frame(ws_tx, &AgentFrame::Response(response))
                    .await
                    .map_err(|err| HandshakeError::Protocol(err.to_string()))?;
            }
            Ok(other) => {
                debug!(frame = ?other, "ignoring frame from unregistered agent");
            }
            Err(err) => {
                debug!(error = %err, "ignoring malformed frame from unregistered agent");
            }
        }
    }
}

async fn reject(mut ws_tx: SplitSink<WebSocket, Message>, err: HandshakeError) {
    counter!("operate_gateway_agent_handshakes_total", 1, "outcome" => err.metric_label());
    warn!(error = %err, "agent registration failed");
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: err.to_string().into(),
        })))
        .await;
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    frame: &AgentFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(text)).await
}

fn reply(transport: &ChannelTransport, frame: &AgentFrame) {
    match frame.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = transport.send(Bytes::from(bytes)) {
                debug!(error = %err, "agent transport closed before reply");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode agent reply"),
    }
}

fn unsupported_request(request: &RequestFrame) -> ResponseFrame {
    if request.action == REGISTER_ACTION {
        ResponseFrame::err(request.id.clone(), "ALREADY_REGISTERED", "agent is already registered")
    } else {
        ResponseFrame::err(
            request.id.clone(),
            "UNSUPPORTED",
            format!("gateway does not serve `{}`", request.action),
        )
    }
}
