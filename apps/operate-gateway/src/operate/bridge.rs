//! Driver for the browser-extension bridge: a single outbound WebSocket that
//! speaks the same request/response frames as the desktop agents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use operate_proto::{AgentFrame, EventFrame, RequestFrame};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::driver::{AutomationDriver, DriverError, RetryPolicy};
use crate::registry::{reply_from, CorrelationTable};

const BRIDGE_PEER: &str = "bridge";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub connect_policy: RetryPolicy,
    /// Action sent right after connecting so the bridge attaches to a tab.
    pub attach_action: String,
}

impl BridgeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(60),
            connect_policy: RetryPolicy::default(),
            attach_action: "attach".into(),
        }
    }
}

struct BridgeLink {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BridgeLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.writer.is_finished()
    }

    fn close(self) {
        let _ = self.outbound.send(Message::Close(None));
        self.open.store(false, Ordering::Release);
        self.reader.abort();
    }
}

/// Removes the pending row when the waiting call goes away early.
struct ForgetOnDrop<'a> {
    pending: &'a Mutex<CorrelationTable>,
    request_id: &'a str,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.lock().take(self.request_id);
    }
}

pub struct BridgeDriver {
    config: BridgeConfig,
    link: Mutex<Option<BridgeLink>>,
    pending: Arc<Mutex<CorrelationTable>>,
    events: broadcast::Sender<EventFrame>,
}

impl BridgeDriver {
    pub fn new(config: BridgeConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            link: Mutex::new(None),
            pending: Arc::new(Mutex::new(CorrelationTable::new())),
            events,
        }
    }

    /// Unsolicited `event` frames pushed by the bridge.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventFrame> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(BridgeLink::is_open)
    }

    async fn connect(&self) -> Result<(), DriverError> {
        let (stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|err| {
                DriverError::NotConnected(format!("bridge {} unreachable: {err}", self.config.url))
            })?;
        let (mut sink, source) = stream.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<Message>();
        let open = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn({
            let open = Arc::clone(&open);
            async move {
                while let Some(message) = rx.recv().await {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(err) = sink.send(message).await {
                        debug!(error = %err, "bridge writer stopped");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                open.store(false, Ordering::Release);
            }
        });
        let reader = tokio::spawn(read_loop(
            source,
            outbound.clone(),
            Arc::clone(&open),
            Arc::clone(&self.pending),
            self.events.clone(),
        ));

        let previous = self.link.lock().replace(BridgeLink {
            outbound,
            open,
            reader,
            writer,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        info!(url = %self.config.url, "connected to browser bridge");
        Ok(())
    }

    fn disconnect(&self) {
        if let Some(link) = self.link.lock().take() {
            link.close();
        }
        let orphaned = self.pending.lock().drain_all();
        for pending in orphaned {
            pending.settle(Err(crate::registry::RegistryError::ClientDisconnected));
        }
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, DriverError> {
        let outbound = match self.link.lock().as_ref() {
            Some(link) if link.is_open() => link.outbound.clone(),
            _ => return Err(DriverError::NotConnected("browser bridge is not connected".into())),
        };

        let request_id = operate_proto::generate_id();
        let frame = AgentFrame::Request(RequestFrame {
            id: request_id.clone(),
            action: action.to_string(),
            params: params.clone(),
        });
        let text = serde_json::to_string(&frame)
            .map_err(|err| DriverError::Failed(format!("failed to encode {action}: {err}")))?;

        let timeout = self.config.request_timeout;
        let mut rx = self.pending.lock().register(
            request_id.clone(),
            BRIDGE_PEER,
            action,
            params,
            timeout,
        );
        let _forget = ForgetOnDrop {
            pending: &self.pending,
            request_id: &request_id,
        };
        if outbound.send(Message::Text(text)).is_err() {
            return Err(DriverError::TransportClosed(
                "browser bridge writer stopped".into(),
            ));
        }
        debug!(request_id = %request_id, action, "request sent to browser bridge");

        let reply = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(reply) => reply,
            Err(_) => {
                if self.pending.lock().take(&request_id).is_some() {
                    warn!(request_id = %request_id, action, "browser bridge request timed out");
                    return Err(DriverError::Timeout(format!(
                        "browser bridge {action} timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
                rx.await
            }
        };
        match reply {
            Ok(reply) => reply.map_err(DriverError::from),
            Err(_) => Err(DriverError::TransportClosed(
                "browser bridge connection dropped".into(),
            )),
        }
    }
}

async fn read_loop<S>(
    mut source: S,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    pending: Arc<Mutex<CorrelationTable>>,
    events: broadcast::Sender<EventFrame>,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = source.next().await {
        let bytes = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                debug!(?frame, "browser bridge closed the connection");
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "browser bridge read failed");
                break;
            }
        };
        match AgentFrame::from_slice(&bytes) {
            Ok(AgentFrame::Response(response)) => {
                let row = pending.lock().take(&response.request_id);
                match row {
                    Some(row) => {
                        row.settle(reply_from(response));
                    }
                    None => debug!(
                        request_id = %response.request_id,
                        "dropping bridge response without a pending request"
                    ),
                }
            }
            Ok(AgentFrame::Event(event)) => {
                debug!(name = %event.name, "browser bridge event");
                let _ = events.send(event);
            }
            Ok(AgentFrame::Ping) => {
                if let Ok(pong) = serde_json::to_string(&AgentFrame::Pong) {
                    let _ = outbound.send(Message::Text(pong));
                }
            }
            Ok(AgentFrame::Pong) => {}
            Ok(AgentFrame::Request(request)) => {
                debug!(action = %request.action, "ignoring request initiated by browser bridge");
            }
            Err(err) => warn!(error = %err, "malformed frame from browser bridge"),
        }
    }

    open.store(false, Ordering::Release);
    let orphaned = pending.lock().drain_all();
    for row in orphaned {
        row.settle(Err(crate::registry::RegistryError::ClientDisconnected));
    }
}

#[async_trait]
impl AutomationDriver for BridgeDriver {
    async fn create_agent(&self) -> Result<(), DriverError> {
        self.disconnect();
        Ok(())
    }

    async fn initialize_connection(&self) -> Result<(), DriverError> {
        let driver = self;
        self.config
            .connect_policy
            .run("browser bridge connect", move || async move {
                driver.connect().await
            })
            .await?;
        self.call(&self.config.attach_action, json!({})).await?;
        Ok(())
    }

    async fn execute(&self, command: &str) -> Result<Value, DriverError> {
        self.call("execute", json!({ "command": command })).await
    }

    async fn assert(&self, condition: &str) -> Result<Value, DriverError> {
        self.call("assert", json!({ "condition": condition })).await
    }

    async fn run_script(&self, content: &str) -> Result<Value, DriverError> {
        self.call("runScript", json!({ "content": content })).await
    }

    async fn probe(&self) -> bool {
        self.is_connected()
    }

    async fn teardown(&self) {
        self.disconnect();
    }
}
