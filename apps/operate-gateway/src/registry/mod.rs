//! Directory of connected remote execution agents.
//!
//! Every agent that completes the `/ws/agent` handshake is tracked here along
//! with its load. Outbound requests are correlated with their responses via
//! the [`CorrelationTable`], and a background sweep evicts agents whose
//! heartbeats stopped.

pub mod correlation;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agent_transport::{AgentTransport, TransportError};
use bytes::Bytes;
use metrics::{counter, gauge};
use operate_proto::{AgentFrame, EventFrame, RegisterParams, RequestFrame, ResponseFrame};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use correlation::{reply_from, CorrelationTable, PendingRequest, Reply};

use crate::now_millis;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no remote client is available")]
    NoAvailableClient,
    #[error("unknown remote client {0}")]
    UnknownClient(String),
    #[error("request {request_id} ({action}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        request_id: String,
        action: String,
        timeout_ms: u64,
    },
    #[error("remote client disconnected")]
    ClientDisconnected,
    #[error("failed to reach remote client: {0}")]
    Transport(#[from] TransportError),
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
    #[error("failed to encode request: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(45),
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    pub machine_name: String,
    pub os: String,
    pub capabilities: BTreeSet<String>,
}

impl From<RegisterParams> for ClientMetadata {
    fn from(params: RegisterParams) -> Self {
        Self {
            machine_name: params.machine_name,
            os: params.os,
            capabilities: params.capabilities,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    Stale,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Stale => "heartbeat_timeout",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    ClientConnected {
        client_id: String,
        machine_name: String,
    },
    ClientDisconnected {
        client_id: String,
        reason: DisconnectReason,
    },
    /// Unsolicited `event` frame pushed by an agent.
    AgentEvent {
        client_id: String,
        name: String,
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    pub id: String,
    pub machine_name: String,
    pub os: String,
    pub capabilities: Vec<String>,
    pub status: ClientStatus,
    pub busy: bool,
    pub connected_at: i64,
    pub last_heartbeat_at: i64,
    pub active_requests: usize,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_clients: usize,
    pub connected_clients: usize,
    pub busy_clients: usize,
    pub disconnected_clients: usize,
    pub active_requests: usize,
    pub pending_requests: usize,
}

struct RemoteClient {
    id: String,
    transport: Arc<dyn AgentTransport>,
    metadata: ClientMetadata,
    status: ClientStatus,
    seq: u64,
    connected_at: i64,
    last_heartbeat: Instant,
    last_heartbeat_at: i64,
    active_requests: usize,
    total_requests: u64,
}

impl RemoteClient {
    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id.clone(),
            machine_name: self.metadata.machine_name.clone(),
            os: self.metadata.os.clone(),
            capabilities: self.metadata.capabilities.iter().cloned().collect(),
            status: self.status,
            busy: self.active_requests > 0,
            connected_at: self.connected_at,
            last_heartbeat_at: self.last_heartbeat_at,
            active_requests: self.active_requests,
            total_requests: self.total_requests,
        }
    }

    fn is_connected(&self) -> bool {
        self.status == ClientStatus::Connected
    }
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, RemoteClient>,
    pending: CorrelationTable,
    next_seq: u64,
}

impl RegistryState {
    fn connected_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_connected()).count()
    }
}

struct RegistryInner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryInner {
    /// Remove a pending row and release the load it held on its client.
    fn finish(&self, request_id: &str) -> Option<PendingRequest> {
        let mut state = self.state.lock();
        let pending = state.pending.take(request_id)?;
        if let Some(client) = state.clients.get_mut(&pending.client_id) {
            client.active_requests = client.active_requests.saturating_sub(1);
        }
        Some(pending)
    }
}

/// Releases a pending row if the waiting future is dropped early.
struct PendingGuard<'a> {
    inner: &'a RegistryInner,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.finish(self.request_id);
    }
}

#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
                events,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_client(
        &self,
        transport: Arc<dyn AgentTransport>,
        metadata: ClientMetadata,
    ) -> String {
        let client_id = operate_proto::generate_id();
        let now = now_millis();
        let machine_name = metadata.machine_name.clone();
        let os = metadata.os.clone();
        let connected = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.clients.insert(
                client_id.clone(),
                RemoteClient {
                    id: client_id.clone(),
                    transport,
                    metadata,
                    status: ClientStatus::Connected,
                    seq,
                    connected_at: now,
                    last_heartbeat: Instant::now(),
                    last_heartbeat_at: now,
                    active_requests: 0,
                    total_requests: 0,
                },
            );
            state.connected_count()
        };

        counter!("operate_gateway_clients_registered_total", 1);
        gauge!("operate_gateway_clients_connected", connected as f64);
        info!(
            client_id = %client_id,
            machine_name = %machine_name,
            os = %os,
            "remote client registered"
        );
        let _ = self.inner.events.send(RegistryEvent::ClientConnected {
            client_id: client_id.clone(),
            machine_name,
        });
        client_id
    }

    /// Drop a client and reject every request still waiting on it.
    pub fn unregister_client(&self, client_id: &str) -> bool {
        self.remove_client(client_id, DisconnectReason::Closed)
    }

    fn remove_client(&self, client_id: &str, reason: DisconnectReason) -> bool {
        let (client, orphaned, connected) = {
            let mut state = self.inner.state.lock();
            let Some(client) = state.clients.remove(client_id) else {
                return false;
            };
            let orphaned = state.pending.drain_client(client_id);
            (client, orphaned, state.connected_count())
        };

        client.transport.close(reason.as_str());
        let rejected = orphaned.len();
        for pending in orphaned {
            debug!(
                client_id,
                request_id = %pending.id,
                action = %pending.action,
                "rejecting request for departed client"
            );
            pending.settle(Err(RegistryError::ClientDisconnected));
        }

        gauge!("operate_gateway_clients_connected", connected as f64);
        counter!(
            "operate_gateway_clients_unregistered_total",
            1,
            "reason" => reason.as_str()
        );
        info!(
            client_id,
            machine_name = %client.metadata.machine_name,
            reason = reason.as_str(),
            rejected,
            "remote client unregistered"
        );
        let _ = self.inner.events.send(RegistryEvent::ClientDisconnected {
            client_id: client_id.to_string(),
            reason,
        });
        true
    }

    pub fn update_heartbeat(&self, client_id: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.clients.get_mut(client_id) {
            Some(client) => {
                client.last_heartbeat = Instant::now();
                client.last_heartbeat_at = now_millis();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.inner.state.lock().clients.contains_key(client_id)
    }

    /// All tracked clients in registration order.
    pub fn clients(&self) -> Vec<ClientSnapshot> {
        let state = self.inner.state.lock();
        let mut clients: Vec<&RemoteClient> = state.clients.values().collect();
        clients.sort_by_key(|client| client.seq);
        clients.into_iter().map(RemoteClient::snapshot).collect()
    }

    pub fn available_clients(&self) -> Vec<ClientSnapshot> {
        self.clients()
            .into_iter()
            .filter(|client| client.status == ClientStatus::Connected)
            .collect()
    }

    /// Least-loaded connected client; ties go to whichever registered first.
    pub fn select_client(&self) -> Result<ClientSnapshot, RegistryError> {
        let state = self.inner.state.lock();
        state
            .clients
            .values()
            .filter(|client| client.is_connected())
            .min_by_key(|client| (client.active_requests, client.seq))
            .map(RemoteClient::snapshot)
            .ok_or(RegistryError::NoAvailableClient)
    }

    pub async fn send_request(
        &self,
        client_id: &str,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RegistryError> {
        let request_id = operate_proto::generate_id();
        let frame = AgentFrame::Request(RequestFrame {
            id: request_id.clone(),
            action: action.to_string(),
            params: params.clone(),
        });
        let bytes = frame
            .to_bytes()
            .map(Bytes::from)
            .map_err(|err| RegistryError::Encode(err.to_string()))?;

        // Load accounting, the send and the pending row share one critical
        // section so a fast response can never miss its row.
        let registered = {
            let mut state = self.inner.state.lock();
            let RegistryState {
                clients, pending, ..
            } = &mut *state;
            match clients.get_mut(client_id) {
                None => Err(RegistryError::UnknownClient(client_id.to_string())),
                Some(client) => {
                    client.active_requests += 1;
                    client.total_requests += 1;
                    match client.transport.send(bytes) {
                        Ok(()) => Ok(pending.register(
                            request_id.clone(),
                            client_id,
                            action,
                            params,
                            timeout,
                        )),
                        Err(err) => {
                            client.active_requests -= 1;
                            if err == TransportError::Closed {
                                client.status = ClientStatus::Disconnected;
                            }
                            Err(RegistryError::Transport(err))
                        }
                    }
                }
            }
        };
        let mut rx = match registered {
            Ok(rx) => rx,
            Err(err) => {
                warn!(client_id, action, error = %err, "failed to dispatch request");
                counter!("operate_gateway_request_send_failures_total", 1);
                return Err(err);
            }
        };
        let _guard = PendingGuard {
            inner: &self.inner,
            request_id: &request_id,
        };

        counter!(
            "operate_gateway_requests_total",
            1,
            "action" => action.to_string()
        );
        debug!(client_id, request_id = %request_id, action, "request sent to remote client");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(RegistryError::ClientDisconnected),
            Err(_) => {
                if self.inner.finish(&request_id).is_some() {
                    counter!(
                        "operate_gateway_request_timeouts_total",
                        1,
                        "action" => action.to_string()
                    );
                    warn!(
                        client_id,
                        request_id = %request_id,
                        action,
                        timeout_ms = timeout.as_millis() as u64,
                        "remote request timed out"
                    );
                    Err(RegistryError::RequestTimeout {
                        request_id: request_id.clone(),
                        action: action.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // A response or a forced rejection won the race and is
                    // already sitting in the channel.
                    rx.await.unwrap_or(Err(RegistryError::ClientDisconnected))
                }
            }
        }
    }

    /// Resolve the pending request a response frame refers to. Unknown or
    /// already-settled ids are dropped.
    pub fn handle_response(&self, response: ResponseFrame) -> bool {
        let Some(pending) = self.inner.finish(&response.request_id) else {
            debug!(
                request_id = %response.request_id,
                "dropping response without a pending request"
            );
            counter!("operate_gateway_responses_unmatched_total", 1);
            return false;
        };

        let latency = pending.created_at.elapsed();
        let reply = reply_from(response);
        debug!(
            client_id = %pending.client_id,
            request_id = %pending.id,
            action = %pending.action,
            success = reply.is_ok(),
            latency_ms = latency.as_millis() as u64,
            "remote response received"
        );
        metrics::histogram!(
            "operate_gateway_request_latency_seconds",
            latency.as_secs_f64()
        );
        pending.settle(reply);
        true
    }

    pub fn handle_event(&self, client_id: &str, event: EventFrame) {
        debug!(client_id, name = %event.name, "remote client event");
        counter!("operate_gateway_client_events_total", 1);
        let _ = self.inner.events.send(RegistryEvent::AgentEvent {
            client_id: client_id.to_string(),
            name: event.name,
            data: event.data,
        });
    }

    /// Evict every client whose last heartbeat is older than the stale
    /// threshold. Returns the evicted ids.
    pub fn sweep_stale(&self) -> Vec<String> {
        let stale_after = self.inner.config.stale_after;
        let now = Instant::now();
        let stale: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .clients
                .values()
                .filter(|client| now.saturating_duration_since(client.last_heartbeat) > stale_after)
                .map(|client| client.id.clone())
                .collect()
        };
        for client_id in &stale {
            warn!(client_id = %client_id, "remote client heartbeat expired");
            self.remove_client(client_id, DisconnectReason::Stale);
        }
        stale
    }

    fn ping_clients(&self) {
        let Ok(ping) = AgentFrame::Ping.to_bytes() else {
            return;
        };
        let ping = Bytes::from(ping);
        let state = self.inner.state.lock();
        for client in state.clients.values().filter(|c| c.is_connected()) {
            if let Err(err) = client.transport.send(ping.clone()) {
                debug!(client_id = %client.id, error = %err, "heartbeat ping failed");
            }
        }
    }

    pub fn start_heartbeat_sweep(&self) {
        let mut slot = self.inner.sweeper.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.heartbeat_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let registry = ClientRegistry { inner };
                registry.sweep_stale();
                registry.ping_clients();
            }
        }));
    }

    pub fn stop_heartbeat_sweep(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
    }

    /// Shut the registry down: stop the sweep, hang up on every client and
    /// reject every outstanding request.
    pub fn destroy(&self) {
        self.stop_heartbeat_sweep();
        let (clients, orphaned) = {
            let mut state = self.inner.state.lock();
            let clients: Vec<RemoteClient> = state.clients.drain().map(|(_, c)| c).collect();
            (clients, state.pending.drain_all())
        };

        let rejected = orphaned.len();
        for pending in orphaned {
            pending.settle(Err(RegistryError::ClientDisconnected));
        }
        for client in &clients {
            client.transport.close(DisconnectReason::Shutdown.as_str());
            let _ = self.inner.events.send(RegistryEvent::ClientDisconnected {
                client_id: client.id.clone(),
                reason: DisconnectReason::Shutdown,
            });
        }
        gauge!("operate_gateway_clients_connected", 0.0);
        info!(clients = clients.len(), rejected, "client registry destroyed");
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.state.lock();
        let mut stats = RegistryStats {
            total_clients: state.clients.len(),
            pending_requests: state.pending.len(),
            ..RegistryStats::default()
        };
        for client in state.clients.values() {
            match client.status {
                ClientStatus::Connected => stats.connected_clients += 1,
                ClientStatus::Disconnected => stats.disconnected_clients += 1,
            }
            if client.active_requests > 0 {
                stats.busy_clients += 1;
            }
            stats.active_requests += client.active_requests;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_transport::{ChannelTransport, OutboundFrame};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(RegistryConfig {
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
            event_buffer: 16,
        })
    }

    fn metadata(name: &str) -> ClientMetadata {
        ClientMetadata {
            machine_name: name.into(),
            os: "windows".into(),
            capabilities: BTreeSet::from(["keyboard".to_string(), "mouse".to_string()]),
        }
    }

    fn connect(
        registry: &ClientRegistry,
        name: &str,
    ) -> (String, UnboundedReceiver<OutboundFrame>) {
        let (transport, rx) = ChannelTransport::new();
        let id = registry.register_client(Arc::new(transport), metadata(name));
        (id, rx)
    }

    async fn next_request(rx: &mut UnboundedReceiver<OutboundFrame>) -> RequestFrame {
        loop {
            match rx.recv().await.expect("outbound frame") {
                OutboundFrame::Data(bytes) => match AgentFrame::from_slice(&bytes).expect("frame") {
                    AgentFrame::Request(request) => return request,
                    AgentFrame::Ping => continue,
                    other => panic!("unexpected frame {other:?}"),
                },
                OutboundFrame::Close { reason } => panic!("transport closed: {reason}"),
            }
        }
    }

    async fn wait_for_pending(registry: &ClientRegistry, expected: usize) {
        for _ in 0..1_000 {
            if registry.stats().pending_requests == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pending requests never reached {expected}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn select_prefers_least_loaded_client() {
        let registry = registry();
        let (first, _rx1) = connect(&registry, "DESK-01");
        let (second, _rx2) = connect(&registry, "DESK-02");

        for _ in 0..5 {
            let registry = registry.clone();
            let first = first.clone();
            tokio::spawn(async move {
                let _ = registry
                    .send_request(&first, "execute", json!({}), Duration::from_secs(30))
                    .await;
            });
        }
        for _ in 0..2 {
            let registry = registry.clone();
            let second = second.clone();
            tokio::spawn(async move {
                let _ = registry
                    .send_request(&second, "execute", json!({}), Duration::from_secs(30))
                    .await;
            });
        }
        wait_for_pending(&registry, 7).await;

        let chosen = registry.select_client().expect("client");
        assert_eq!(chosen.id, second);
        assert_eq!(chosen.active_requests, 2);

        registry.destroy();
        assert_eq!(registry.stats().pending_requests, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn select_breaks_ties_by_registration_order() {
        let registry = registry();
        assert_eq!(
            registry.select_client(),
            Err(RegistryError::NoAvailableClient)
        );
        let (first, _rx1) = connect(&registry, "DESK-01");
        let (_second, _rx2) = connect(&registry, "DESK-02");
        let (_third, _rx3) = connect(&registry, "DESK-03");
        assert_eq!(registry.select_client().expect("client").id, first);
    }

    #[test_timeout::tokio_timeout_test]
    async fn response_resolves_request_and_releases_load() {
        let registry = registry();
        let (client_id, mut rx) = connect(&registry, "DESK-01");

        let task = {
            let registry = registry.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                registry
                    .send_request(
                        &client_id,
                        "execute",
                        json!({ "command": "open notepad" }),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let request = next_request(&mut rx).await;
        assert_eq!(request.action, "execute");
        assert_eq!(request.params["command"], "open notepad");
        assert_eq!(registry.clients()[0].active_requests, 1);

        assert!(registry.handle_response(ResponseFrame::ok(
            request.id.clone(),
            json!({ "done": true })
        )));
        // A duplicate response for the same id is a no-op.
        assert!(!registry.handle_response(ResponseFrame::ok(request.id, json!({}))));

        let reply = task.await.expect("join");
        assert_eq!(reply, Ok(json!({ "done": true })));
        let snapshot = &registry.clients()[0];
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.total_requests, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_failure_surfaces_code_and_message() {
        let registry = registry();
        let (client_id, mut rx) = connect(&registry, "DESK-01");
        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_request(&client_id, "assert", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        let request = next_request(&mut rx).await;
        registry.handle_response(ResponseFrame::err(
            request.id,
            "ASSERTION_FAILED",
            "window title mismatch",
        ));
        assert_eq!(
            task.await.expect("join"),
            Err(RegistryError::Remote {
                code: "ASSERTION_FAILED".into(),
                message: "window title mismatch".into(),
            })
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn request_times_out_and_late_response_is_ignored() {
        let registry = registry();
        let (client_id, mut rx) = connect(&registry, "DESK-01");

        let task = {
            let registry = registry.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                registry
                    .send_request(&client_id, "execute", json!({}), Duration::from_millis(1_000))
                    .await
            })
        };
        let request = next_request(&mut rx).await;

        let outcome = task.await.expect("join");
        assert!(matches!(
            outcome,
            Err(RegistryError::RequestTimeout { timeout_ms: 1_000, .. })
        ));
        assert_eq!(registry.clients()[0].active_requests, 0);
        assert_eq!(registry.stats().pending_requests, 0);

        assert!(!registry.handle_response(ResponseFrame::ok(request.id, json!({}))));
        assert_eq!(registry.clients()[0].active_requests, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_client_is_rejected() {
        let registry = registry();
        let outcome = registry
            .send_request("nope", "execute", json!({}), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, Err(RegistryError::UnknownClient("nope".into())));
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_send_marks_client_disconnected() {
        let registry = registry();
        let (client_id, rx) = connect(&registry, "DESK-01");
        drop(rx);

        let outcome = registry
            .send_request(&client_id, "execute", json!({}), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, Err(RegistryError::Transport(TransportError::Closed)));

        let snapshot = &registry.clients()[0];
        assert_eq!(snapshot.status, ClientStatus::Disconnected);
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.total_requests, 1);
        assert!(registry.available_clients().is_empty());
        assert_eq!(
            registry.select_client(),
            Err(RegistryError::NoAvailableClient)
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unregister_rejects_pending_requests_immediately() {
        let registry = registry();
        let mut events = registry.subscribe();
        let (client_id, mut rx) = connect(&registry, "DESK-01");
        assert!(matches!(
            events.recv().await.expect("event"),
            RegistryEvent::ClientConnected { .. }
        ));

        let task = {
            let registry = registry.clone();
            let client_id = client_id.clone();
            tokio::spawn(async move {
                registry
                    .send_request(&client_id, "runScript", json!({}), Duration::from_secs(30))
                    .await
            })
        };
        next_request(&mut rx).await;

        assert!(registry.unregister_client(&client_id));
        assert!(!registry.unregister_client(&client_id));
        assert_eq!(
            task.await.expect("join"),
            Err(RegistryError::ClientDisconnected)
        );
        assert_eq!(
            events.recv().await.expect("event"),
            RegistryEvent::ClientDisconnected {
                client_id,
                reason: DisconnectReason::Closed,
            }
        );
        assert!(matches!(
            rx.recv().await,
            Some(OutboundFrame::Close { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn destroy_rejects_everything_outstanding() {
        let registry = registry();
        let (a, _rx_a) = connect(&registry, "DESK-01");
        let (b, _rx_b) = connect(&registry, "DESK-02");

        let mut tasks = Vec::new();
        for client_id in [a.clone(), a, b] {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .send_request(&client_id, "execute", json!({}), Duration::from_secs(30))
                    .await
            }));
        }
        wait_for_pending(&registry, 3).await;

        registry.destroy();
        for task in tasks {
            assert_eq!(
                task.await.expect("join"),
                Err(RegistryError::ClientDisconnected)
            );
        }
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn heartbeat_sweep_evicts_silent_clients() {
        let registry = registry();
        let (quiet, _rx_quiet) = connect(&registry, "DESK-01");
        let (chatty, mut rx_chatty) = connect(&registry, "DESK-02");
        registry.start_heartbeat_sweep();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(5)).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(registry.update_heartbeat(&chatty));
        }

        assert!(!registry.contains(&quiet));
        assert!(registry.contains(&chatty));
        assert!(!registry.update_heartbeat(&quiet));

        // The sweep also pings the survivors.
        let frame = rx_chatty.recv().await.expect("ping");
        assert_eq!(
            frame,
            OutboundFrame::Data(Bytes::from(AgentFrame::Ping.to_bytes().expect("ping")))
        );
        registry.stop_heartbeat_sweep();
    }

    #[test_timeout::tokio_timeout_test]
    async fn stats_count_busy_clients() {
        let registry = registry();
        let (a, mut rx_a) = connect(&registry, "DESK-01");
        let (_b, _rx_b) = connect(&registry, "DESK-02");

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .send_request(&a, "execute", json!({}), Duration::from_secs(30))
                    .await
            })
        };
        let request = next_request(&mut rx_a).await;
        let stats = registry.stats();
        assert_eq!(stats.total_clients, 2);
        assert_eq!(stats.connected_clients, 2);
        assert_eq!(stats.busy_clients, 1);
        assert_eq!(stats.active_requests, 1);
        assert_eq!(stats.pending_requests, 1);

        registry.handle_response(ResponseFrame::ok(request.id, json!(null)));
        task.await.expect("join").expect("reply");
        assert_eq!(registry.stats().busy_clients, 0);
    }
}
