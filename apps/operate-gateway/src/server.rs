use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent_socket::agent_ws_handler;
use crate::config::GatewayConfig;
use crate::dispatch::handlers::builtin_dispatcher;
use crate::dispatch::{envelope, ConnectionRegistry, Devices, Dispatcher, TaskExecutionGuard, TaskLock};
use crate::operate::{
    AgentBackend, BridgeDriver, DesktopDriver, OperateService, ServiceEvent,
};
use crate::registry::{ClientRegistry, ClientSnapshot, RegistryEvent, RegistryStats};
use crate::websocket::caller_ws_handler;

/// Device served by the pool of desktop agents.
pub const DESKTOP_DEVICE: &str = "windows";
/// Device served by the browser bridge, when one is configured.
pub const BRIDGE_DEVICE: &str = "web";
/// Agent event name carrying a progress tip for the running task.
pub const TASK_TIP_EVENT: &str = "taskTip";

pub struct AppState {
    pub registry: ClientRegistry,
    pub dispatcher: Dispatcher,
    pub connections: ConnectionRegistry,
    pub devices: Arc<Devices>,
    pub guard: Arc<TaskExecutionGuard>,
    pub handshake_timeout: Duration,
    metrics: PrometheusHandle,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub registry: RegistryStats,
    pub clients: Vec<ClientSnapshot>,
    pub caller_connections: usize,
    pub devices: Map<String, Value>,
    pub locks: Vec<TaskLock>,
}

impl AppState {
    pub fn stats(&self) -> StatsResponse {
        let mut devices = Map::new();
        for service in self.devices.iter() {
            devices.insert(
                service.name().to_string(),
                json!({
                    "state": service.state(),
                    "backend": service.backend().kind(),
                    "reconnectAttempts": service.reconnect_attempts(),
                }),
            );
        }
        StatsResponse {
            registry: self.registry.stats(),
            clients: self.registry.clients(),
            caller_connections: self.connections.len(),
            devices,
            locks: self.guard.snapshot(),
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

/// Everything the gateway owns, wired together once at startup.
pub struct Gateway {
    state: Arc<AppState>,
    background: Vec<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl Gateway {
    /// Must be called from inside a Tokio runtime; background forwarders are
    /// spawned immediately.
    pub fn build(config: &GatewayConfig, metrics: PrometheusHandle) -> Self {
        let registry = ClientRegistry::new(config.registry());
        let mut background = Vec::new();
        let mut devices = Devices::new();

        let desktop = OperateService::new(
            config.operate(DESKTOP_DEVICE),
            AgentBackend::Desktop(DesktopDriver::new(registry.clone())),
        );
        devices.insert(desktop.clone());

        let mut bridge_service = None;
        if let Some(bridge_config) = config.bridge() {
            info!(url = %bridge_config.url, "browser bridge enabled");
            let driver = Arc::new(BridgeDriver::new(bridge_config));
            let events = driver.subscribe_events();
            let service =
                OperateService::new(config.operate(BRIDGE_DEVICE), AgentBackend::Bridge(driver));
            devices.insert(service.clone());
            bridge_service = Some((service, events));
        }

        let devices = Arc::new(devices);
        let guard = Arc::new(TaskExecutionGuard::new());
        let connections = ConnectionRegistry::new();
        let dispatcher =
            builtin_dispatcher(registry.clone(), Arc::clone(&devices), Arc::clone(&guard));

        background.push(tokio::spawn(forward_registry_events(
            registry.subscribe(),
            desktop,
            connections.clone(),
        )));
        if let Some((service, events)) = bridge_service {
            background.push(tokio::spawn(forward_bridge_tips(events, service)));
        }
        for service in devices.iter() {
            background.push(tokio::spawn(forward_service_events(
                service.name().to_string(),
                service.subscribe(),
                connections.clone(),
            )));
        }
        registry.start_heartbeat_sweep();

        let state = Arc::new(AppState {
            registry,
            dispatcher,
            connections,
            devices,
            guard,
            handshake_timeout: config.handshake_timeout,
            metrics,
        });
        Self {
            state,
            background,
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(health_handler))
            .route("/debug/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(caller_ws_handler))
            .route("/ws/agent", get(agent_ws_handler))
            .with_state(self.state())
    }

    /// Serve on `listener` until `signal` resolves, then tear everything down.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .context("server shutdown with error")?;
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        info!(
            grace_seconds = self.shutdown_grace.as_secs(),
            "shutting down gateway"
        );
        self.state.registry.destroy();
        self.state.devices.stop_all().await;
        for handle in &self.background {
            handle.abort();
        }
        tokio::time::sleep(self.shutdown_grace).await;
        info!("graceful shutdown complete");
    }
}

pub async fn run(config: GatewayConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    let gateway = Gateway::build(&config, metrics);
    info!(
        listen_addr = %config.listen_addr,
        devices = ?gateway.state.devices.names(),
        "operate gateway listening"
    );
    gateway.serve(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn tip_from_event(data: &Value) -> Option<(String, Option<String>)> {
    let tip = data.get("tip")?.as_str()?.to_string();
    let error = data
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some((tip, error))
}

/// Pool membership goes out to every caller; agent tips go to the desktop
/// service so they reach whoever is running a task on it.
async fn forward_registry_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    desktop: OperateService,
    connections: ConnectionRegistry,
) {
    loop {
        match events.recv().await {
            Ok(RegistryEvent::ClientConnected {
                client_id,
                machine_name,
            }) => {
                connections.broadcast(&envelope::broadcast(
                    "clientConnected",
                    json!({ "clientId": client_id, "machineName": machine_name }),
                ));
            }
            Ok(RegistryEvent::ClientDisconnected { client_id, reason }) => {
                connections.broadcast(&envelope::broadcast(
                    "clientDisconnected",
                    json!({ "clientId": client_id, "reason": reason.as_str() }),
                ));
            }
            Ok(RegistryEvent::AgentEvent {
                client_id,
                name,
                data,
            }) if name == TASK_TIP_EVENT => match tip_from_event(&data) {
                Some((tip, error)) => {
                    desktop.trigger_task_tip(tip, error);
                }
                None => debug!(client_id = %client_id, "taskTip event without a tip"),
            },
            Ok(RegistryEvent::AgentEvent { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "registry event forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_bridge_tips(
    mut events: broadcast::Receiver<operate_proto::EventFrame>,
    service: OperateService,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.name == TASK_TIP_EVENT => {
                if let Some((tip, error)) = tip_from_event(&event.data) {
                    service.trigger_task_tip(tip, error);
                }
            }
            Ok(event) => debug!(name = %event.name, "bridge event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "bridge event forwarder lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_service_events(
    device: String,
    mut events: broadcast::Receiver<ServiceEvent>,
    connections: ConnectionRegistry,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(device = %device, skipped, "service event forwarder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let state = match event {
            ServiceEvent::Started => "started",
            ServiceEvent::Reconnecting => "reconnecting",
            ServiceEvent::Reconnected => "reconnected",
            ServiceEvent::Stopped => "stopped",
        };
        connections.broadcast(&envelope::broadcast(
            "deviceState",
            json!({ "device": device, "state": state }),
        ));
    }
}
