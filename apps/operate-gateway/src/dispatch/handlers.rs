//! Built-in caller actions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::{json, Map, Value};
use tracing::info;

use super::envelope;
use super::guard::{TaskExecutionGuard, TaskPermit};
use super::{ActionHandler, DispatchError, Dispatcher, HandlerContext};
use crate::operate::{OperateService, DEFAULT_MAX_RETRIES};
use crate::registry::ClientRegistry;

/// Operate services keyed by the device name callers use.
#[derive(Clone, Default)]
pub struct Devices {
    services: BTreeMap<String, OperateService>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: OperateService) {
        self.services.insert(service.name().to_string(), service);
    }

    pub fn get(&self, device: &str) -> Option<&OperateService> {
        self.services.get(device)
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperateService> {
        self.services.values()
    }

    pub async fn stop_all(&self) {
        for service in self.services.values() {
            service.stop().await;
        }
    }

    fn resolve(&self, device: &str) -> Result<&OperateService, DispatchError> {
        self.get(device).ok_or_else(|| {
            DispatchError::InvalidParams(format!(
                "unknown device `{device}` (available: {})",
                self.names().join(", ")
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Operate,
    RunScript,
    Assert,
}

/// Runs an automation task on one device while holding that device's lock.
pub struct RunTask {
    kind: TaskKind,
    devices: Arc<Devices>,
    guard: Arc<TaskExecutionGuard>,
}

impl RunTask {
    pub fn new(kind: TaskKind, devices: Arc<Devices>, guard: Arc<TaskExecutionGuard>) -> Self {
        Self {
            kind,
            devices,
            guard,
        }
    }
}

/// One task per device at a time, whatever the action.
fn claim_device(
    guard: &Arc<TaskExecutionGuard>,
    device: &str,
    ctx: &HandlerContext,
) -> Result<TaskPermit, DispatchError> {
    guard
        .acquire_permit(device, ctx.meta(), ctx.action())
        .map_err(|current| {
            counter!("operate_gateway_tasks_busy_total", 1, "device" => device.to_string());
            DispatchError::TaskBusy {
                key: current.key,
                action: current.action,
                holder_id: current.holder_id,
            }
        })
}

#[async_trait]
impl ActionHandler for RunTask {
    async fn handle(&self, ctx: HandlerContext) -> Result<Value, DispatchError> {
        let device = ctx.required_str("device")?;
        let service = self.devices.resolve(device)?.clone();
        let max_retries = ctx
            .optional_u32("maxRetries")?
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let input = match self.kind {
            TaskKind::Operate => ctx.required_str("command")?,
            TaskKind::RunScript => ctx.required_str("content")?,
            TaskKind::Assert => ctx.required_str("condition")?,
        };
        let fallback = match self.kind {
            TaskKind::RunScript => ctx.optional_str("fallbackCommand")?,
            _ => None,
        };

        let _permit = claim_device(&self.guard, device, &ctx)?;

        info!(
            device,
            action = ctx.action(),
            message_id = %ctx.meta().message_id,
            "task started"
        );
        ctx.send_command("showLoading", json!({ "device": device, "action": ctx.action() }));
        let subscription = {
            let connection = ctx.connection.clone();
            let meta = ctx.meta().clone();
            service.on_task_tip(move |event| {
                connection.send(envelope::command(&meta, "taskTip", json!(event)));
            })
        };

        let outcome = match self.kind {
            TaskKind::Operate => service.execute(input, max_retries).await,
            TaskKind::RunScript => service.execute_script(input, max_retries, fallback).await,
            TaskKind::Assert => service.expect(input).await,
        };

        service.off_task_tip(subscription);
        ctx.send_command("hideLoading", json!({ "device": device }));
        let output = outcome?;
        Ok(json!({
            "device": device,
            "output": output,
            "taskErrors": service.task_errors(),
        }))
    }
}

pub struct Status {
    registry: ClientRegistry,
    devices: Arc<Devices>,
    guard: Arc<TaskExecutionGuard>,
}

#[async_trait]
impl ActionHandler for Status {
    async fn handle(&self, _ctx: HandlerContext) -> Result<Value, DispatchError> {
        let mut devices = Map::new();
        for service in self.devices.iter() {
            devices.insert(
                service.name().to_string(),
                json!({
                    "state": service.state(),
                    "backend": service.backend().kind(),
                }),
            );
        }
        Ok(json!({
            "clients": self.registry.stats(),
            "devices": devices,
            "locks": self.guard.snapshot(),
        }))
    }
}

pub struct ListClients {
    registry: ClientRegistry,
}

#[async_trait]
impl ActionHandler for ListClients {
    async fn handle(&self, _ctx: HandlerContext) -> Result<Value, DispatchError> {
        Ok(json!({ "clients": self.registry.clients() }))
    }
}

pub struct Reconnect {
    devices: Arc<Devices>,
    guard: Arc<TaskExecutionGuard>,
}

#[async_trait]
impl ActionHandler for Reconnect {
    async fn handle(&self, ctx: HandlerContext) -> Result<Value, DispatchError> {
        let device = ctx.required_str("device")?;
        let service = self.devices.resolve(device)?;
        let _permit = claim_device(&self.guard, device, &ctx)?;
        service.force_reconnect().await?;
        Ok(json!({ "device": device, "state": service.state() }))
    }
}

/// Dispatcher wired with every built-in action.
pub fn builtin_dispatcher(
    registry: ClientRegistry,
    devices: Arc<Devices>,
    guard: Arc<TaskExecutionGuard>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(
        "operate",
        RunTask::new(TaskKind::Operate, Arc::clone(&devices), Arc::clone(&guard)),
    );
    dispatcher.register(
        "runScript",
        RunTask::new(TaskKind::RunScript, Arc::clone(&devices), Arc::clone(&guard)),
    );
    dispatcher.register(
        "assert",
        RunTask::new(TaskKind::Assert, Arc::clone(&devices), Arc::clone(&guard)),
    );
    dispatcher.register(
        "status",
        Status {
            registry: registry.clone(),
            devices: Arc::clone(&devices),
            guard: Arc::clone(&guard),
        },
    );
    dispatcher.register(
        "listClients",
        ListClients {
            registry,
        },
    );
    dispatcher.register("reconnect", Reconnect { devices, guard });
    dispatcher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallerConnection;
    use crate::operate::{AgentBackend, DesktopDriver, OperateConfig, RetryPolicy};
    use crate::registry::{ClientMetadata, RegistryConfig};
    use agent_transport::{ChannelTransport, OutboundFrame};
    use operate_proto::{AgentFrame, OutboundEnvelope, ResponseFrame, Status as ReplyStatus};
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Harness {
        registry: ClientRegistry,
        dispatcher: Dispatcher,
        agent_rx: UnboundedReceiver<OutboundFrame>,
    }

    fn harness() -> Harness {
        let registry = ClientRegistry::new(RegistryConfig {
            request_timeout: Duration::from_secs(10),
            ..RegistryConfig::default()
        });
        let (transport, agent_rx) = ChannelTransport::new();
        registry.register_client(
            Arc::new(transport),
            ClientMetadata {
                machine_name: "DESK-01".into(),
                os: "windows".into(),
                capabilities: BTreeSet::new(),
            },
        );
        let driver = DesktopDriver::new(registry.clone()).with_init_policy(RetryPolicy::once());
        let mut devices = Devices::new();
        devices.insert(OperateService::new(
            OperateConfig::new("windows"),
            AgentBackend::Desktop(driver),
        ));
        let dispatcher = builtin_dispatcher(
            registry.clone(),
            Arc::new(devices),
            Arc::new(TaskExecutionGuard::new()),
        );
        Harness {
            registry,
            dispatcher,
            agent_rx,
        }
    }

    fn frame(message_id: &str, action: &str, params: Value) -> String {
        json!({
            "meta": { "messageId": message_id, "conversationId": "conv-1", "timestamp": 1 },
            "payload": { "action": action, "params": params }
        })
        .to_string()
    }

    async fn next_request(rx: &mut UnboundedReceiver<OutboundFrame>) -> operate_proto::RequestFrame {
        loop {
            let OutboundFrame::Data(bytes) = rx.recv().await.expect("frame") else {
                panic!("agent transport closed");
            };
            if let AgentFrame::Request(request) = AgentFrame::from_slice(&bytes).expect("frame") {
                return request;
            }
        }
    }

    /// Next non-command envelope.
    async fn next_reply(rx: &mut UnboundedReceiver<OutboundEnvelope>) -> OutboundEnvelope {
        loop {
            let reply = rx.recv().await.expect("reply");
            if reply.payload.action != envelope::COMMAND_ACTION {
                return reply;
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn operate_routes_to_desktop_agent_and_reports_back() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = CallerConnection::new("caller", None, tx);

        let task = h
            .dispatcher
            .dispatch(
                &conn,
                &frame("msg-a", "operate", json!({ "device": "windows", "command": "open calculator" })),
            )
            .expect("spawned");

        let request = next_request(&mut h.agent_rx).await;
        assert_eq!(request.action, "execute");
        assert_eq!(request.params["command"], "open calculator");
        h.registry
            .handle_response(ResponseFrame::ok(request.id, json!({ "opened": true })));
        task.await.expect("join");

        let loading = rx.recv().await.expect("showLoading");
        assert_eq!(loading.payload.result.expect("result")["command"], "showLoading");

        let reply = next_reply(&mut rx).await;
        assert_eq!(reply.meta.message_id, "msg-a");
        assert_eq!(reply.payload.status, ReplyStatus::Success);
        let result = reply.payload.result.expect("result");
        assert_eq!(result["device"], "windows");
        assert_eq!(result["output"]["opened"], true);
    }

    #[test_timeout::tokio_timeout_test]
    async fn busy_device_rejects_second_task() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = CallerConnection::new("caller", None, tx);

        let first = h
            .dispatcher
            .dispatch(
                &conn,
                &frame("msg-a", "operate", json!({ "device": "windows", "command": "open mail" })),
            )
            .expect("spawned");
        let request = next_request(&mut h.agent_rx).await;

        h.dispatcher
            .dispatch(
                &conn,
                &frame("msg-b", "assert", json!({ "device": "windows", "condition": "mail is open" })),
            )
            .expect("spawned")
            .await
            .expect("join");
        let busy = next_reply(&mut rx).await;
        assert_eq!(busy.meta.message_id, "msg-b");
        assert_eq!(busy.payload.status, ReplyStatus::Failed);
        assert!(busy
            .payload
            .error
            .expect("error")
            .contains("busy running \"operate\""));

        h.registry.handle_response(ResponseFrame::ok(request.id, json!(null)));
        first.await.expect("join");
        let done = next_reply(&mut rx).await;
        assert_eq!(done.meta.message_id, "msg-a");
        assert!(done.is_success());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnect_waits_its_turn_behind_a_running_task() {
        let mut h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = CallerConnection::new("caller", None, tx);

        let first = h
            .dispatcher
            .dispatch(
                &conn,
                &frame("msg-a", "operate", json!({ "device": "windows", "command": "open mail" })),
            )
            .expect("spawned");
        let request = next_request(&mut h.agent_rx).await;

        h.dispatcher
            .dispatch(&conn, &frame("msg-r", "reconnect", json!({ "device": "windows" })))
            .expect("spawned")
            .await
            .expect("join");
        let busy = next_reply(&mut rx).await;
        assert_eq!(busy.meta.message_id, "msg-r");
        assert_eq!(busy.payload.status, ReplyStatus::Failed);
        assert!(busy
            .payload
            .error
            .expect("error")
            .contains("busy running \"operate\""));

        // The running task kept its link.
        h.registry.handle_response(ResponseFrame::ok(request.id, json!(null)));
        first.await.expect("join");
        let done = next_reply(&mut rx).await;
        assert_eq!(done.meta.message_id, "msg-a");
        assert!(done.is_success());
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_device_is_an_invalid_params_failure() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = CallerConnection::new("caller", None, tx);

        h.dispatcher
            .dispatch(&conn, &frame("msg-x", "operate", json!({ "device": "web", "command": "x" })))
            .expect("spawned")
            .await
            .expect("join");
        let reply = rx.recv().await.expect("reply");
        assert_eq!(reply.payload.status, ReplyStatus::Failed);
        assert!(reply
            .payload
            .error
            .expect("error")
            .contains("unknown device `web` (available: windows)"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_and_list_clients_describe_the_pool() {
        let h = harness();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = CallerConnection::new("caller", None, tx);

        h.dispatcher
            .dispatch(&conn, &frame("msg-s", "status", json!({})))
            .expect("spawned")
            .await
            .expect("join");
        let status = rx.recv().await.expect("reply").payload.result.expect("result");
        assert_eq!(status["clients"]["connectedClients"], 1);
        assert_eq!(status["devices"]["windows"]["state"], "stopped");
        assert_eq!(status["devices"]["windows"]["backend"], "desktop");
        assert_eq!(status["locks"], json!([]));

        h.dispatcher
            .dispatch(&conn, &frame("msg-l", "listClients", json!({})))
            .expect("spawned")
            .await
            .expect("join");
        let clients = rx.recv().await.expect("reply").payload.result.expect("result");
        assert_eq!(clients["clients"][0]["machineName"], "DESK-01");
    }
}
