//! Resilient lifecycle around one automation agent.
//!
//! An [`OperateService`] hides connection churn from callers: it starts the
//! agent on demand, retries connection-class failures after reconnecting, runs
//! a bounded background reconnect loop, and reports progress through task
//! tips.

pub mod bridge;
pub mod classify;
pub mod desktop;
pub mod driver;
pub mod tips;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use bridge::{BridgeConfig, BridgeDriver};
pub use desktop::DesktopDriver;
pub use driver::{AgentBackend, AutomationDriver, DriverError, Operation, RetryPolicy};
pub use tips::{TaskTipEvent, TaskTips, TipSubscription};

use crate::now_millis;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum OperateError {
    #[error("{service} agent failed to initialize: {source}")]
    InitializationFailed {
        service: String,
        #[source]
        source: DriverError,
    },
    #[error("{task} failed after {attempts} attempt(s): {source}")]
    ExecutionFailed {
        task: String,
        attempts: u32,
        #[source]
        source: DriverError,
    },
    #[error("{0} service is stopping")]
    ServiceStopping(String),
    #[error("script failed ({script}); fallback command also failed ({fallback})")]
    FallbackFailed {
        script: Box<OperateError>,
        fallback: Box<OperateError>,
    },
}

impl OperateError {
    /// Message safe to show to the person who issued the command.
    pub fn user_message(&self) -> String {
        match self {
            OperateError::InitializationFailed { service, .. } => {
                format!("The {service} agent is not available right now; try again shortly")
            }
            OperateError::ExecutionFailed { source, .. } => source.to_string(),
            OperateError::ServiceStopping(service) => {
                format!("The {service} agent is shutting down; try again shortly")
            }
            OperateError::FallbackFailed { script, fallback } => format!(
                "Script failed: {}. Fallback command also failed: {}",
                script.user_message(),
                fallback.user_message()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Running,
    Reconnecting,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Started,
    Reconnecting,
    Reconnected,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub task_name: String,
    pub error: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct OperateConfig {
    /// Device key this service answers for, e.g. `web` or `windows`.
    pub name: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Pause between a reconnect and the retried attempt.
    pub retry_delay: Duration,
}

impl OperateConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            retry_delay: Duration::from_millis(500),
        }
    }
}

struct ServiceInner {
    config: OperateConfig,
    backend: AgentBackend,
    state: RwLock<ServiceState>,
    /// Serialises start, stop and reconnect.
    transition: tokio::sync::Mutex<()>,
    reconnect_attempts: AtomicU32,
    reconnect_loop: Mutex<Option<JoinHandle<()>>>,
    tips: TaskTips,
    task_errors: Mutex<Vec<TaskError>>,
    events: broadcast::Sender<ServiceEvent>,
}

#[derive(Clone)]
pub struct OperateService {
    inner: Arc<ServiceInner>,
}

impl OperateService {
    pub fn new(config: OperateConfig, backend: AgentBackend) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                backend,
                state: RwLock::new(ServiceState::Stopped),
                transition: tokio::sync::Mutex::new(()),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_loop: Mutex::new(None),
                tips: TaskTips::default(),
                task_errors: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn backend(&self) -> &AgentBackend {
        &self.inner.backend
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }

    fn set_state(&self, next: ServiceState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), next);
        if previous != next {
            debug!(service = %self.name(), from = ?previous, to = ?next, "service state changed");
        }
    }

    /// Move to `Reconnecting` unless a stop is underway.
    fn mark_reconnecting(&self) {
        let changed = {
            let mut state = self.inner.state.write();
            match *state {
                ServiceState::Running | ServiceState::Stopped => {
                    *state = ServiceState::Reconnecting;
                    true
                }
                ServiceState::Reconnecting | ServiceState::Stopping => false,
            }
        };
        if changed {
            self.emit(ServiceEvent::Reconnecting);
        }
    }

    fn emit(&self, event: ServiceEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn connect_agent(&self) -> Result<(), OperateError> {
        let driver = self.inner.backend.driver();
        let outcome = match driver.create_agent().await {
            Ok(()) => driver.initialize_connection().await,
            Err(err) => Err(err),
        };
        outcome.map_err(|source| OperateError::InitializationFailed {
            service: self.name().to_string(),
            source,
        })
    }

    pub async fn start(&self) -> Result<(), OperateError> {
        let _transition = self.inner.transition.lock().await;
        match self.state() {
            ServiceState::Running => return Ok(()),
            ServiceState::Stopping => {
                return Err(OperateError::ServiceStopping(self.name().to_string()))
            }
            ServiceState::Stopped | ServiceState::Reconnecting => {}
        }

        if let Err(err) = self.connect_agent().await {
            warn!(service = %self.name(), error = %err, "agent failed to start");
            counter!("operate_gateway_service_start_failures_total", 1, "service" => self.name().to_string());
            return Err(err);
        }
        self.enter_running().await?;
        info!(service = %self.name(), backend = self.inner.backend.kind(), "agent started");
        self.emit(ServiceEvent::Started);
        Ok(())
    }

    /// Stop the agent. A start or reconnect still in flight is waited for
    /// and its fresh link torn down.
    pub async fn stop(&self) {
        let was_stopped = {
            let mut state = self.inner.state.write();
            let was_stopped = *state == ServiceState::Stopped;
            *state = ServiceState::Stopping;
            was_stopped
        };
        self.cancel_reconnect_loop();

        let _transition = self.inner.transition.lock().await;
        if self.state() == ServiceState::Stopped {
            return;
        }
        if !was_stopped {
            self.inner.backend.driver().teardown().await;
        }
        self.inner.reconnect_attempts.store(0, Ordering::Release);
        self.set_state(ServiceState::Stopped);
        if !was_stopped {
            info!(service = %self.name(), "agent stopped");
            self.emit(ServiceEvent::Stopped);
        }
    }

    /// Final step of a successful connect, under the transition lock. A stop
    /// requested meanwhile wins: the new link is torn down instead.
    async fn enter_running(&self) -> Result<(), OperateError> {
        let previous = {
            let mut state = self.inner.state.write();
            let previous = *state;
            if previous != ServiceState::Stopping {
                *state = ServiceState::Running;
            }
            previous
        };
        if previous == ServiceState::Stopping {
            debug!(service = %self.name(), "stop requested while connecting; tearing down");
            self.inner.backend.driver().teardown().await;
            return Err(OperateError::ServiceStopping(self.name().to_string()));
        }
        self.inner.reconnect_attempts.store(0, Ordering::Release);
        debug!(service = %self.name(), from = ?previous, to = ?ServiceState::Running, "service state changed");
        Ok(())
    }

    /// One reconnect under the transition lock. Without `force`, a service
    /// that is already running again is left alone.
    async fn reconnect_once(&self, force: bool) -> Result<(), OperateError> {
        let _transition = self.inner.transition.lock().await;
        match self.state() {
            ServiceState::Stopping => {
                return Err(OperateError::ServiceStopping(self.name().to_string()))
            }
            ServiceState::Running if !force => return Ok(()),
            _ => {}
        }

        counter!("operate_gateway_reconnects_total", 1, "service" => self.name().to_string());
        self.inner.backend.driver().teardown().await;
        self.connect_agent().await?;
        self.enter_running().await?;
        info!(service = %self.name(), "agent reconnected");
        self.emit(ServiceEvent::Reconnected);
        Ok(())
    }

    pub async fn force_reconnect(&self) -> Result<(), OperateError> {
        if self.state() == ServiceState::Stopping {
            return Err(OperateError::ServiceStopping(self.name().to_string()));
        }
        self.cancel_reconnect_loop();
        self.inner.reconnect_attempts.store(0, Ordering::Release);

        match self.reconnect_once(true).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(service = %self.name(), error = %err, "forced reconnect failed");
                if !matches!(err, OperateError::ServiceStopping(_)) {
                    self.mark_reconnecting();
                    self.ensure_reconnect_loop();
                }
                Err(err)
            }
        }
    }

    fn cancel_reconnect_loop(&self) {
        if let Some(handle) = self.inner.reconnect_loop.lock().take() {
            handle.abort();
        }
    }

    /// Arm the background reconnect loop unless one is already running.
    fn ensure_reconnect_loop(&self) {
        let mut slot = self.inner.reconnect_loop.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        debug!(service = %self.name(), "arming reconnect loop");
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.reconnect_interval;
        *slot = Some(tokio::spawn(reconnect_loop(weak, period)));
    }

    pub fn on_task_tip<F>(&self, callback: F) -> TipSubscription
    where
        F: Fn(&TaskTipEvent) + Send + Sync + 'static,
    {
        self.inner.tips.subscribe(callback)
    }

    pub fn off_task_tip(&self, subscription: TipSubscription) -> bool {
        self.inner.tips.unsubscribe(subscription)
    }

    pub fn trigger_task_tip(&self, tip: impl Into<String>, error: Option<String>) -> TaskTipEvent {
        self.inner.tips.trigger(tip, error)
    }

    pub fn task_errors(&self) -> Vec<TaskError> {
        self.inner.task_errors.lock().clone()
    }

    pub fn clear_task_errors(&self) {
        self.inner.task_errors.lock().clear();
    }

    fn record_task_error(&self, task_name: &str, error: &dyn std::fmt::Display) {
        self.inner.task_errors.lock().push(TaskError {
            task_name: task_name.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        });
    }

    fn before_operate(&self) {
        self.inner.tips.reset_steps();
        self.clear_task_errors();
    }

    pub async fn execute(&self, command: &str, max_retries: u32) -> Result<Value, OperateError> {
        self.before_operate();
        self.run_operation(&Operation::Execute(command.to_string()), max_retries)
            .await
    }

    pub async fn expect(&self, condition: &str) -> Result<Value, OperateError> {
        self.before_operate();
        self.run_operation(&Operation::Assert(condition.to_string()), DEFAULT_MAX_RETRIES)
            .await
    }

    /// Run a script; if it ultimately fails and a fallback command is given,
    /// try that command once instead.
    pub async fn execute_script(
        &self,
        content: &str,
        max_retries: u32,
        fallback_command: Option<&str>,
    ) -> Result<Value, OperateError> {
        self.before_operate();
        let script_err = match self
            .run_operation(&Operation::RunScript(content.to_string()), max_retries)
            .await
        {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(fallback) = fallback_command else {
            return Err(script_err);
        };

        warn!(
            service = %self.name(),
            error = %script_err,
            fallback,
            "script failed; trying fallback command"
        );
        self.trigger_task_tip(
            format!("Script failed, trying: {fallback}"),
            Some(script_err.user_message()),
        );
        match self
            .run_operation(&Operation::Execute(fallback.to_string()), 1)
            .await
        {
            Ok(value) => {
                info!(
                    service = %self.name(),
                    script_error = %script_err,
                    "fallback command succeeded; discarding script failure"
                );
                Ok(value)
            }
            Err(fallback_err) => Err(OperateError::FallbackFailed {
                script: Box::new(script_err),
                fallback: Box::new(fallback_err),
            }),
        }
    }

    async fn ensure_started(&self) -> Result<(), OperateError> {
        match self.state() {
            ServiceState::Stopped => self.start().await,
            ServiceState::Stopping => Err(OperateError::ServiceStopping(self.name().to_string())),
            ServiceState::Running | ServiceState::Reconnecting => Ok(()),
        }
    }

    async fn run_operation(
        &self,
        operation: &Operation,
        max_retries: u32,
    ) -> Result<Value, OperateError> {
        let task = operation.task_name();
        self.ensure_started().await?;

        let max_attempts = max_retries.max(1);
        let started = Instant::now();
        self.trigger_task_tip(format!("{task}: {}", operation.subject()), None);

        let mut attempt = 0;
        loop {
            attempt += 1;

            if self.inner.backend.has_probe() && !self.inner.backend.driver().probe().await {
                warn!(service = %self.name(), task, "agent probe failed; reconnecting first");
                self.mark_reconnecting();
                self.trigger_task_tip("Reconnecting to the agent", None);
                if let Err(err) = self.reconnect_once(false).await {
                    self.record_task_error(task, &err);
                    if matches!(err, OperateError::ServiceStopping(_)) || attempt >= max_attempts {
                        self.ensure_reconnect_loop_unless_stopping();
                        return Err(err);
                    }
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                    continue;
                }
            }

            match self.inner.backend.invoke(operation).await {
                Ok(value) => {
                    debug!(
                        service = %self.name(),
                        task,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "task finished"
                    );
                    counter!("operate_gateway_tasks_total", 1, "task" => task, "outcome" => "success");
                    return Ok(value);
                }
                Err(err) if err.is_connection_class() && attempt < max_attempts => {
                    warn!(
                        service = %self.name(),
                        task,
                        attempt,
                        max_attempts,
                        error = %err,
                        "connection lost during task; reconnecting before retry"
                    );
                    self.record_task_error(task, &err);
                    self.trigger_task_tip(
                        format!("Connection lost, retrying ({attempt}/{max_attempts})"),
                        Some(err.to_string()),
                    );
                    self.mark_reconnecting();
                    if let Err(reconnect_err) = self.reconnect_once(false).await {
                        warn!(service = %self.name(), error = %reconnect_err, "reconnect before retry failed");
                        self.record_task_error(task, &reconnect_err);
                        if matches!(reconnect_err, OperateError::ServiceStopping(_)) {
                            return Err(reconnect_err);
                        }
                    }
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
                Err(err) => {
                    self.record_task_error(task, &err);
                    counter!("operate_gateway_tasks_total", 1, "task" => task, "outcome" => "failed");
                    if err.is_connection_class() {
                        self.mark_reconnecting();
                        self.ensure_reconnect_loop_unless_stopping();
                    }
                    return Err(OperateError::ExecutionFailed {
                        task: task.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    fn ensure_reconnect_loop_unless_stopping(&self) {
        if self.state() == ServiceState::Reconnecting {
            self.ensure_reconnect_loop();
        }
    }
}

async fn reconnect_loop(weak: Weak<ServiceInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let service = OperateService { inner };
        match service.state() {
            ServiceState::Reconnecting => {}
            state => {
                debug!(service = %service.name(), ?state, "reconnect loop no longer needed");
                return;
            }
        }

        let attempt = service.inner.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        let max_attempts = service.inner.config.max_reconnect_attempts.max(1);
        match service.reconnect_once(false).await {
            Ok(()) => return,
            Err(OperateError::ServiceStopping(_)) => return,
            Err(err) => {
                warn!(
                    service = %service.name(),
                    attempt,
                    max_attempts,
                    error = %err,
                    "background reconnect failed"
                );
                if attempt >= max_attempts {
                    let gave_up = {
                        let mut state = service.inner.state.write();
                        if *state == ServiceState::Reconnecting {
                            *state = ServiceState::Stopped;
                            true
                        } else {
                            false
                        }
                    };
                    service.inner.reconnect_attempts.store(0, Ordering::Release);
                    if gave_up {
                        error!(
                            service = %service.name(),
                            attempts = max_attempts,
                            "giving up on reconnecting; start or reconnect explicitly"
                        );
                        service.emit(ServiceEvent::Stopped);
                    }
                    return;
                }
            }
        }
    }
}
