use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::classify::is_connection_failure;
use super::desktop::DesktopDriver;
use crate::registry::RegistryError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("agent is not connected: {0}")]
    NotConnected(String),
    #[error("{0}")]
    Timeout(String),
    #[error("transport closed: {0}")]
    TransportClosed(String),
    #[error("debugger detached: {0}")]
    DebuggerDetached(String),
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
    #[error("{0}")]
    Failed(String),
}

impl DriverError {
    /// Whether the failure came from the link to the agent rather than from
    /// the automation itself.
    pub fn is_connection_class(&self) -> bool {
        match self {
            DriverError::NotConnected(_)
            | DriverError::Timeout(_)
            | DriverError::TransportClosed(_)
            | DriverError::DebuggerDetached(_) => true,
            DriverError::Remote { code, message } => {
                is_connection_failure(code) || is_connection_failure(message)
            }
            DriverError::Failed(message) => is_connection_failure(message),
        }
    }
}

impl From<RegistryError> for DriverError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoAvailableClient => {
                DriverError::NotConnected("no remote client is connected".into())
            }
            RegistryError::UnknownClient(id) => {
                DriverError::TransportClosed(format!("remote client {id} went away"))
            }
            err @ RegistryError::RequestTimeout { .. } => DriverError::Timeout(err.to_string()),
            err @ (RegistryError::ClientDisconnected | RegistryError::Transport(_)) => {
                DriverError::TransportClosed(err.to_string())
            }
            RegistryError::Remote { code, message } => DriverError::Remote { code, message },
            RegistryError::Encode(message) => DriverError::Failed(message),
        }
    }
}

/// Capped retry with a doubling delay, used while establishing a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(
                        label,
                        attempt,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Hooks implemented by a concrete automation backend.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Build fresh driver state. Called before every (re)connection.
    async fn create_agent(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// First real handshake with the agent.
    async fn initialize_connection(&self) -> Result<(), DriverError>;

    async fn execute(&self, command: &str) -> Result<Value, DriverError>;

    async fn assert(&self, condition: &str) -> Result<Value, DriverError>;

    async fn run_script(&self, content: &str) -> Result<Value, DriverError>;

    /// Out-of-band connectivity check.
    async fn probe(&self) -> bool {
        true
    }

    async fn teardown(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Execute(String),
    Assert(String),
    RunScript(String),
}

impl Operation {
    pub fn task_name(&self) -> &'static str {
        match self {
            Operation::Execute(_) => "execute",
            Operation::Assert(_) => "assert",
            Operation::RunScript(_) => "runScript",
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            Operation::Execute(text) | Operation::Assert(text) | Operation::RunScript(text) => text,
        }
    }
}

/// The agent an operate service drives, fixed when the service is built.
#[derive(Clone)]
pub enum AgentBackend {
    /// Direct link to a single agent, with its own connectivity probe.
    Bridge(Arc<dyn AutomationDriver>),
    /// Pool of desktop agents behind the client registry.
    Desktop(DesktopDriver),
}

impl AgentBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentBackend::Bridge(_) => "bridge",
            AgentBackend::Desktop(_) => "desktop",
        }
    }

    pub fn driver(&self) -> &dyn AutomationDriver {
        match self {
            AgentBackend::Bridge(driver) => driver.as_ref(),
            AgentBackend::Desktop(driver) => driver,
        }
    }

    pub fn has_probe(&self) -> bool {
        matches!(self, AgentBackend::Bridge(_))
    }

    pub async fn invoke(&self, operation: &Operation) -> Result<Value, DriverError> {
        let driver = self.driver();
        match operation {
            Operation::Execute(command) => driver.execute(command).await,
            Operation::Assert(condition) => driver.assert(condition).await,
            Operation::RunScript(content) => driver.run_script(content).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test_timeout::timeout]
    fn registry_failures_map_onto_connection_classes() {
        let timeout = DriverError::from(RegistryError::RequestTimeout {
            request_id: "r".into(),
            action: "execute".into(),
            timeout_ms: 10,
        });
        assert!(timeout.is_connection_class());
        assert!(DriverError::from(RegistryError::NoAvailableClient).is_connection_class());
        assert!(DriverError::from(RegistryError::ClientDisconnected).is_connection_class());

        let logical = DriverError::from(RegistryError::Remote {
            code: "ELEMENT_NOT_FOUND".into(),
            message: "no such button".into(),
        });
        assert!(!logical.is_connection_class());

        let remote_socket = DriverError::Remote {
            code: "E_AGENT".into(),
            message: "socket hang up".into(),
        };
        assert!(remote_socket.is_connection_class());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn retry_policy_stops_after_the_cap() {
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(150),
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();
        let outcome: Result<(), DriverError> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DriverError::NotConnected("down".into()))
            })
            .await;
        assert!(outcome.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // 100ms then a capped 150ms.
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn retry_policy_returns_first_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = RetryPolicy::default()
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DriverError::Timeout("slow".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(value, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
