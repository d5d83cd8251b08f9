use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::driver::{AutomationDriver, DriverError, RetryPolicy};
use crate::registry::ClientRegistry;

/// Routes automation calls to the least-loaded desktop agent in the registry.
#[derive(Clone)]
pub struct DesktopDriver {
    registry: ClientRegistry,
    request_timeout: Duration,
    init_policy: RetryPolicy,
}

impl DesktopDriver {
    pub fn new(registry: ClientRegistry) -> Self {
        let request_timeout = registry.request_timeout();
        Self {
            registry,
            request_timeout,
            init_policy: RetryPolicy::default(),
        }
    }

    pub fn with_init_policy(mut self, policy: RetryPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, DriverError> {
        let client = self.registry.select_client()?;
        debug!(
            client_id = %client.id,
            machine_name = %client.machine_name,
            active_requests = client.active_requests,
            action,
            "routing to desktop client"
        );
        self.registry
            .send_request(&client.id, action, params, self.request_timeout)
            .await
            .map_err(DriverError::from)
    }
}

#[async_trait]
impl AutomationDriver for DesktopDriver {
    async fn initialize_connection(&self) -> Result<(), DriverError> {
        let registry = &self.registry;
        self.init_policy
            .run("desktop client lookup", move || async move {
                registry
                    .select_client()
                    .map(|_| ())
                    .map_err(DriverError::from)
            })
            .await
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
}
