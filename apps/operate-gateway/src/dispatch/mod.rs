//! Front door for caller sockets: parse, route, answer.

pub mod connections;
pub mod envelope;
pub mod guard;
pub mod handlers;
pub mod parse;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use metrics::counter;
use operate_proto::{InboundEnvelope, Meta};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub use connections::{CallerConnection, ConnectionRegistry};
pub use guard::{Acquire, TaskExecutionGuard, TaskLock, TaskPermit};
pub use handlers::Devices;
pub use parse::{parse_envelope, MessageParseError};

use crate::operate::OperateError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    MessageParse(#[from] MessageParseError),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("device {key} is busy with {action} (held by {holder_id})")]
    TaskBusy {
        key: String,
        action: String,
        holder_id: String,
    },
    #[error(transparent)]
    Operate(#[from] OperateError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("processing failed: {0}")]
    Processing(String),
}

impl DispatchError {
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::MessageParse(err) => format!("Could not parse message: {}", err.reason),
            DispatchError::UnknownAction(action) => format!("Unknown action: {action}"),
            DispatchError::InvalidParams(reason) => format!("Invalid parameters: {reason}"),
            DispatchError::TaskBusy { key, action, .. } => format!(
                "The {key} device is busy running \"{action}\"; please try again later"
            ),
            DispatchError::Operate(err) => err.user_message(),
            DispatchError::Registry(err) => err.to_string(),
            DispatchError::Processing(reason) => reason.clone(),
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::MessageParse(_) => "parse_error",
            DispatchError::UnknownAction(_) => "unknown_action",
            DispatchError::InvalidParams(_) => "invalid_params",
            DispatchError::TaskBusy { .. } => "busy",
            DispatchError::Operate(_) => "operate_error",
            DispatchError::Registry(_) => "registry_error",
            DispatchError::Processing(_) => "processing_error",
        }
    }
}

/// Everything a handler gets for one inbound message.
pub struct HandlerContext {
    pub envelope: InboundEnvelope,
    pub connection: CallerConnection,
}

impl HandlerContext {
    pub fn meta(&self) -> &Meta {
        &self.envelope.meta
    }

    pub fn action(&self) -> &str {
        &self.envelope.payload.action
    }

    pub fn send_command(&self, name: &str, data: Value) -> bool {
        self.connection
            .send(envelope::command(self.meta(), name, data))
    }

    pub fn optional_str(&self, key: &str) -> Result<Option<&str>, DispatchError> {
        match self.envelope.payload.field(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(DispatchError::InvalidParams(format!("`{key}` must be a string"))),
        }
    }

    pub fn required_str(&self, key: &str) -> Result<&str, DispatchError> {
        match self.optional_str(key)? {
            Some(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(DispatchError::InvalidParams(format!("`{key}` is required"))),
        }
    }

    pub fn optional_u32(&self, key: &str) -> Result<Option<u32>, DispatchError> {
        match self.envelope.payload.field(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| {
                    DispatchError::InvalidParams(format!("`{key}` must be a non-negative integer"))
                }),
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<Value, DispatchError>;
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn ActionHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: &'static str, handler: impl ActionHandler + 'static) {
        self.handlers.insert(action, Arc::new(handler));
    }

    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<&'static str> = self.handlers.keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    /// Handle one raw frame from `connection`. Replies go out on the same
    /// connection; the returned handle tracks the spawned handler, if any.
    pub fn dispatch(&self, connection: &CallerConnection, raw: &str) -> Option<JoinHandle<()>> {
        let envelope = match parse_envelope(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "rejecting unparseable frame");
                counter!("operate_gateway_dispatch_total", 1, "action" => "unknown", "outcome" => "parse_error");
                connection.send(envelope::parse_error(&err));
                return None;
            }
        };

        let action = envelope.payload.action.clone();
        let Some(handler) = self.handlers.get(action.as_str()).cloned() else {
            warn!(connection_id = %connection.id, action = %action, "unknown action");
            counter!("operate_gateway_dispatch_total", 1, "action" => "unknown", "outcome" => "unknown_action");
            connection.send(envelope::unknown_action(&envelope.meta, &action));
            return None;
        };

        let connection = connection.clone();
        Some(tokio::spawn(async move {
            let meta = envelope.meta.clone();
            let started = Instant::now();
            debug!(
                connection_id = %connection.id,
                message_id = %meta.message_id,
                action = %action,
                "dispatching"
            );
            let ctx = HandlerContext {
                envelope,
                connection: connection.clone(),
            };
            let outcome = AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let reply = match outcome {
                Ok(Ok(result)) => {
                    debug!(message_id = %meta.message_id, action = %action, elapsed_ms, "action succeeded");
                    counter!("operate_gateway_dispatch_total", 1, "action" => action.clone(), "outcome" => "success");
                    envelope::success(&meta, &action, result)
                }
                Ok(Err(err)) => {
                    warn!(
                        message_id = %meta.message_id,
                        action = %action,
                        elapsed_ms,
                        error = ?err,
                        "action failed"
                    );
                    counter!("operate_gateway_dispatch_total", 1, "action" => action.clone(), "outcome" => err.metric_label());
                    envelope::processing_error(&meta, &action, &err.user_message())
                }
                Err(_) => {
                    error!(message_id = %meta.message_id, action = %action, "action handler panicked");
                    counter!("operate_gateway_dispatch_total", 1, "action" => action.clone(), "outcome" => "panic");
                    envelope::processing_error(&meta, &action, "internal error")
                }
            };
            connection.send(reply);
        }))
    }
}
