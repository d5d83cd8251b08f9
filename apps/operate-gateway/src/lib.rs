//! Gateway between automation callers and the remote agents that carry out
//! their commands.
//!
//! Callers connect on `/ws` and send envelopes naming an action. Long-running
//! actions are routed to an [`operate::OperateService`], which drives either a
//! browser bridge or the pool of desktop agents held by
//! [`registry::ClientRegistry`]. Desktop agents connect on `/ws/agent`.

pub mod agent_socket;
pub mod config;
pub mod dispatch;
pub mod operate;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod websocket;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
