//! Request id → waiting caller bookkeeping.
//!
//! The table is deliberately unsynchronised: owners keep it behind the same
//! lock as whatever per-peer counters must move together with it.

use std::collections::HashMap;
use std::time::Duration;

use operate_proto::ResponseFrame;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::RegistryError;

pub type Reply = Result<Value, RegistryError>;

/// Turn a response frame into the value or error its caller is waiting for.
pub fn reply_from(response: ResponseFrame) -> Reply {
    if response.success {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|error| (error.code, error.message))
        .unwrap_or_else(|| ("UNKNOWN".into(), "remote request failed".into()));
    Err(RegistryError::Remote { code, message })
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub client_id: String,
    pub action: String,
    pub params: Value,
    pub created_at: Instant,
    pub deadline: Instant,
    continuation: oneshot::Sender<Reply>,
}

impl PendingRequest {
    /// Hand the outcome to the waiting caller. Returns false when the caller
    /// already went away.
    pub fn settle(self, reply: Reply) -> bool {
        self.continuation.send(reply).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: String,
        client_id: &str,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let previous = self.pending.insert(
            id.clone(),
            PendingRequest {
                id,
                client_id: client_id.to_string(),
                action: action.to_string(),
                params,
                created_at,
                deadline: created_at + timeout,
                continuation: tx,
            },
        );
        debug_assert!(previous.is_none(), "correlation id reused");
        rx
    }

    /// Remove a row. The first caller wins; later calls for the same id get
    /// `None`.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.pending.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn count_for(&self, client_id: &str) -> usize {
        self.pending
            .values()
            .filter(|pending| pending.client_id == client_id)
            .count()
    }

    pub fn drain_client(&mut self, client_id: &str) -> Vec<PendingRequest> {
        let ids: Vec<String> = self
            .pending
            .values()
            .filter(|pending| pending.client_id == client_id)
            .map(|pending| pending.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.pending.remove(id)).collect()
    }

    pub fn drain_all(&mut self) -> Vec<PendingRequest> {
        self.pending.drain().map(|(_, pending)| pending).collect()
    }
}
