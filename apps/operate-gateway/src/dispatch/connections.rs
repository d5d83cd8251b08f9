use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use operate_proto::OutboundEnvelope;
use tokio::sync::mpsc;
use tracing::debug;

pub type EnvelopeSender = mpsc::UnboundedSender<OutboundEnvelope>;

/// Handle to one caller socket; cloning shares the same writer.
#[derive(Debug, Clone)]
pub struct CallerConnection {
    pub id: String,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: i64,
    tx: EnvelopeSender,
}

impl CallerConnection {
    pub fn new(id: impl Into<String>, remote_addr: Option<SocketAddr>, tx: EnvelopeSender) -> Self {
        Self {
            id: id.into(),
            remote_addr,
            connected_at: crate::now_millis(),
            tx,
        }
    }

    /// Queue an envelope for the socket writer. False once the socket is gone.
    pub fn send(&self, envelope: OutboundEnvelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(_) => {
                debug!(connection_id = %self.id, "caller socket already closed");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, CallerConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: CallerConnection) {
        self.connections.insert(connection.id.clone(), connection);
        metrics::gauge!("operate_gateway_caller_connections", self.len() as f64);
    }

    pub fn remove(&self, id: &str) -> Option<CallerConnection> {
        let removed = self.connections.remove(id).map(|(_, connection)| connection);
        metrics::gauge!("operate_gateway_caller_connections", self.len() as f64);
        removed
    }

    pub fn get(&self, id: &str) -> Option<CallerConnection> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn for_each(&self, mut f: impl FnMut(&CallerConnection)) {
        for entry in self.connections.iter() {
            f(entry.value());
        }
    }

    /// Send to every caller; returns how many accepted the envelope.
    pub fn broadcast(&self, envelope: &OutboundEnvelope) -> usize {
        let mut delivered = 0;
        self.for_each(|connection| {
            if connection.send(envelope.clone()) {
                delivered += 1;
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
