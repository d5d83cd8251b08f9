//! Keyed mutex keeping one long-running task per device class.

use std::collections::HashMap;
use std::sync::Arc;

use operate_proto::Meta;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLock {
    pub key: String,
    /// `messageId` of the request holding the lock.
    pub holder_id: String,
    pub action: String,
    pub started_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    Busy(TaskLock),
}

#[derive(Debug, Default)]
pub struct TaskExecutionGuard {
    locks: Mutex<HashMap<String, TaskLock>>,
}

impl TaskExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: &str, meta: &Meta, action: &str) -> Acquire {
        let mut locks = self.locks.lock();
        if let Some(current) = locks.get(key) {
            debug!(key, holder_id = %current.holder_id, requested_by = %meta.message_id, "task lock busy");
            return Acquire::Busy(current.clone());
        }
        locks.insert(
            key.to_string(),
            TaskLock {
                key: key.to_string(),
                holder_id: meta.message_id.clone(),
                action: action.to_string(),
                started_at: crate::now_millis(),
            },
        );
        Acquire::Acquired
    }

    /// Clear the lock only when `holder_id` still owns it.
    pub fn release(&self, key: &str, holder_id: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(current) if current.holder_id == holder_id => {
                locks.remove(key);
                true
            }
            Some(current) => {
                warn!(
                    key,
                    holder_id,
                    current_holder = %current.holder_id,
                    "ignoring release from a task that no longer holds the lock"
                );
                false
            }
            None => {
                debug!(key, holder_id, "release on an unlocked key");
                false
            }
        }
    }

    pub fn current(&self, key: &str) -> Option<TaskLock> {
        self.locks.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<TaskLock> {
        let mut locks: Vec<TaskLock> = self.locks.lock().values().cloned().collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        locks
    }

    /// Acquire and get a permit that releases on drop.
    pub fn acquire_permit(
        self: &Arc<Self>,
        key: &str,
        meta: &Meta,
        action: &str,
    ) -> Result<TaskPermit, TaskLock> {
        match self.try_acquire(key, meta, action) {
            Acquire::Acquired => Ok(TaskPermit {
                guard: Arc::clone(self),
                key: key.to_string(),
                holder_id: meta.message_id.clone(),
            }),
            Acquire::Busy(current) => Err(current),
        }
    }
}

#[derive(Debug)]
pub struct TaskPermit {
    guard: Arc<TaskExecutionGuard>,
    key: String,
    holder_id: String,
}

impl TaskPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        self.guard.release(&self.key, &self.holder_id);
    }
}
