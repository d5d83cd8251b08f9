use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Progress notification raised while a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTipEvent {
    pub tip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub step_index: u32,
}

pub type TaskTipCallback = Arc<dyn Fn(&TaskTipEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TipSubscription(u64);

#[derive(Default)]
pub struct TaskTips {
    callbacks: Mutex<Vec<(TipSubscription, TaskTipCallback)>>,
    next_id: AtomicU64,
    step: AtomicU32,
}

impl TaskTips {
    pub fn subscribe<F>(&self, callback: F) -> TipSubscription
    where
        F: Fn(&TaskTipEvent) + Send + Sync + 'static,
    {
        let subscription = TipSubscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .push((subscription, Arc::new(callback)));
        subscription
    }

    pub fn unsubscribe(&self, subscription: TipSubscription) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != subscription);
        callbacks.len() != before
    }

    pub fn reset_steps(&self) {
        self.step.store(0, Ordering::Release);
    }

    /// Fire every callback with the next step index. Callbacks run against a
    /// snapshot, so they may subscribe or unsubscribe re-entrantly.
    pub fn trigger(&self, tip: impl Into<String>, error: Option<String>) -> TaskTipEvent {
        let event = TaskTipEvent {
            tip: tip.into(),
            error,
            step_index: self.step.fetch_add(1, Ordering::AcqRel),
        };
        let snapshot: Vec<TaskTipCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(&event);
        }
        event
    }
}
