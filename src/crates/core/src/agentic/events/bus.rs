//! In-process event fan-out
//!
//! Callback subscribers run synchronously on the publishing task, in
//! subscription order. Channel subscribers receive a clone through an
//! unbounded queue and are dropped once their receiver closes.

use super::types::CoreEvent;
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

pub type EventCallback = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(SubscriptionId, EventCallback)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<CoreEvent>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: CoreEvent) {
        trace!(
            "Publishing event: name={}, session_id={:?}",
            event.name(),
            event.session_id()
        );

        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
        let callbacks: Vec<EventCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&event);
        }

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscribe(&self, callback: impl Fn(&CoreEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<CoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}
