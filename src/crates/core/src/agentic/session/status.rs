use crate::agentic::events::{CoreEvent, EventBus};
use dashmap::DashMap;
use std::sync::Arc;
use steward_core_types::SessionStatus;

/// Live status per session. Idle sessions are not stored.
pub struct SessionStatusRegistry {
    statuses: DashMap<String, SessionStatus>,
    events: Arc<EventBus>,
}

impl SessionStatusRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            statuses: DashMap::new(),
            events,
        }
    }

    pub fn get(&self, session_id: &str) -> SessionStatus {
        self.statuses
            .get(session_id)
            .map(|s| s.clone())
            .unwrap_or(SessionStatus::Idle)
    }

    pub fn list(&self) -> Vec<(String, SessionStatus)> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn set(&self, session_id: &str, status: SessionStatus) {
        self.events.publish(CoreEvent::SessionStatus {
            session_id: session_id.to_string(),
            status: status.clone(),
        });
        if status == SessionStatus::Idle {
            self.statuses.remove(session_id);
            self.events.publish(CoreEvent::SessionIdle {
                session_id: session_id.to_string(),
            });
        } else {
            self.statuses.insert(session_id.to_string(), status);
        }
    }
}
