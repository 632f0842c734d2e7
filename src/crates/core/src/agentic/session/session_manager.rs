//! Session, message and part persistence
//!
//! Storage layout:
//! - `["session", session_id]`
//! - `["message", session_id, message_id]`
//! - `["part", message_id, part_id]`
//!
//! Every write publishes the matching core event.

use crate::agentic::events::{CoreEvent, EventBus};
use crate::infrastructure::storage::{Storage, StorageExt};
use crate::util::errors::{StewardError, StewardResult};
use crate::util::identifier::{ascending, IdPrefix};
use log::{debug, info};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use steward_core_types::{
    MessageInfo, MessageWithParts, Part, PermissionRule, Session, SessionTime,
};

const NEW_SESSION_PREFIX: &str = "New session - ";
const CHILD_SESSION_PREFIX: &str = "Child session - ";

#[derive(Debug, Clone, Default)]
pub struct CreateSessionInput {
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub project_id: String,
    pub directory: String,
    pub permission: Vec<PermissionRule>,
}

pub fn default_title(is_child: bool) -> String {
    let prefix = if is_child {
        CHILD_SESSION_PREFIX
    } else {
        NEW_SESSION_PREFIX
    };
    format!(
        "{}{}",
        prefix,
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
    )
}

pub fn is_default_title(title: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(New session - |Child session - )\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$").ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(title))
}

pub struct SessionManager {
    storage: Arc<dyn Storage>,
    events: Arc<EventBus>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub async fn create(&self, input: CreateSessionInput) -> StewardResult<Session> {
        let now = chrono::Utc::now().timestamp_millis();
        let is_child = input.parent_id.is_some();
        let session = Session {
            id: ascending(IdPrefix::Session),
            project_id: input.project_id,
            directory: input.directory,
            parent_id: input.parent_id,
            title: input.title.unwrap_or_else(|| default_title(is_child)),
            permission: input.permission,
            revert: None,
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
            },
        };
        self.storage
            .write_as(&["session", &session.id], &session)
            .await?;
        info!(
            "Session created: session_id={}, parent_id={:?}",
            session.id, session.parent_id
        );
        self.events.publish(CoreEvent::SessionCreated {
            info: session.clone(),
        });
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> StewardResult<Session> {
        self.storage
            .read_as(&["session", session_id])
            .await
            .map_err(|e| match e {
                StewardError::NotFound(_) => {
                    StewardError::not_found(format!("Session not found: {}", session_id))
                }
                other => other,
            })
    }

    /// Applies `f` and bumps `time.updated`.
    pub async fn update<F>(&self, session_id: &str, f: F) -> StewardResult<Session>
    where
        F: FnOnce(&mut Session) + Send + 'static,
    {
        let now = chrono::Utc::now().timestamp_millis();
        let session: Session = self
            .storage
            .update_as(&["session", session_id], move |session: &mut Session| {
                f(session);
                session.time.updated = now;
            })
            .await?;
        self.events.publish(CoreEvent::SessionUpdated {
            info: session.clone(),
        });
        Ok(session)
    }

    pub async fn touch(&self, session_id: &str) -> StewardResult<Session> {
        self.update(session_id, |_| {}).await
    }

    pub async fn list(&self) -> StewardResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.storage.list(&["session"]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            sessions.push(self.storage.read_as::<Session>(&key).await?);
        }
        Ok(sessions)
    }

    pub async fn children(&self, parent_id: &str) -> StewardResult<Vec<Session>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Removes the session, its children, and all their messages and parts.
    pub async fn remove(&self, session_id: &str) -> StewardResult<()> {
        let session = self.get(session_id).await?;
        let mut stack = vec![session];
        let mut ordered = Vec::new();
        while let Some(current) = stack.pop() {
            stack.extend(self.children(&current.id).await?);
            ordered.push(current);
        }

        // Children before parents.
        for session in ordered.into_iter().rev() {
            for message in self.message_ids(&session.id).await? {
                self.remove_message(&session.id, &message).await?;
            }
            self.storage.remove(&["session", &session.id]).await?;
            info!("Session removed: session_id={}", session.id);
            self.events.publish(CoreEvent::SessionDeleted { info: session });
        }
        Ok(())
    }

    pub async fn update_message(&self, info: MessageInfo) -> StewardResult<MessageInfo> {
        self.storage
            .write_as(&["message", info.session_id(), info.id()], &info)
            .await?;
        self.events.publish(CoreEvent::MessageUpdated { info: info.clone() });
        Ok(info)
    }

    /// Applies `f` to the stored message under its storage lock.
    pub async fn update_message_with<F>(
        &self,
        session_id: &str,
        message_id: &str,
        f: F,
    ) -> StewardResult<MessageInfo>
    where
        F: FnOnce(&mut MessageInfo) + Send + 'static,
    {
        let info: MessageInfo = self
            .storage
            .update_as(&["message", session_id, message_id], f)
            .await?;
        self.events.publish(CoreEvent::MessageUpdated { info: info.clone() });
        Ok(info)
    }

    pub async fn get_message(&self, session_id: &str, message_id: &str) -> StewardResult<MessageWithParts> {
        let info: MessageInfo = self
            .storage
            .read_as(&["message", session_id, message_id])
            .await?;
        let parts = self.parts(message_id).await?;
        Ok(MessageWithParts { info, parts })
    }

    pub async fn remove_message(&self, session_id: &str, message_id: &str) -> StewardResult<()> {
        for key in self.storage.list(&["part", message_id]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            self.storage.remove(&key).await?;
        }
        self.storage
            .remove(&["message", session_id, message_id])
            .await?;
        debug!(
            "Message removed: session_id={}, message_id={}",
            session_id, message_id
        );
        self.events.publish(CoreEvent::MessageRemoved {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    /// Persists `part`. `delta` carries the appended text for streaming consumers.
    pub async fn update_part(&self, part: &Part, delta: Option<String>) -> StewardResult<()> {
        self.storage
            .write_as(&["part", &part.message_id, &part.id], part)
            .await?;
        self.events.publish(CoreEvent::PartUpdated {
            part: part.clone(),
            delta,
        });
        Ok(())
    }

    pub async fn remove_part(&self, session_id: &str, message_id: &str, part_id: &str) -> StewardResult<()> {
        self.storage.remove(&["part", message_id, part_id]).await?;
        self.events.publish(CoreEvent::PartRemoved {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            part_id: part_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_part(&self, message_id: &str, part_id: &str) -> StewardResult<Part> {
        self.storage.read_as(&["part", message_id, part_id]).await
    }

    /// Parts of a message, ordered by id.
    pub async fn parts(&self, message_id: &str) -> StewardResult<Vec<Part>> {
        let mut parts = Vec::new();
        for key in self.storage.list(&["part", message_id]).await? {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            match self.storage.read_as::<Part>(&key).await {
                Ok(part) => parts.push(part),
                // Removed between list and read.
                Err(StewardError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(parts)
    }

    async fn message_ids(&self, session_id: &str) -> StewardResult<Vec<String>> {
        Ok(self
            .storage
            .list(&["message", session_id])
            .await?
            .into_iter()
            .filter_map(|key| key.last().cloned())
            .collect())
    }

    /// Full history, oldest first.
    pub async fn messages(&self, session_id: &str) -> StewardResult<Vec<MessageWithParts>> {
        let mut messages = Vec::new();
        for message_id in self.message_ids(session_id).await? {
            match self.get_message(session_id, &message_id).await {
                Ok(message) => messages.push(message),
                Err(StewardError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        messages.sort_by(|a, b| a.info.id().cmp(b.info.id()));
        Ok(messages)
    }
}
