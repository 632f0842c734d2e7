use crate::agentic::permission::{PermissionRequest, PermissionResponse};
use serde::Serialize;
use steward_core_types::{MessageError, MessageInfo, Part, Session, SessionStatus};

/// Events published by the core.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "properties")]
pub enum CoreEvent {
    #[serde(rename = "session.created")]
    SessionCreated { info: Session },

    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },

    #[serde(rename = "session.deleted")]
    SessionDeleted { info: Session },

    #[serde(rename = "session.error", rename_all = "camelCase")]
    SessionError {
        session_id: Option<String>,
        error: MessageError,
    },

    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },

    #[serde(rename = "session.idle", rename_all = "camelCase")]
    SessionIdle { session_id: String },

    #[serde(rename = "session.compacted", rename_all = "camelCase")]
    SessionCompacted { session_id: String },

    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },

    #[serde(rename = "message.removed", rename_all = "camelCase")]
    MessageRemoved {
        session_id: String,
        message_id: String,
    },

    #[serde(rename = "message.part.updated")]
    PartUpdated {
        part: Part,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },

    #[serde(rename = "message.part.removed", rename_all = "camelCase")]
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },

    #[serde(rename = "permission.updated")]
    PermissionUpdated(PermissionRequest),

    #[serde(rename = "permission.replied", rename_all = "camelCase")]
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: PermissionResponse,
    },
}

impl CoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionError { .. } => "session.error",
            Self::SessionStatus { .. } => "session.status",
            Self::SessionIdle { .. } => "session.idle",
            Self::SessionCompacted { .. } => "session.compacted",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::PartUpdated { .. } => "message.part.updated",
            Self::PartRemoved { .. } => "message.part.removed",
            Self::PermissionUpdated(_) => "permission.updated",
            Self::PermissionReplied { .. } => "permission.replied",
        }
    }

    /// Session the event belongs to, when it belongs to one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { info }
            | Self::SessionUpdated { info }
            | Self::SessionDeleted { info } => Some(&info.id),
            Self::SessionError { session_id, .. } => session_id.as_deref(),
            Self::SessionStatus { session_id, .. }
            | Self::SessionIdle { session_id }
            | Self::SessionCompacted { session_id }
            | Self::MessageRemoved { session_id, .. }
            | Self::PartRemoved { session_id, .. }
            | Self::PermissionReplied { session_id, .. } => Some(session_id),
            Self::MessageUpdated { info } => Some(info.session_id()),
            Self::PartUpdated { part, .. } => Some(&part.session_id),
            Self::PermissionUpdated(request) => Some(&request.session_id),
        }
    }
}
