//! Error types shared by every layer of the core

use crate::infrastructure::ai::ProviderError;
use serde_json::Value;
use thiserror::Error;

/// Default message carried by a permission rejection without an explicit reason.
pub const DEFAULT_REJECTION_MESSAGE: &str =
    "The user rejected permission to use this specific tool call. You may try again with different parameters.";

/// Raised when a user (or a `permission.ask` hook) rejects a tool invocation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct PermissionRejectedError {
    pub session_id: String,
    pub permission_id: String,
    pub call_id: Option<String>,
    pub metadata: Value,
    pub message: String,
}

impl PermissionRejectedError {
    pub fn new(
        session_id: impl Into<String>,
        permission_id: impl Into<String>,
        call_id: Option<String>,
        metadata: Value,
        reason: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            permission_id: permission_id.into(),
            call_id,
            metadata,
            message: reason.unwrap_or_else(|| DEFAULT_REJECTION_MESSAGE.to_string()),
        }
    }
}

/// Errors surfaced by the core. Cloneable so one loop result can be handed
/// to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StewardError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session is busy: {0}")]
    SessionBusy(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    PermissionRejected(#[from] PermissionRejectedError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StewardResult<T> = Result<T, StewardError>;

impl StewardError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Self::Tool(msg.into())
    }

    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
            || matches!(self, Self::Provider(ProviderError::Aborted))
    }
}

impl From<serde_json::Error> for StewardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StewardError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for StewardError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<steward_core_types::ToolStateError> for StewardError {
    fn from(err: steward_core_types::ToolStateError) -> Self {
        Self::Internal(err.to_string())
    }
}
