use std::collections::BTreeMap;
use steward_core_types::{ApiErrorData, MessageError};
use thiserror::Error;

/// Failure reported by a model provider, before it is recorded on a message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("Provider auth error: provider_id={provider_id}, {message}")]
    Auth {
        provider_id: String,
        message: String,
    },

    #[error("{message}")]
    ApiCall {
        message: String,
        status_code: Option<u16>,
        is_retryable: bool,
        /// `None` when no HTTP response was received
        response_headers: Option<BTreeMap<String, String>>,
        response_body: Option<String>,
    },

    #[error("Output length exceeded")]
    OutputLength,

    #[error("Connection reset by server: {0}")]
    ConnectionReset(String),

    #[error("Aborted")]
    Aborted,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn api(message: impl Into<String>, status_code: Option<u16>, is_retryable: bool) -> Self {
        Self::ApiCall {
            message: message.into(),
            status_code,
            is_retryable,
            response_headers: None,
            response_body: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Structured form persisted on the assistant message.
    pub fn to_message_error(&self) -> MessageError {
        match self {
            Self::Auth {
                provider_id,
                message,
            } => MessageError::Auth {
                provider_id: provider_id.clone(),
                message: message.clone(),
            },
            Self::ApiCall {
                message,
                status_code,
                is_retryable,
                response_headers,
                response_body,
            } => MessageError::Api(ApiErrorData {
                message: message.clone(),
                status_code: *status_code,
                is_retryable: *is_retryable,
                response_headers: response_headers.clone(),
                response_body: response_body.clone(),
                metadata: None,
            }),
            Self::OutputLength => MessageError::OutputLength,
            Self::ConnectionReset(detail) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("code".to_string(), "ECONNRESET".to_string());
                metadata.insert("message".to_string(), detail.clone());
                MessageError::Api(ApiErrorData {
                    message: "Connection reset by server".to_string(),
                    status_code: None,
                    is_retryable: true,
                    response_headers: None,
                    response_body: None,
                    metadata: Some(metadata),
                })
            }
            Self::Aborted => MessageError::Aborted {
                message: "The operation was aborted".to_string(),
            },
            Self::Other(message) => MessageError::Unknown {
                message: message.clone(),
            },
        }
    }
}
