//! Router error types and their JSON-RPC codes.

use thiserror::Error;

use crate::backend::types::error_codes;
use crate::backend::BackendError;

/// Errors returned to the consumer by the router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("capability not found: '{name}'")]
    CapabilityNotFound { name: String },

    #[error("backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The backend's own error, passed through unchanged.
    #[error("backend '{backend}' reported error [{code}]: {message}")]
    Invocation {
        backend: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("protocol error from backend '{backend}': {reason}")]
    Protocol { backend: String, reason: String },

    #[error("invalid capability name '{name}': expected '<backend>::<capability>'")]
    InvalidName { name: String },
}

impl RouterError {
    /// JSON-RPC error code for the consumer response.
    pub fn code(&self) -> i32 {
        match self {
            Self::CapabilityNotFound { .. } => error_codes::CAPABILITY_NOT_FOUND,
            Self::BackendUnavailable { .. } => error_codes::BACKEND_UNAVAILABLE,
            Self::Invocation { code, .. } => *code,
            Self::Protocol { .. } => error_codes::INTERNAL_ERROR,
            Self::InvalidName { .. } => error_codes::INVALID_PARAMS,
        }
    }

    /// Message for the consumer response. Invocation errors keep the
    /// backend's message verbatim.
    pub fn message(&self) -> String {
        match self {
            Self::Invocation { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Extra data for the consumer response.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            Self::Invocation { data, .. } => data.clone(),
            Self::BackendUnavailable { backend, .. } | Self::Protocol { backend, .. } => {
                Some(serde_json::json!({ "backend": backend }))
            }
            Self::CapabilityNotFound { name } | Self::InvalidName { name } => {
                Some(serde_json::json!({ "name": name }))
            }
        }
    }
}

impl From<BackendError> for RouterError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Invocation {
                backend,
                code,
                message,
                data,
            } => Self::Invocation {
                backend,
                code,
                message,
                data,
            },
            BackendError::Protocol { backend, reason } => Self::Protocol { backend, reason },
            other => Self::BackendUnavailable {
                backend: other.backend().to_string(),
                reason: other.to_string(),
            },
        }
    }
}
