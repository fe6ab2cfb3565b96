//! Backend connection error types.

use thiserror::Error;

/// Errors that can occur while talking to a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or failed its handshake.
    #[error("failed to connect backend '{backend}': {reason}")]
    Connection {
        backend: String,
        reason: String,
    },

    /// The backend answered with something that doesn't follow the protocol.
    #[error("protocol error from backend '{backend}': {reason}")]
    Protocol {
        backend: String,
        reason: String,
    },

    /// The backend reported a failure for a specific call. Passed through
    /// to the consumer verbatim.
    #[error("backend '{backend}' reported error [{code}]: {message}")]
    Invocation {
        backend: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The backend is disconnected (process exited, stream closed, or
    /// explicitly shut down).
    #[error("backend '{backend}' is unavailable")]
    Unavailable {
        backend: String,
    },

    /// A call did not complete within its timeout.
    #[error("call '{method}' to backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout {
        backend: String,
        method: String,
        timeout_ms: u64,
    },

    /// I/O or framing failure on the transport.
    #[error("transport error for backend '{backend}': {reason}")]
    Transport {
        backend: String,
        reason: String,
    },
}

impl BackendError {
    /// Transient failures are retried with backoff before the backend is
    /// marked degraded.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    /// The request never reached the backend, so sending it again cannot
    /// run the call twice.
    pub fn is_undelivered(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

        /// The backend id this error refers to.
    pub fn backend(&self) -> &str {
        match self {
            Self::Connection { backend, .. }
            | Self::Protocol { backend, .. }
            | Self::Invocation { backend, .. }
            | Self::Unavailable { backend }
            | Self::Timeout { backend, .. }
            | Self::Transport { backend, .. } => backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_transport_are_transient() {
        let timeout = BackendError::Timeout {
            backend: "fs".into(),
            method: "tools/call".into(),
            timeout_ms: 100,
        };
        let transport = BackendError::Transport {
            backend: "fs".into(),
            reason: "broken pipe".into(),
        };
        assert!(timeout.is_transient());
        assert!(transport.is_transient());

        // A timed-out request was written; a failed write was not.
        assert!(!timeout.is_undelivered());
        assert!(transport.is_undelivered());
    }

    #[test]
    fn invocation_and_unavailable_are_not_transient() {
        let invocation = BackendError::Invocation {
            backend: "fs".into(),
            code: -32001,
            message: "no such file".into(),
            data: None,
        };
        let unavailable = BackendError::Unavailable { backend: "fs".into() };
        assert!(!invocation.is_transient());
        assert!(!unavailable.is_transient());
        assert_eq!(invocation.backend(), "fs");
    }

    #[test]
    fn display_includes_backend_and_code() {
        let err = BackendError::Invocation {
            backend: "math".into(),
            code: -32602,
            message: "bad operand".into(),
            data: None,
        };
        assert_eq!(
            err.to_string(),
            "backend 'math' reported error [-32602]: bad operand"
        );
    }
}
