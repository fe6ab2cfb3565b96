//! Relevance service error types.
//!
//! None of these reach the consumer: the relevance client turns every one
//! into a pass-through.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelevanceError {
    #[error("relevance request failed (HTTP {status}): {body}")]
    Http { status: u16, body: String },

    #[error("relevance request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("relevance request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed relevance response: {reason}")]
    Malformed { reason: String },

    #[error("relevance circuit is open")]
    CircuitOpen,
}
