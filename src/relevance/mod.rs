//! Relevance ranking: which capabilities matter for the current task.
//!
//! This module handles:
//! - The `RelevanceService` boundary (remote HTTP selection service or
//!   local embedding-based ranking)
//! - Validating and trimming service rankings
//! - Health caching and the circuit breaker around the service
//! - Failing closed: every failure becomes a pass-through

pub mod client;
pub mod embedding;
pub mod errors;
pub mod health;
pub mod service;
pub mod types;

// Re-exports for convenience
pub use client::RelevanceClient;
pub use embedding::EmbeddingRelevanceService;
pub use errors::RelevanceError;
pub use health::{CircuitState, HealthStatus, RelevanceHealth};
pub use service::{HttpRelevanceService, Ranking, RelevanceService};
pub use types::{
    PassThroughReason, RelevanceQuery, RelevanceResult, ScoredCapability, SelectOutcome,
};
