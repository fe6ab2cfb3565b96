//! Router: the single consumer-facing surface over every backend.
//!
//! This module handles:
//! - Listing capabilities, filtered by relevance when it can be trusted
//! - Falling back to the capped, unfiltered catalog when it can't
//! - Deriving a task description when the consumer gives none
//! - Routing invocations by qualified name
//! - Serving all of the above as line-delimited JSON-RPC

pub mod dispatch;
pub mod errors;
pub mod fallback;
pub mod server;
pub mod task;

// Re-exports for convenience
pub use dispatch::{CapabilityListing, Router, RouterStats};
pub use errors::RouterError;
pub use fallback::{FallbackPolicy, PolicyState};
pub use server::{serve, serve_stdio};
pub use task::{
    DescriberChain, ExplicitQuery, GenericDefault, LastInvoked, TaskContext, TaskDescriber,
};
