//! Backend connections: JSON-RPC over stdio to capability providers.
//!
//! This module handles:
//! - Spawning backend child processes (or serving in-process backends)
//! - Multiplexed JSON-RPC 2.0 communication over their stdio
//! - The `initialize` handshake and paginated `tools/list`
//! - Forwarding `tools/call` with timeouts and bounded retry
//! - Liveness tracking and graceful shutdown

pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod memory;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::BackendError;
pub use lifecycle::{Connector, ProcessConnector};
pub use manager::{BackendHandle, BackendManager, BackendSettings, RetryPolicy};
pub use memory::{MemoryBackend, MemoryConnector};
pub use types::{BackendDescriptor, BackendSpec, BackendState, BackendStatus};
