//! toolgate: one capability catalog over many JSON-RPC backends.
//!
//! Aggregates the tools of independent backend servers into a single
//! catalog with globally unique `backend::tool` names, narrows list results
//! to what is relevant for the current task via a pluggable relevance
//! service, and routes invocations back to the owning backend.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! toolgate::logging::init_tracing(&toolgate::logging::LoggingOptions::default())?;
//! let config = toolgate::config::load_config("toolgate.yaml".as_ref())?;
//! let router = Arc::new(toolgate::Router::start(&config).await?);
//! toolgate::router::serve_stdio(router).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod relevance;
pub mod router;

pub use backend::{BackendError, BackendManager, BackendState, MemoryBackend, MemoryConnector};
pub use catalog::{Capability, CatalogSnapshot, QUALIFIED_NAME_SEPARATOR};
pub use config::{load_config, ConfigError, GatewayConfig};
pub use relevance::{PassThroughReason, RelevanceClient, RelevanceError, RelevanceService};
pub use router::{CapabilityListing, Router, RouterError, RouterStats};
