//! Request routing: list and invoke across all backends.
//!
//! The list path ranks the current catalog snapshot against a task
//! description and falls back to the unfiltered catalog whenever ranking
//! can't be trusted. The invoke path resolves a qualified name to its
//! backend and forwards the call unmodified.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{
    BackendDescriptor, BackendManager, BackendState, BackendStatus, Connector, ProcessConnector,
};
use crate::catalog::{split_qualified, Capability, CatalogAggregator, CatalogSnapshot};
use crate::config::{ConfigError, FilteringConfig, GatewayConfig};
use crate::relevance::{
    HealthStatus, PassThroughReason, RelevanceClient, RelevanceQuery, SelectOutcome,
};

use super::errors::RouterError;
use super::fallback::{FallbackPolicy, PolicyState};
use super::task::{DescriberChain, LastInvokedTracker, TaskContext};

// ─── Public Types ────────────────────────────────────────────────────────────

/// Result of one list call.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityListing {
    /// Ranked when `filtered`, catalog order otherwise.
    pub capabilities: Vec<Capability>,
    /// Relevance scores, parallel to `capabilities`. Empty when unfiltered.
    pub scores: Vec<f32>,
    pub filtered: bool,
    pub fallback_reason: Option<PassThroughReason>,
    pub total_available: usize,
    pub returned: usize,
    pub policy: PolicyState,
    pub snapshot_version: u64,
    /// Text the catalog was ranked against.
    pub task: String,
}

impl CapabilityListing {
    /// `_meta` object attached to consumer list responses.
    pub fn meta(&self) -> serde_json::Value {
        serde_json::json!({
            "rag_enabled": self.filtered,
            "total_available_tools": self.total_available,
            "retrieved_tools": self.returned,
            "fallback_used": !self.filtered,
            "fallback_reason": self.fallback_reason,
            "policy": self.policy,
            "snapshot_version": self.snapshot_version,
        })
    }
}

/// Observable router state, served by `router/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub policy: PolicyState,
    pub policy_transitions: u64,
    pub last_fallback_reason: Option<PassThroughReason>,
    pub filtering_enabled: bool,
    pub relevance_service: Option<&'static str>,
    pub relevance: Option<HealthStatus>,
    pub catalog_version: u64,
    pub catalog_size: usize,
    pub catalog_fingerprint: String,
    pub catalog_built_at: DateTime<Utc>,
    pub backends: Vec<BackendStatus>,
    pub list_calls: u64,
    pub filtered_lists: u64,
    pub passthrough_lists: u64,
    pub invocations: u64,
    pub invocation_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    list_calls: AtomicU64,
    filtered_lists: AtomicU64,
    passthrough_lists: AtomicU64,
    invocations: AtomicU64,
    invocation_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// The consumer-facing router.
pub struct Router {
    manager: Arc<BackendManager>,
    catalog: Arc<CatalogAggregator>,
    relevance: Option<RelevanceClient>,
    filtering: FilteringConfig,
    policy: FallbackPolicy,
    describers: DescriberChain,
    last_invoked: LastInvokedTracker,
    counters: Counters,
}

impl Router {
    /// Assemble a router from parts. With `relevance` set to `None`, every
    /// list is a pass-through.
    pub fn new(
        manager: Arc<BackendManager>,
        relevance: Option<RelevanceClient>,
        filtering: FilteringConfig,
        catalog_ttl: Duration,
    ) -> Self {
        Self {
            manager,
            catalog: Arc::new(CatalogAggregator::new(catalog_ttl)),
            relevance,
            filtering,
            policy: FallbackPolicy::new(),
            describers: DescriberChain::default(),
            last_invoked: LastInvokedTracker::default(),
            counters: Counters::default(),
        }
    }

    /// Replace the task describer chain.
    pub fn with_describers(mut self, describers: DescriberChain) -> Self {
        self.describers = describers;
        self
    }

    /// Start every configured backend as a child process, build the first
    /// catalog, and return a ready router.
    pub async fn start(config: &GatewayConfig) -> Result<Self, ConfigError> {
        Self::start_with_connector(config, Arc::new(ProcessConnector)).await
    }

    /// [`Router::start`] with a custom way of opening backends.
    ///
    /// Backends that fail to start are logged and skipped; they can be
    /// brought up later with [`Router::reconnect_backend`] only if they
    /// connected once.
    pub async fn start_with_connector(
        config: &GatewayConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let relevance = if config.filtering.enabled {
            let client =
                RelevanceClient::from_config(&config.relevance).map_err(|e| {
                    ConfigError::Invalid {
                        reason: format!("relevance service: {e}"),
                    }
                })?;
            Some(client)
        } else {
            None
        };

        let manager = Arc::new(BackendManager::new(
            connector,
            config.backend_timeouts.settings(),
        ));
        let descriptors: Vec<BackendDescriptor> = config
            .backends
            .iter()
            .map(|(id, spec)| BackendDescriptor::new(id.clone(), spec.clone()))
            .collect();
        let (connected, failed) = manager.connect_all(descriptors).await;

        let router = Self::new(
            manager,
            relevance,
            config.filtering.clone(),
            config.catalog.ttl(),
        );
        let snapshot = router.catalog.refresh(&router.manager).await;

        tracing::info!(
            backends = connected.len(),
            failed = failed.len(),
            capabilities = snapshot.len(),
            filtering = router.filtering.enabled,
            "router started"
        );
        Ok(router)
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn relevance(&self) -> Option<&RelevanceClient> {
        self.relevance.as_ref()
    }

    /// The current catalog snapshot, without refreshing.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.catalog.get_current()
    }

    // ─── List ────────────────────────────────────────────────────────────

    /// List capabilities, ranked against `query` (or a derived task
    /// description) when filtering is possible. Never fails.
    pub async fn list_capabilities(&self, query: Option<&str>) -> CapabilityListing {
        bump(&self.counters.list_calls);
        let snapshot = self.catalog.refresh_if_stale(&self.manager).await;

        let context = TaskContext {
            explicit_query: query.map(str::to_string),
            last_invoked: self.last_invoked.get(),
        };
        let task = self.describers.describe(&context);

        let Some(relevance) = self.relevance.as_ref().filter(|_| self.filtering.enabled) else {
            return self.pass_through(&snapshot, task, PassThroughReason::Disabled);
        };

        relevance.sync_catalog(&snapshot).await;
        let relevance_query = RelevanceQuery {
            task: task.clone(),
            candidates: snapshot.qualified_names(),
            max_results: self.filtering.max_results,
            score_threshold: self.filtering.score_threshold,
        };

        match relevance.select(&relevance_query).await {
            SelectOutcome::Selected(result) => {
                self.policy.on_selected();
                bump(&self.counters.filtered_lists);

                let (capabilities, scores): (Vec<Capability>, Vec<f32>) = result
                    .selected
                    .iter()
                    .filter_map(|s| snapshot.get(&s.qualified_name).map(|c| (c.clone(), s.score)))
                    .unzip();

                tracing::debug!(
                    task = %task,
                    total = snapshot.len(),
                    returned = capabilities.len(),
                    "filtered capability list"
                );
                CapabilityListing {
                    returned: capabilities.len(),
                    capabilities,
                    scores,
                    filtered: true,
                    fallback_reason: None,
                    total_available: snapshot.len(),
                    policy: self.policy.state(),
                    snapshot_version: snapshot.version,
                    task,
                }
            }
            SelectOutcome::PassThrough(reason) => self.pass_through(&snapshot, task, reason),
        }
    }

    fn pass_through(
        &self,
        snapshot: &CatalogSnapshot,
        task: String,
        reason: PassThroughReason,
    ) -> CapabilityListing {
        if reason != PassThroughReason::Disabled {
            self.policy.on_pass_through(reason);
        }
        bump(&self.counters.passthrough_lists);

        let capabilities: Vec<Capability> = snapshot
            .capabilities()
            .iter()
            .take(self.filtering.passthrough_cap)
            .cloned()
            .collect();

        tracing::debug!(
            reason = %reason,
            total = snapshot.len(),
            returned = capabilities.len(),
            "unfiltered capability list"
        );
        CapabilityListing {
            returned: capabilities.len(),
            capabilities,
            scores: Vec::new(),
            filtered: false,
            fallback_reason: Some(reason),
            total_available: snapshot.len(),
            policy: self.policy.state(),
            snapshot_version: snapshot.version,
            task,
        }
    }

    // ─── Invoke ──────────────────────────────────────────────────────────

    /// Invoke a capability by qualified name and return the backend's
    /// result unmodified.
    pub async fn invoke_capability(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RouterError> {
        bump(&self.counters.invocations);
        let result = self.route(qualified_name, arguments).await;
        if let Err(e) = &result {
            bump(&self.counters.invocation_errors);
            tracing::warn!(capability = %qualified_name, error = %e, "invocation failed");
        }
        result
    }

    async fn route(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, RouterError> {
        let (backend_id, local_name) =
            split_qualified(qualified_name).ok_or_else(|| RouterError::InvalidName {
                name: qualified_name.to_string(),
            })?;

        let handle = self.manager.handle(backend_id).await.ok_or_else(|| {
            RouterError::CapabilityNotFound {
                name: qualified_name.to_string(),
            }
        })?;

        if handle.state() == BackendState::Disconnected {
            self.catalog.invalidate_backend(backend_id);
            return Err(RouterError::BackendUnavailable {
                backend: backend_id.to_string(),
                reason: "backend is disconnected".into(),
            });
        }

        if !self.catalog.get_current().contains(qualified_name) {
            return Err(RouterError::CapabilityNotFound {
                name: qualified_name.to_string(),
            });
        }

        self.last_invoked.record(qualified_name);
        tracing::debug!(capability = %qualified_name, "routing invocation");

        match self.manager.invoke(&handle, local_name, arguments).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if handle.state() == BackendState::Disconnected {
                    self.catalog.invalidate_backend(backend_id);
                }
                Err(e.into())
            }
        }
    }

    // ─── Catalog & backend control ───────────────────────────────────────

    /// Rebuild the catalog from every live backend now.
    pub async fn refresh_catalog(&self) -> Arc<CatalogSnapshot> {
        self.catalog.refresh(&self.manager).await
    }

    /// Shut one backend down and drop its capabilities. Returns `false` if
    /// the backend is unknown.
    pub async fn disconnect_backend(&self, backend_id: &str) -> bool {
        let Some(handle) = self.manager.handle(backend_id).await else {
            return false;
        };
        self.manager.disconnect(&handle).await;
        self.catalog.invalidate_backend(backend_id);
        true
    }

    /// Restart a known backend and re-list its capabilities.
    pub async fn reconnect_backend(&self, backend_id: &str) -> Result<Arc<CatalogSnapshot>, RouterError> {
        self.manager.reconnect(backend_id).await?;
        Ok(self.catalog.refresh_backend(&self.manager, backend_id).await)
    }

    /// Disconnect every backend.
    pub async fn shutdown(&self) {
        self.manager.shutdown_all().await;
        tracing::info!("router shut down");
    }

    // ─── Stats ───────────────────────────────────────────────────────────

    pub async fn stats(&self) -> RouterStats {
        let snapshot = self.catalog.get_current();
        let counters = &self.counters;
        RouterStats {
            policy: self.policy.state(),
            policy_transitions: self.policy.transitions(),
            last_fallback_reason: self.policy.last_reason(),
            filtering_enabled: self.filtering.enabled,
            relevance_service: self.relevance.as_ref().map(RelevanceClient::service_name),
            relevance: self.relevance.as_ref().map(RelevanceClient::health_status),
            catalog_version: snapshot.version,
            catalog_size: snapshot.len(),
            catalog_fingerprint: snapshot.fingerprint.clone(),
            catalog_built_at: snapshot.built_at,
            backends: self.manager.statuses().await,
            list_calls: counters.list_calls.load(Ordering::Relaxed),
            filtered_lists: counters.filtered_lists.load(Ordering::Relaxed),
            passthrough_lists: counters.passthrough_lists.load(Ordering::Relaxed),
            invocations: counters.invocations.load(Ordering::Relaxed),
            invocation_errors: counters.invocation_errors.load(Ordering::Relaxed),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
