//! Gateway configuration loading and validation.
//!
//! A single `GatewayConfig` describes the backends to aggregate, how list
//! results are filtered, which relevance service ranks them, and the
//! timeouts around every call. Read from YAML or JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{BackendSettings, BackendSpec, RetryPolicy};
use crate::catalog::QUALIFIED_NAME_SEPARATOR;
use crate::relevance::types::MAX_THRESHOLD;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Backend id → how to start it. Ids become the prefix of every
    /// qualified capability name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendSpec>,
    #[serde(default)]
    pub filtering: FilteringConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub backend_timeouts: BackendTimeouts,
}

/// How list results are narrowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteringConfig {
    /// When `false`, every list call returns the (capped) full catalog.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Most capabilities returned by a filtered list (default: 10).
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Minimum relevance score, in `[0, 2]` (default: 0).
    #[serde(default)]
    pub score_threshold: f32,
    /// Hard cap on an unfiltered list (default: 100).
    #[serde(default = "default_passthrough_cap")]
    pub passthrough_cap: usize,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_max_results(),
            score_threshold: 0.0,
            passthrough_cap: default_passthrough_cap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceKind {
    /// Remote selection service (`/select-tools`, `/health`).
    #[default]
    Http,
    /// Local cosine ranking over an `/embeddings` endpoint.
    Embedding,
}

/// Relevance service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default)]
    pub kind: RelevanceKind,
    #[serde(default = "default_relevance_url")]
    pub base_url: String,
    /// Per-query timeout (default: 5000ms).
    #[serde(default = "default_relevance_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a health probe result is trusted (default: 30s).
    #[serde(default = "default_thirty")]
    pub health_ttl_secs: u64,
    /// Consecutive failures that open the circuit (default: 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open (default: 30s).
    #[serde(default = "default_thirty")]
    pub cooldown_secs: u64,
    /// Model name sent to the embeddings endpoint, if any.
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            kind: RelevanceKind::default(),
            base_url: default_relevance_url(),
            timeout_ms: default_relevance_timeout_ms(),
            health_ttl_secs: default_thirty(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_thirty(),
            embedding_model: None,
        }
    }
}

impl RelevanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Snapshot lifetime before a list call triggers a rebuild (default: 300s).
    #[serde(default = "default_catalog_ttl")]
    pub ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_catalog_ttl(),
        }
    }
}

impl CatalogConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTimeouts {
    /// `initialize` handshake limit (default: 30000ms).
    #[serde(default = "default_backend_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Per-attempt limit on `tools/list` and `tools/call` (default: 30000ms).
    #[serde(default = "default_backend_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            init_timeout_ms: default_backend_timeout_ms(),
            call_timeout_ms: default_backend_timeout_ms(),
        }
    }
}

impl BackendTimeouts {
    pub fn settings(&self) -> BackendSettings {
        BackendSettings {
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_results() -> usize {
    10
}
fn default_passthrough_cap() -> usize {
    100
}
fn default_relevance_url() -> String {
    "http://localhost:8001".to_string()
}
fn default_relevance_timeout_ms() -> u64 {
    5_000
}
fn default_thirty() -> u64 {
    30
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_catalog_ttl() -> u64 {
    300
}
fn default_backend_timeout_ms() -> u64 {
    30_000
}

// ─── Validation ──────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Reject configs the router can't honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for id in self.backends.keys() {
            if id.is_empty() {
                return Err(invalid("backend id must not be empty"));
            }
            if id.contains(QUALIFIED_NAME_SEPARATOR) {
                return Err(invalid(format!(
                    "backend id '{id}' must not contain '{QUALIFIED_NAME_SEPARATOR}'"
                )));
            }
        }

        for (id, spec) in &self.backends {
            if spec.command.trim().is_empty() {
                return Err(invalid(format!("backend '{id}' has no command")));
            }
        }

        let filtering = &self.filtering;
        if filtering.max_results == 0 {
            return Err(invalid("filtering.max_results must be at least 1"));
        }
        if filtering.passthrough_cap == 0 {
            return Err(invalid("filtering.passthrough_cap must be at least 1"));
        }
        if !(0.0..=MAX_THRESHOLD).contains(&filtering.score_threshold) {
            return Err(invalid(format!(
                "filtering.score_threshold must be within [0, {MAX_THRESHOLD}], got {}",
                filtering.score_threshold
            )));
        }

        let relevance = &self.relevance;
        if relevance.timeout_ms == 0 {
            return Err(invalid("relevance.timeout_ms must be positive"));
        }
        if relevance.failure_threshold == 0 {
            return Err(invalid("relevance.failure_threshold must be at least 1"));
        }
        if filtering.enabled && relevance.base_url.trim().is_empty() {
            return Err(invalid("relevance.base_url is required when filtering is enabled"));
        }

        if self.backend_timeouts.init_timeout_ms == 0 || self.backend_timeouts.call_timeout_ms == 0
        {
            return Err(invalid("backend timeouts must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, parse and validate a config file.
///
/// `.json` files are parsed as JSON; anything else as YAML.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let shown = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: shown.clone(),
        reason: e.to_string(),
    })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let config: GatewayConfig = if is_json {
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: shown.clone(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: shown.clone(),
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    tracing::info!(
        path = %shown,
        backends = config.backends.len(),
        filtering = config.filtering.enabled,
        "config loaded"
    );
    Ok(config)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
