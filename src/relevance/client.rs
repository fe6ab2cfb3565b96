//! Fail-closed relevance client.
//!
//! Wraps a [`RelevanceService`] with health caching, a circuit breaker, and
//! a per-query timeout. `select` never returns an error: anything short of a
//! clean, validated ranking becomes a pass-through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::CatalogSnapshot;
use crate::config::{RelevanceConfig, RelevanceKind};

use super::embedding::EmbeddingRelevanceService;
use super::errors::RelevanceError;
use super::health::{HealthStatus, RelevanceHealth};
use super::service::{HttpRelevanceService, RelevanceService};
use super::types::{PassThroughReason, RelevanceQuery, RelevanceResult, SelectOutcome};

pub struct RelevanceClient {
    service: Arc<dyn RelevanceService>,
    health: Arc<RelevanceHealth>,
    timeout: Duration,
    /// Catalog version last pushed to the service.
    synced_version: AtomicU64,
}

impl RelevanceClient {
    pub fn new(
        service: Arc<dyn RelevanceService>,
        health: Arc<RelevanceHealth>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            health,
            timeout,
            synced_version: AtomicU64::new(0),
        }
    }

    /// Build the configured service with its own health state.
    pub fn from_config(config: &RelevanceConfig) -> Result<Self, RelevanceError> {
        let service: Arc<dyn RelevanceService> = match config.kind {
            RelevanceKind::Http => {
                Arc::new(HttpRelevanceService::new(&config.base_url, config.timeout())?)
            }
            RelevanceKind::Embedding => Arc::new(EmbeddingRelevanceService::new(
                &config.base_url,
                config.embedding_model.clone(),
                config.timeout(),
            )?),
        };
        let health = Arc::new(RelevanceHealth::new(
            config.failure_threshold,
            config.cooldown(),
            config.health_ttl(),
        ));
        Ok(Self::new(service, health, config.timeout()))
    }

    pub fn health(&self) -> &Arc<RelevanceHealth> {
        &self.health
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn service_name(&self) -> &'static str {
        self.service.name()
    }

    /// Rank `query.candidates`, or explain why the caller should pass the
    /// catalog through unfiltered.
    pub async fn select(&self, query: &RelevanceQuery) -> SelectOutcome {
        if query.candidates.is_empty() {
            return SelectOutcome::PassThrough(PassThroughReason::EmptyCatalog);
        }

        let permit = match self.health.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("relevance circuit open, passing through");
                return SelectOutcome::PassThrough(PassThroughReason::CircuitOpen);
            }
        };

        // A half-open probe goes straight to the query.
        if !permit.is_probe() {
            let healthy = match self.health.cached_health() {
                Some(healthy) => healthy,
                None => self.check_health().await,
            };
            if !healthy {
                return SelectOutcome::PassThrough(PassThroughReason::Unhealthy);
            }
        }

        let result = match tokio::time::timeout(self.timeout, self.service.select(query)).await {
            Ok(Ok(ranking)) => RelevanceResult::normalize(query, ranking.names, ranking.scores),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelevanceError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        match result {
            Ok(result) => {
                permit.succeeded();
                tracing::debug!(
                    service = self.service.name(),
                    candidates = result.total_candidates,
                    selected = result.total_selected,
                    "relevance selection complete"
                );
                SelectOutcome::Selected(result)
            }
            Err(e) => {
                permit.failed();
                tracing::warn!(
                    service = self.service.name(),
                    error = %e,
                    "relevance selection failed, passing through"
                );
                SelectOutcome::PassThrough(PassThroughReason::from(&e))
            }
        }
    }

    /// Run a health probe now, bypassing the cache. Returns whether the
    /// service is up. Respects the circuit: while open, nothing is sent, and
    /// a half-open probe closes or re-opens it.
    pub async fn probe(&self) -> bool {
        let Ok(permit) = self.health.try_acquire() else {
            return false;
        };
        let healthy = self.check_health().await;
        if permit.is_probe() {
            if healthy {
                permit.succeeded();
            } else {
                permit.failed();
            }
        }
        healthy
    }

    /// Probe health and cache the result. Only query outcomes move the
    /// circuit.
    async fn check_health(&self) -> bool {
        let healthy = match tokio::time::timeout(self.timeout, self.service.health()).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                tracing::warn!(service = self.service.name(), error = %e, "relevance health check failed");
                false
            }
            Err(_) => {
                tracing::warn!(service = self.service.name(), "relevance health check timed out");
                false
            }
        };

        self.health.record_probe(healthy);
        healthy
    }

    /// Push a new catalog to the service if it hasn't seen this version.
    /// Failures are logged and retried on the next snapshot.
    pub async fn sync_catalog(&self, snapshot: &CatalogSnapshot) {
        if self.synced_version.load(Ordering::Acquire) == snapshot.version {
            return;
        }
        let sync = self.service.sync_catalog(snapshot.capabilities());
        match tokio::time::timeout(self.timeout, sync).await {
            Ok(Ok(())) => {
                self.synced_version.store(snapshot.version, Ordering::Release);
            }
            Ok(Err(e)) => {
                tracing::warn!(version = snapshot.version, error = %e, "catalog sync failed");
            }
            Err(_) => {
                tracing::warn!(version = snapshot.version, "catalog sync timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relevance::health::CircuitState;
    use crate::relevance::service::Ranking;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted service: returns whatever `reply` says, counting calls.
    struct Scripted {
        reply: fn(&RelevanceQuery) -> Result<Ranking, RelevanceError>,
        healthy: bool,
        delay: Duration,
        selects: AtomicUsize,
        health_checks: AtomicUsize,
    }

    impl Scripted {
        fn new(reply: fn(&RelevanceQuery) -> Result<Ranking, RelevanceError>) -> Self {
            Self {
                reply,
                healthy: true,
                delay: Duration::ZERO,
                selects: AtomicUsize::new(0),
                health_checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RelevanceService for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn select(&self, query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
            self.selects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.reply)(query)
        }

        async fn health(&self) -> Result<bool, RelevanceError> {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.healthy)
        }
    }

    fn first_two(query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        Ok(Ranking {
            names: query.candidates.iter().take(2).cloned().collect(),
            scores: vec![0.9, 0.8],
        })
    }

    fn failing(_: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        Err(RelevanceError::Http {
            status: 500,
            body: "boom".into(),
        })
    }

    fn query() -> RelevanceQuery {
        RelevanceQuery {
            task: "read a file".into(),
            candidates: vec!["fs::read_file".into(), "fs::list_dir".into(), "math::add".into()],
            max_results: 3,
            score_threshold: 0.1,
        }
    }

    fn client(service: Arc<Scripted>) -> RelevanceClient {
        RelevanceClient::new(
            service,
            Arc::new(RelevanceHealth::new(3, Duration::from_secs(30), Duration::from_secs(30))),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn selects_when_healthy() {
        let service = Arc::new(Scripted::new(first_two));
        let client = client(service.clone());

        let SelectOutcome::Selected(result) = client.select(&query()).await else {
            panic!("expected selection");
        };
        assert_eq!(result.names(), vec!["fs::read_file", "fs::list_dir"]);
    }

    #[tokio::test]
    async fn health_is_cached_between_calls() {
        let service = Arc::new(Scripted::new(first_two));
        let client = client(service.clone());

        client.select(&query()).await;
        client.select(&query()).await;
        client.select(&query()).await;

        assert_eq!(service.health_checks.load(Ordering::SeqCst), 1);
        assert_eq!(service.selects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unhealthy_service_passes_through_without_selecting() {
        let service = Arc::new(Scripted {
            healthy: false,
            ..Scripted::new(first_two)
        });
        let client = client(service.clone());

        assert_eq!(
            client.select(&query()).await,
            SelectOutcome::PassThrough(PassThroughReason::Unhealthy)
        );
        assert_eq!(service.selects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn errors_pass_through_then_open_the_circuit() {
        let service = Arc::new(Scripted::new(failing));
        let client = client(service.clone());

        for _ in 0..3 {
            assert_eq!(
                client.select(&query()).await,
                SelectOutcome::PassThrough(PassThroughReason::ServiceError)
            );
        }
        assert_eq!(
            client.select(&query()).await,
            SelectOutcome::PassThrough(PassThroughReason::CircuitOpen)
        );
        assert_eq!(service.selects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_endpoint_does_not_mask_failing_queries() {
        let service = Arc::new(Scripted::new(failing));
        let client = RelevanceClient::new(
            service.clone(),
            Arc::new(RelevanceHealth::new(3, Duration::from_secs(30), Duration::from_millis(10))),
            Duration::from_millis(100),
        );

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(client.select(&query()).await);
            // Every call finds the cached health result expired.
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        for outcome in &outcomes[..3] {
            assert_eq!(
                *outcome,
                SelectOutcome::PassThrough(PassThroughReason::ServiceError)
            );
        }
        assert_eq!(
            outcomes[3],
            SelectOutcome::PassThrough(PassThroughReason::CircuitOpen)
        );
        assert_eq!(client.health_status().circuit, CircuitState::Open);
        assert_eq!(service.selects.load(Ordering::SeqCst), 3);
        assert!(service.health_checks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn unhealthy_checks_do_not_open_the_circuit() {
        let service = Arc::new(Scripted {
            healthy: false,
            ..Scripted::new(first_two)
        });
        let client = client(service);

        for _ in 0..5 {
            client.select(&query()).await;
        }
        assert_eq!(client.health_status().circuit, CircuitState::Closed);
        assert_eq!(client.health_status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn slow_service_times_out() {
        let service = Arc::new(Scripted {
            delay: Duration::from_millis(500),
            ..Scripted::new(first_two)
        });
        let client = client(service);

        assert_eq!(
            client.select(&query()).await,
            SelectOutcome::PassThrough(PassThroughReason::Timeout)
        );
    }

    #[tokio::test]
    async fn malformed_ranking_passes_through() {
        fn mismatched(_: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
            Ok(Ranking {
                names: vec!["fs::read_file".into()],
                scores: vec![],
            })
        }
        let client = client(Arc::new(Scripted::new(mismatched)));
        assert_eq!(
            client.select(&query()).await,
            SelectOutcome::PassThrough(PassThroughReason::Malformed)
        );
    }

    #[tokio::test]
    async fn empty_candidates_pass_through() {
        let service = Arc::new(Scripted::new(first_two));
        let client = client(service.clone());
        let q = RelevanceQuery {
            candidates: Vec::new(),
            ..query()
        };
        assert_eq!(
            client.select(&q).await,
            SelectOutcome::PassThrough(PassThroughReason::EmptyCatalog)
        );
        assert_eq!(service.health_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_recovers() {
        let service = Arc::new(Scripted::new(first_two));
        let client = client(service.clone());
        client.health().trip();

        assert_eq!(
            client.select(&query()).await,
            SelectOutcome::PassThrough(PassThroughReason::CircuitOpen)
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(client.select(&query()).await, SelectOutcome::Selected(_)));
        assert_eq!(
            client.health_status().circuit,
            CircuitState::Closed
        );
    }

    #[test]
    fn from_config_picks_service_kind() {
        let http = RelevanceClient::from_config(&RelevanceConfig::default()).unwrap();
        assert_eq!(http.service_name(), "http");

        let embedding = RelevanceClient::from_config(&RelevanceConfig {
            kind: RelevanceKind::Embedding,
            ..RelevanceConfig::default()
        })
        .unwrap();
        assert_eq!(embedding.service_name(), "embedding");
    }

    #[tokio::test]
    async fn probe_is_suppressed_while_open() {
        let service = Arc::new(Scripted::new(first_two));
        let client = client(service.clone());
        client.health().trip();

        assert!(!client.probe().await);
        assert_eq!(service.health_checks.load(Ordering::SeqCst), 0);
    }
}
