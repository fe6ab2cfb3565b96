//! Catalog aggregation across backends.
//!
//! Lists every live backend in parallel, merges the results into one
//! [`CatalogSnapshot`], and publishes it atomically. Readers always get the
//! last published snapshot without waiting on the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::backend::{BackendHandle, BackendManager};

use super::capability::Capability;
use super::snapshot::CatalogSnapshot;

/// Builds and publishes catalog snapshots.
pub struct CatalogAggregator {
    current: StdRwLock<Arc<CatalogSnapshot>>,
    /// Latest listing per backend id. A backend whose listing failed on the
    /// last full refresh maps to an empty list.
    per_backend: StdMutex<HashMap<String, Vec<Capability>>>,
    version: AtomicU64,
    ttl: Duration,
    last_refresh: StdMutex<Option<Instant>>,
    /// Held by the one stale-triggered rebuild allowed to run at a time.
    refresh_gate: Arc<Mutex<()>>,
}

impl CatalogAggregator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            current: StdRwLock::new(Arc::new(CatalogSnapshot::empty())),
            per_backend: StdMutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            ttl,
            last_refresh: StdMutex::new(None),
            refresh_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The last published snapshot. Never waits on a refresh.
    pub fn get_current(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Whether the TTL has expired (or no refresh has happened yet).
    pub fn is_stale(&self) -> bool {
        match *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    // ─── Refresh ─────────────────────────────────────────────────────────

    /// Re-list every routable backend in parallel and publish a new snapshot.
    ///
    /// A backend whose listing fails contributes no capabilities; the others
    /// are unaffected.
    pub async fn refresh(&self, manager: &BackendManager) -> Arc<CatalogSnapshot> {
        let handles: Vec<BackendHandle> = manager
            .handles()
            .await
            .into_iter()
            .filter(|h| h.state().is_routable())
            .collect();

        let listings = futures::future::join_all(
            handles.iter().map(|handle| list_backend(manager, handle)),
        )
        .await;

        let fresh: HashMap<String, Vec<Capability>> = handles
            .iter()
            .map(|h| h.id().to_string())
            .zip(listings)
            .collect();

        let snapshot = self.publish(|per_backend| *per_backend = fresh);
        self.touch();

        tracing::info!(
            version = snapshot.version,
            backends = handles.len(),
            capabilities = snapshot.len(),
            "catalog refreshed"
        );
        snapshot
    }

    /// Re-list a single backend (e.g. after reconnect) and publish.
    pub async fn refresh_backend(
        &self,
        manager: &BackendManager,
        backend_id: &str,
    ) -> Arc<CatalogSnapshot> {
        let listing = match manager.handle(backend_id).await {
            Some(handle) if handle.state().is_routable() => list_backend(manager, &handle).await,
            _ => Vec::new(),
        };

        self.publish(|per_backend| {
            if listing.is_empty() {
                per_backend.remove(backend_id);
            } else {
                per_backend.insert(backend_id.to_string(), listing);
            }
        })
    }

    /// Return the current snapshot, starting a background rebuild if the TTL
    /// has expired.
    ///
    /// Callers never wait on backend listings once a snapshot has been
    /// published; at most one background rebuild runs at a time. Only the
    /// very first build, when there is nothing to serve yet, is awaited.
    pub async fn refresh_if_stale(
        self: &Arc<Self>,
        manager: &Arc<BackendManager>,
    ) -> Arc<CatalogSnapshot> {
        if !self.is_stale() {
            return self.get_current();
        }

        if self.never_refreshed() {
            let _gate = self.refresh_gate.lock().await;
            if self.never_refreshed() {
                return self.refresh(manager).await;
            }
            return self.get_current();
        }

        if let Ok(gate) = Arc::clone(&self.refresh_gate).try_lock_owned() {
            let aggregator = Arc::clone(self);
            let manager = Arc::clone(manager);
            tokio::spawn(async move {
                let _gate = gate;
                if aggregator.is_stale() {
                    aggregator.refresh(&manager).await;
                }
            });
        }
        self.get_current()
    }

    /// Drop one backend's capabilities and publish.
    pub fn invalidate_backend(&self, backend_id: &str) -> Arc<CatalogSnapshot> {
        let snapshot = self.publish(|per_backend| {
            per_backend.remove(backend_id);
        });
        tracing::info!(
            backend = %backend_id,
            version = snapshot.version,
            capabilities = snapshot.len(),
            "backend capabilities invalidated"
        );
        snapshot
    }

    /// Apply `update` to the per-backend map, then build and swap in a new
    /// snapshot. Holding the map lock across the swap keeps versions in
    /// publish order.
    fn publish<F>(&self, update: F) -> Arc<CatalogSnapshot>
    where
        F: FnOnce(&mut HashMap<String, Vec<Capability>>),
    {
        let mut per_backend = self
            .per_backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        update(&mut per_backend);

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(CatalogSnapshot::build(
            version,
            per_backend.values().flatten().cloned(),
        ));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        snapshot
    }

    fn never_refreshed(&self) -> bool {
        self.last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn touch(&self) {
        *self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

/// List one backend, serialized with other refreshes of the same backend.
async fn list_backend(manager: &BackendManager, handle: &BackendHandle) -> Vec<Capability> {
    let _guard = handle.refresh_lock().lock().await;
    match manager.list_capabilities(handle).await {
        Ok(capabilities) => {
            tracing::debug!(
                backend = %handle.id(),
                capabilities = capabilities.len(),
                "backend listed"
            );
            capabilities
        }
        Err(e) => {
            tracing::warn!(backend = %handle.id(), error = %e, "backend listing failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendDescriptor, BackendSettings, BackendSpec, MemoryBackend, MemoryConnector,
    };

    async fn manager(backends: Vec<(&str, MemoryBackend)>) -> BackendManager {
        let connector = Arc::new(MemoryConnector::new());
        let ids: Vec<String> = backends.iter().map(|(id, _)| id.to_string()).collect();
        for (id, backend) in backends {
            connector.register(id, backend);
        }
        let manager = BackendManager::new(connector, BackendSettings::default());
        for id in ids {
            manager
                .connect(BackendDescriptor::new(id, BackendSpec::default()))
                .await
                .unwrap();
        }
        manager
    }

    fn echo(args: serde_json::Value) -> Result<serde_json::Value, (i32, String)> {
        Ok(args)
    }

    #[tokio::test]
    async fn starts_empty_and_stale() {
        let aggregator = CatalogAggregator::new(Duration::from_secs(60));
        assert!(aggregator.get_current().is_empty());
        assert_eq!(aggregator.get_current().version, 0);
        assert!(aggregator.is_stale());
    }

    #[tokio::test]
    async fn refresh_merges_backends() {
        let manager = manager(vec![
            ("fs", MemoryBackend::new().tool("read_file", "Read", echo).tool("list_dir", "List", echo)),
            ("math", MemoryBackend::new().tool("add", "Add", echo)),
        ])
        .await;
        let aggregator = CatalogAggregator::new(Duration::from_secs(60));

        let snap = aggregator.refresh(&manager).await;

        assert_eq!(
            snap.qualified_names(),
            vec!["fs::list_dir", "fs::read_file", "math::add"]
        );
        assert_eq!(snap.version, 1);
        assert!(!aggregator.is_stale());
        assert_eq!(aggregator.get_current().version, 1);
    }

    #[tokio::test]
    async fn failing_backend_contributes_nothing() {
        let manager = manager(vec![
            ("good", MemoryBackend::new().tool("t", "T", echo)),
            ("bad", MemoryBackend::new().tool("u", "U", echo).failing_listing()),
        ])
        .await;
        let aggregator = CatalogAggregator::new(Duration::from_secs(60));

        let snap = aggregator.refresh(&manager).await;
        assert_eq!(snap.qualified_names(), vec!["good::t"]);
    }

    #[tokio::test]
    async fn invalidate_drops_one_backend() {
        let manager = manager(vec![
            ("a", MemoryBackend::new().tool("search", "A", echo)),
            ("b", MemoryBackend::new().tool("search", "B", echo)),
        ])
        .await;
        let aggregator = CatalogAggregator::new(Duration::from_secs(60));
        aggregator.refresh(&manager).await;

        let snap = aggregator.invalidate_backend("a");
        assert_eq!(snap.qualified_names(), vec!["b::search"]);
        assert_eq!(snap.version, 2);

        let snap = aggregator.refresh_backend(&manager, "a").await;
        assert_eq!(snap.qualified_names(), vec!["a::search", "b::search"]);
    }

    #[tokio::test]
    async fn refresh_is_idempotent_in_content() {
        let manager = manager(vec![("a", MemoryBackend::new().tool("x", "X", echo))]).await;
        let aggregator = CatalogAggregator::new(Duration::from_secs(60));

        let first = aggregator.refresh(&manager).await;
        let second = aggregator.refresh(&manager).await;
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(second.version > first.version);
    }

    async fn wait_for_version(aggregator: &CatalogAggregator, version: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while aggregator.get_current().version < version {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_if_stale_respects_ttl() {
        let manager = Arc::new(manager(vec![("a", MemoryBackend::new().tool("x", "X", echo))]).await);
        let aggregator = Arc::new(CatalogAggregator::new(Duration::from_secs(10)));

        // Nothing published yet: the first build is awaited.
        assert_eq!(aggregator.refresh_if_stale(&manager).await.version, 1);
        assert_eq!(aggregator.refresh_if_stale(&manager).await.version, 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(aggregator.is_stale());
        // Stale: the last-good snapshot comes back while the rebuild runs.
        assert_eq!(aggregator.refresh_if_stale(&manager).await.version, 1);
        wait_for_version(&aggregator, 2).await;
        assert!(!aggregator.is_stale());
    }

    #[tokio::test]
    async fn stale_reads_do_not_wait_for_slow_listings() {
        let manager = Arc::new(
            manager(vec![
                ("fs", MemoryBackend::new().tool("read_file", "Read", echo)),
                (
                    "slow",
                    MemoryBackend::new()
                        .tool("scan", "Scan", echo)
                        .list_latency(Duration::from_millis(800)),
                ),
            ])
            .await,
        );
        let aggregator = Arc::new(CatalogAggregator::new(Duration::from_millis(50)));
        aggregator.refresh(&manager).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let started = std::time::Instant::now();
        let first = aggregator.refresh_if_stale(&manager).await;
        let second = aggregator.refresh_if_stale(&manager).await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 1);
        assert_eq!(first.qualified_names(), vec!["fs::read_file", "slow::scan"]);

        // Exactly one rebuild was started.
        wait_for_version(&aggregator, 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(aggregator.get_current().version, 2);
    }

    #[tokio::test]
    async fn disconnected_backend_is_skipped() {
        let manager = manager(vec![
            ("a", MemoryBackend::new().tool("x", "X", echo)),
            ("b", MemoryBackend::new().tool("y", "Y", echo)),
        ])
        .await;
        let handle = manager.handle("a").await.unwrap();
        manager.disconnect(&handle).await;

        let aggregator = CatalogAggregator::new(Duration::from_secs(60));
        let snap = aggregator.refresh(&manager).await;
        assert_eq!(snap.qualified_names(), vec!["b::y"]);
    }
}
