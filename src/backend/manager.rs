//! Backend connection manager.
//!
//! Owns one session per backend, tracks liveness, and forwards listing and
//! invocation calls with timeouts and bounded retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::catalog::Capability;

use super::errors::BackendError;
use super::lifecycle::{BackendSession, Connector};
use super::types::{BackendDescriptor, BackendState, BackendStatus};

// ─── Retry Policy ────────────────────────────────────────────────────────────

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub factor: u32,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    /// 3 retries: 100ms, 400ms, 1600ms.
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            factor: 4,
        }
    }
}

/// Timeouts and retry settings for backend calls.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings {
    pub init_timeout: Duration,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

// ─── BackendHandle ───────────────────────────────────────────────────────────

struct BackendEntry {
    descriptor: BackendDescriptor,
    state: AtomicU8,
    session: BackendSession,
    refresh_lock: Mutex<()>,
}

/// Cheap, cloneable reference to one connected backend.
///
/// A handle outlives reconnects: after a backend is reconnected, old handles
/// report `Disconnected` and the manager hands out new ones.
#[derive(Clone)]
pub struct BackendHandle(Arc<BackendEntry>);

impl BackendHandle {
    pub fn id(&self) -> &str {
        &self.0.descriptor.id
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.0.descriptor
    }

    /// Current liveness. A closed stream always reads as disconnected.
    pub fn state(&self) -> BackendState {
        if self.0.session.is_closed() {
            return BackendState::Disconnected;
        }
        BackendState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: BackendState) {
        let prev = BackendState::from_u8(self.0.state.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::info!(
                backend = %self.id(),
                from = ?prev,
                to = ?next,
                "backend state changed"
            );
        }
    }

    /// Serializes catalog refreshes of this backend.
    pub(crate) fn refresh_lock(&self) -> &Mutex<()> {
        &self.0.refresh_lock
    }

    fn status(&self) -> BackendStatus {
        let info = self.0.session.init_result().server_info.as_ref();
        BackendStatus {
            id: self.id().to_string(),
            state: self.state(),
            server_name: info.and_then(|i| i.name.clone()),
            server_version: info.and_then(|i| i.version.clone()),
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

// ─── BackendManager ──────────────────────────────────────────────────────────

/// Manages every backend connection.
pub struct BackendManager {
    connector: Arc<dyn Connector>,
    settings: BackendSettings,
    backends: RwLock<HashMap<String, BackendHandle>>,
}

impl BackendManager {
    pub fn new(connector: Arc<dyn Connector>, settings: BackendSettings) -> Self {
        Self {
            connector,
            settings,
            backends: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open and initialize a backend, replacing any previous session under
    /// the same id.
    pub async fn connect(
        &self,
        descriptor: BackendDescriptor,
    ) -> Result<BackendHandle, BackendError> {
        let opened = self.connector.open(&descriptor).await?;
        let session =
            BackendSession::establish(&descriptor.id, opened, self.settings.init_timeout).await?;

        let handle = BackendHandle(Arc::new(BackendEntry {
            descriptor,
            state: AtomicU8::new(BackendState::Starting as u8),
            session,
            refresh_lock: Mutex::new(()),
        }));
        handle.set_state(BackendState::Connected);

        let previous = self
            .backends
            .write()
            .await
            .insert(handle.id().to_string(), handle.clone());
        if let Some(previous) = previous {
            previous.set_state(BackendState::Disconnected);
            previous.0.session.shutdown().await;
        }

        Ok(handle)
    }

    /// Connect every descriptor concurrently.
    ///
    /// Partial startup is fine: failures are returned alongside the handles
    /// that did connect.
    pub async fn connect_all(
        &self,
        descriptors: Vec<BackendDescriptor>,
    ) -> (Vec<BackendHandle>, Vec<BackendError>) {
        let results =
            futures::future::join_all(descriptors.into_iter().map(|d| self.connect(d))).await;

        let mut handles = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!(backend = %e.backend(), error = %e, "backend failed to connect");
                    errors.push(e);
                }
            }
        }
        (handles, errors)
    }

    /// Re-open a known backend from its stored descriptor.
    pub async fn reconnect(&self, id: &str) -> Result<BackendHandle, BackendError> {
        let descriptor = self
            .handle(id)
            .await
            .map(|h| h.descriptor().clone())
            .ok_or_else(|| BackendError::Unavailable {
                backend: id.to_string(),
            })?;
        self.connect(descriptor).await
    }

    /// Shut a backend down. The descriptor is kept so the backend still
    /// reads as known-but-disconnected and can be reconnected.
    pub async fn disconnect(&self, handle: &BackendHandle) {
        handle.set_state(BackendState::Disconnected);
        handle.0.session.shutdown().await;
    }

    /// Disconnect and forget a backend entirely.
    pub async fn remove(&self, id: &str) {
        let removed = self.backends.write().await.remove(id);
        if let Some(handle) = removed {
            self.disconnect(&handle).await;
        }
    }

    /// Disconnect every backend.
    pub async fn shutdown_all(&self) {
        let handles: Vec<BackendHandle> = self.backends.write().await.drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles.iter().map(|h| self.disconnect(h))).await;
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    pub async fn handle(&self, id: &str) -> Option<BackendHandle> {
        self.backends.read().await.get(id).cloned()
    }

    /// All known backends, sorted by id.
    pub async fn handles(&self) -> Vec<BackendHandle> {
        let mut handles: Vec<BackendHandle> = self.backends.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub async fn statuses(&self) -> Vec<BackendStatus> {
        self.handles().await.iter().map(BackendHandle::status).collect()
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// List a backend's capabilities.
    pub async fn list_capabilities(
        &self,
        handle: &BackendHandle,
    ) -> Result<Vec<Capability>, BackendError> {
        let session = &handle.0.session;
        let tools = self
            .with_retry(handle, "tools/list", BackendError::is_transient, || {
                session.list_tools()
            })
            .await?;

        Ok(tools
            .into_iter()
            .map(|tool| Capability::from_tool(handle.id(), tool))
            .collect())
    }

    /// Invoke a capability by its backend-local name and return the
    /// backend's result unmodified.
    ///
    /// Only calls that never reached the backend are retried: a timed-out
    /// call may still be running there.
    pub async fn invoke(
        &self,
        handle: &BackendHandle,
        local_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let session = &handle.0.session;
        self.with_retry(handle, "tools/call", BackendError::is_undelivered, || {
            session.call_tool(local_name, arguments.clone())
        })
        .await
    }

    /// Run one backend call with a timeout, retrying the failures
    /// `retryable` accepts.
    ///
    /// A transient failure that is not retried (or has run out of retries)
    /// marks the backend degraded. A closed stream marks it disconnected, and
    /// any success marks it connected again.
    async fn with_retry<T, F, Fut>(
        &self,
        handle: &BackendHandle,
        method: &str,
        retryable: fn(&BackendError) -> bool,
        mut call: F,
    ) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let retry = self.settings.retry;
        let timeout = self.settings.call_timeout;
        let mut attempt: u32 = 0;

        loop {
            if !handle.state().is_routable() {
                return Err(BackendError::Unavailable {
                    backend: handle.id().to_string(),
                });
            }

            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout {
                    backend: handle.id().to_string(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(value) => {
                    handle.set_state(BackendState::Connected);
                    return Ok(value);
                }
                Err(e @ BackendError::Unavailable { .. }) => {
                    handle.set_state(BackendState::Disconnected);
                    return Err(e);
                }
                Err(e) if retryable(&e) && attempt < retry.max_retries => {
                    let delay = retry.delay(attempt);
                    tracing::warn!(
                        backend = %handle.id(),
                        method,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    handle.set_state(BackendState::Degraded);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
