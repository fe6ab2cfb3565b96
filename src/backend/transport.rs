//! Multiplexed JSON-RPC transport over a byte stream.
//!
//! Handles low-level communication with a backend:
//! - Writing line-delimited JSON-RPC requests
//! - A reader task that routes each response to its waiting caller by `id`
//! - Release of abandoned request slots when a caller stops waiting
//!
//! Concurrent requests share one connection without waiting on each other:
//! the writer lock is held only for a single line, and responses may arrive
//! in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::BackendError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Shared State ────────────────────────────────────────────────────────────

/// State shared between callers and the reader task.
struct Shared {
    backend_id: String,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    closed: AtomicBool,
}

impl Shared {
    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a response to whoever is waiting for it.
    fn complete(&self, response: JsonRpcResponse) {
        let waiter = self.lock_pending().remove(&response.id);
        match waiter {
            Some(tx) => {
                // The caller may have given up in the meantime.
                let _ = tx.send(response);
            }
            None => tracing::debug!(
                backend = %self.backend_id,
                id = response.id,
                "response for unknown or abandoned request"
            ),
        }
    }

    /// Mark the stream closed and fail every waiting caller.
    ///
    /// The flag is flipped under the pending lock so a concurrent
    /// registration either sees the flag or gets drained here.
    fn close(&self) {
        let mut pending = self.lock_pending();
        self.closed.store(true, Ordering::SeqCst);
        let dropped = pending.len();
        pending.clear();
        if dropped > 0 {
            tracing::warn!(
                backend = %self.backend_id,
                dropped,
                "backend stream closed with requests in flight"
            );
        }
    }
}

// ─── Pending Slot ────────────────────────────────────────────────────────────

/// A registered in-flight request. Dropping it removes the registration, so
/// callers that time out or are cancelled never leak a slot.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: u64,
}

impl<'a> PendingSlot<'a> {
    fn register(
        shared: &'a Shared,
        id: u64,
        tx: oneshot::Sender<JsonRpcResponse>,
    ) -> Result<Self, BackendError> {
        let mut pending = shared.lock_pending();
        if shared.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable {
                backend: shared.backend_id.clone(),
            });
        }
        pending.insert(id, tx);
        Ok(Self { shared, id })
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over any async byte stream (child
/// process stdio, in-memory duplex, socket).
pub struct JsonRpcTransport {
    shared: Arc<Shared>,
    writer: Mutex<BoxedWriter>,
    reader_task: JoinHandle<()>,
}

impl JsonRpcTransport {
    /// Create a transport and start its reader task.
    pub fn new<W, R>(backend_id: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            backend_id: backend_id.to_string(),
            next_id: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let reader_task = tokio::spawn(read_loop(Arc::clone(&shared), BufReader::new(reader)));

        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            reader_task,
        }
    }

    /// The backend this transport talks to.
    pub fn backend_id(&self) -> &str {
        &self.shared.backend_id
    }

    /// Whether the inbound stream has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Callers bound the wait with `tokio::time::timeout`; dropping the
    /// future releases the request slot.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _slot = PendingSlot::register(&self.shared, id, tx)?;

        let req = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&req).map_err(|e| BackendError::Transport {
            backend: self.shared.backend_id.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        self.write_line(&line).await?;

        rx.await.map_err(|_| BackendError::Unavailable {
            backend: self.shared.backend_id.clone(),
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let mut line =
            serde_json::to_string(&notification).map_err(|e| BackendError::Transport {
                backend: self.shared.backend_id.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;
        line.push('\n');

        self.write_line(&line).await
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.lock_pending().len()
    }

    async fn write_line(&self, line: &str) -> Result<(), BackendError> {
        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            let peer_gone = matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            );
            if peer_gone || self.is_closed() {
                BackendError::Unavailable {
                    backend: self.shared.backend_id.clone(),
                }
            } else {
                BackendError::Transport {
                    backend: self.shared.backend_id.clone(),
                    reason: format!("failed to write request: {e}"),
                }
            }
        })
    }
}

impl Drop for JsonRpcTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.shared.close();
    }
}

/// Read response lines until the stream ends.
///
/// Lines that aren't JSON-RPC responses (server log output, notifications)
/// are skipped.
async fn read_loop<R>(shared: Arc<Shared>, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    backend = %shared.backend_id,
                    error = %e,
                    "failed to read from backend"
                );
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) => shared.complete(resp),
            Err(_) => tracing::trace!(
                backend = %shared.backend_id,
                "skipping non-response line"
            ),
        }
    }

    tracing::debug!(backend = %shared.backend_id, "backend stream ended");
    shared.close();
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response.
///
/// A JSON-RPC error object is the backend's own verdict on the call and is
/// surfaced as [`BackendError::Invocation`].
pub fn extract_result(
    backend_id: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, BackendError> {
    if let Some(err) = response.error {
        return Err(BackendError::Invocation {
            backend: backend_id.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| BackendError::Protocol {
        backend: backend_id.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
