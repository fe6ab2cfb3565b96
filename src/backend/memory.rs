//! In-process backends.
//!
//! A [`MemoryBackend`] is a set of tools backed by Rust closures, served over
//! an in-memory duplex stream with the same JSON-RPC protocol a child process
//! would speak. Useful for embedding local capabilities next to external
//! servers, and for exercising the router without spawning processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};

use super::errors::BackendError;
use super::lifecycle::{Connector, OpenedTransport};
use super::transport::JsonRpcTransport;
use super::types::{
    error_codes, BackendDescriptor, JsonRpcResponse, ToolDefinition, PROTOCOL_VERSION,
};

/// Buffer size of the in-memory pipe between router and backend.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Handler for one in-process tool. Errors are `(code, message)` pairs sent
/// back as JSON-RPC error objects.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, (i32, String)> + Send + Sync>;

// ─── MemoryBackend ───────────────────────────────────────────────────────────

/// Definition of an in-process backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tools: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
    latency: Duration,
    list_latency: Duration,
    page_size: Option<usize>,
    failing_listing: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool with an open object schema.
    pub fn tool<F>(self, name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, (i32, String)>
            + Send
            + Sync
            + 'static,
    {
        self.tool_with_schema(
            name,
            description,
            serde_json::json!({ "type": "object" }),
            handler,
        )
    }

    /// Add a tool with an explicit input schema.
    pub fn tool_with_schema<F>(
        mut self,
        name: &str,
        description: &str,
        input_schema: serde_json::Value,
        handler: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value, (i32, String)>
            + Send
            + Sync
            + 'static,
    {
        self.tools.push(ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        });
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Delay every `tools/call` response.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay every `tools/list` response.
    pub fn list_latency(mut self, latency: Duration) -> Self {
        self.list_latency = latency;
        self
    }

    /// Split `tools/list` into pages of `size` entries.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// Make `tools/list` fail with an internal error.
    pub fn failing_listing(mut self) -> Self {
        self.failing_listing = true;
        self
    }

    async fn respond(
        &self,
        backend_id: &str,
        id: u64,
        method: &str,
        params: serde_json::Value,
    ) -> JsonRpcResponse {
        match method {
            "initialize" => JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": backend_id, "version": "memory" },
                }),
            ),
            "tools/list" => {
                if !self.list_latency.is_zero() {
                    tokio::time::sleep(self.list_latency).await;
                }
                self.list_page(id, &params)
            }
            "tools/call" => self.call(id, &params).await,
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        }
    }

    fn list_page(&self, id: u64, params: &serde_json::Value) -> JsonRpcResponse {
        if self.failing_listing {
            return JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, "listing failed");
        }

        let offset = params
            .get("cursor")
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = self.page_size.unwrap_or(self.tools.len().max(1));
        let page: Vec<&ToolDefinition> = self.tools.iter().skip(offset).take(size).collect();
        let next = offset + page.len();

        let mut result = serde_json::json!({ "tools": page });
        if next < self.tools.len() {
            result["nextCursor"] = serde_json::Value::String(next.to_string());
        }
        JsonRpcResponse::success(id, result)
    }

    async fn call(&self, id: u64, params: &serde_json::Value) -> JsonRpcResponse {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        match self.handlers.get(name) {
            Some(handler) => match handler(arguments) {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err((code, message)) => JsonRpcResponse::failure(id, code, message),
            },
            None => JsonRpcResponse::failure(
                id,
                error_codes::INVALID_PARAMS,
                format!("unknown tool: '{name}'"),
            ),
        }
    }
}

// ─── MemoryConnector ─────────────────────────────────────────────────────────

/// Connector that serves registered [`MemoryBackend`]s in-process.
#[derive(Default)]
pub struct MemoryConnector {
    backends: StdMutex<HashMap<String, MemoryBackend>>,
    running: StdMutex<HashMap<String, AbortHandle>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the backend served under `id`.
    pub fn register(&self, id: &str, backend: MemoryBackend) {
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), backend);
    }

    /// Abruptly stop the running instance of `id`, as if its process died.
    pub fn crash(&self, id: &str) {
        let handle = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, descriptor: &BackendDescriptor) -> Result<OpenedTransport, BackendError> {
        let backend = self
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&descriptor.id)
            .cloned()
            .ok_or_else(|| BackendError::Connection {
                backend: descriptor.id.clone(),
                reason: "no in-process backend registered under this id".into(),
            })?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        let task = tokio::spawn(serve(
            descriptor.id.clone(),
            Arc::new(backend),
            BufReader::new(server_read),
            server_write,
        ));

        if let Some(previous) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.id.clone(), task.abort_handle())
        {
            previous.abort();
        }

        Ok(OpenedTransport {
            transport: JsonRpcTransport::new(&descriptor.id, client_write, client_read),
            process: None,
        })
    }
}

/// Serve JSON-RPC requests until the router hangs up or sends `shutdown`.
///
/// Each request runs in its own task so slow calls don't hold up others.
async fn serve<R, W>(
    backend_id: String,
    backend: Arc<MemoryBackend>,
    mut reader: BufReader<R>,
    writer: W,
) where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let mut in_flight = JoinSet::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let Ok(message) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        let Some(id) = message.get("id").and_then(|id| id.as_u64()) else {
            if method == "shutdown" {
                break;
            }
            continue;
        };

        let params = message
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let backend = Arc::clone(&backend);
        let writer = Arc::clone(&writer);
        let backend_id = backend_id.clone();

        in_flight.spawn(async move {
            let response = backend.respond(&backend_id, id, &method, params).await;
            if let Ok(mut out) = serde_json::to_string(&response) {
                out.push('\n');
                let mut writer = writer.lock().await;
                let _ = writer.write_all(out.as_bytes()).await;
                let _ = writer.flush().await;
            }
        });

        // Reap finished calls so the set doesn't grow without bound.
        while in_flight.try_join_next().is_some() {}
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
