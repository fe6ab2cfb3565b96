//! Backend session lifecycle.
//!
//! Opens a byte stream to a backend (by default a child process speaking
//! JSON-RPC over stdio), performs the initialization handshake, lists tools,
//! forwards tool calls, and shuts the session down.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::errors::BackendError;
use super::transport::{extract_result, JsonRpcTransport};
use super::types::{
    error_codes, BackendDescriptor, InitializeResult, ListToolsResult, ToolDefinition,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages followed for one backend.
const MAX_LIST_PAGES: usize = 64;

// ─── Connectors ──────────────────────────────────────────────────────────────

/// A freshly opened, not yet initialized connection to a backend.
pub struct OpenedTransport {
    pub transport: JsonRpcTransport,
    /// The child process, when the backend runs as one.
    pub process: Option<Child>,
}

/// Opens connections to backends.
///
/// The default [`ProcessConnector`] spawns child processes; in-process
/// backends use [`super::memory::MemoryConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &BackendDescriptor) -> Result<OpenedTransport, BackendError>;
}

/// Spawns each backend as a child process and talks to it over stdio.
#[derive(Debug, Default, Clone)]
pub struct ProcessConnector;

#[async_trait]
impl Connector for ProcessConnector {
    async fn open(&self, descriptor: &BackendDescriptor) -> Result<OpenedTransport, BackendError> {
        let spec = &descriptor.spec;
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        if let Some(dir) = spec.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BackendError::Connection {
            backend: descriptor.id.clone(),
            reason: format!("failed to spawn '{}': {e}", spec.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BackendError::Connection {
            backend: descriptor.id.clone(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| BackendError::Connection {
            backend: descriptor.id.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(descriptor.id.clone(), stderr));
        }

        tracing::debug!(
            backend = %descriptor.id,
            command = %spec.command,
            pid = child.id(),
            "spawned backend process"
        );

        Ok(OpenedTransport {
            transport: JsonRpcTransport::new(&descriptor.id, stdin, stdout),
            process: Some(child),
        })
    }
}

/// Drain a backend's stderr into the log so the pipe never fills up.
async fn forward_stderr(backend: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(backend = %backend, stderr = %line, "backend stderr");
    }
}

// ─── BackendSession ──────────────────────────────────────────────────────────

/// An initialized connection to one backend.
pub struct BackendSession {
    backend_id: String,
    transport: JsonRpcTransport,
    process: Mutex<Option<Child>>,
    init: InitializeResult,
}

impl BackendSession {
    /// Perform the initialization handshake on an opened transport.
    pub async fn establish(
        backend_id: &str,
        opened: OpenedTransport,
        init_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let OpenedTransport {
            transport,
            mut process,
        } = opened;

        let init = match tokio::time::timeout(init_timeout, initialize(&transport)).await {
            Ok(Ok(init)) => init,
            Ok(Err(e)) => {
                kill_process(&mut process).await;
                return Err(BackendError::Connection {
                    backend: backend_id.to_string(),
                    reason: format!("initialization failed: {e}"),
                });
            }
            Err(_) => {
                kill_process(&mut process).await;
                return Err(BackendError::Connection {
                    backend: backend_id.to_string(),
                    reason: format!(
                        "initialization timed out after {}ms",
                        init_timeout.as_millis()
                    ),
                });
            }
        };

        // Best-effort; older servers ignore it.
        let _ = transport.notify("notifications/initialized", None).await;

        tracing::info!(
            backend = backend_id,
            server = init.server_info.as_ref().and_then(|s| s.name.as_deref()).unwrap_or("?"),
            protocol = init.protocol_version.as_deref().unwrap_or("?"),
            "backend initialized"
        );

        Ok(Self {
            backend_id: backend_id.to_string(),
            transport,
            process: Mutex::new(process),
            init,
        })
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Details reported by the backend during the handshake.
    pub fn init_result(&self) -> &InitializeResult {
        &self.init
    }

    /// Whether the backend's output stream has ended.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// List every tool the backend exposes, following pagination.
    ///
    /// Backends that don't implement `tools/list` fall back to the tools
    /// embedded in their `initialize` response.
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, BackendError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));

            let response = self.transport.request("tools/list", params).await?;
            let result = match extract_result(&self.backend_id, response) {
                Ok(result) => result,
                Err(BackendError::Invocation { code, .. })
                    if code == error_codes::METHOD_NOT_FOUND && tools.is_empty() =>
                {
                    return Ok(self.init.tools.clone());
                }
                Err(BackendError::Invocation { code, message, .. }) => {
                    return Err(BackendError::Protocol {
                        backend: self.backend_id.clone(),
                        reason: format!("tools/list failed [{code}]: {message}"),
                    });
                }
                Err(e) => return Err(e),
            };

            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| BackendError::Protocol {
                    backend: self.backend_id.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(BackendError::Protocol {
            backend: self.backend_id.clone(),
            reason: format!("tools/list exceeded {MAX_LIST_PAGES} pages"),
        })
    }

    /// Call a tool by its backend-local name.
    ///
    /// The backend's result is returned unmodified; a JSON-RPC error object
    /// becomes [`BackendError::Invocation`].
    pub async fn call_tool(
        &self,
        local_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let params = serde_json::json!({
            "name": local_name,
            "arguments": arguments,
        });

        let response = self.transport.request("tools/call", Some(params)).await?;
        extract_result(&self.backend_id, response)
    }

    /// Shut the backend down: notify, wait briefly, then kill.
    pub async fn shutdown(&self) {
        let _ = self.transport.notify("shutdown", None).await;

        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(backend = %self.backend_id, %status, "backend exited");
                }
                _ => {
                    tracing::warn!(
                        backend = %self.backend_id,
                        "backend did not exit in time, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }
        *process = None;
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(transport: &JsonRpcTransport) -> Result<InitializeResult, BackendError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(transport.backend_id(), response)?;

    serde_json::from_value(result).map_err(|e| BackendError::Protocol {
        backend: transport.backend_id().to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })
}

async fn kill_process(process: &mut Option<Child>) {
    if let Some(child) = process.as_mut() {
        let _ = child.kill().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
