//! Consumer-facing JSON-RPC server.
//!
//! Serves a [`Router`] over any line-delimited JSON-RPC stream (stdio in
//! production, an in-memory pipe in tests). Each request runs in its own
//! task; responses are written whole lines at a time under a writer lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinSet};

use crate::backend::types::{error_codes, JsonRpcError, PROTOCOL_VERSION};

use super::dispatch::Router;

/// `_meta` keys checked, in order, for a task description on `tools/list`.
const CONTEXT_KEYS: &[&str] = &["user_query", "task_description", "recent_conversation"];

type InFlight = Arc<StdMutex<HashMap<String, AbortHandle>>>;

/// Serve until the consumer closes its end of the stream.
///
/// In-flight requests are aborted when the stream closes.
pub async fn serve<R, W>(router: Arc<Router>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    let in_flight: InFlight = Arc::new(StdMutex::new(HashMap::new()));
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();

    tracing::info!("consumer session started");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                let reply = failure(
                    Value::Null,
                    JsonRpcError {
                        code: error_codes::PARSE_ERROR,
                        message: format!("parse error: {e}"),
                        data: None,
                    },
                );
                write_message(&writer, &reply).await?;
                continue;
            }
        };

        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let Some(id) = message.get("id").cloned().filter(|id| !id.is_null()) else {
            if let Some(method) = method {
                handle_notification(&method, &params, &in_flight);
            }
            continue;
        };

        let Some(method) = method else {
            let reply = failure(
                id,
                JsonRpcError {
                    code: error_codes::INVALID_REQUEST,
                    message: "missing method".into(),
                    data: None,
                },
            );
            write_message(&writer, &reply).await?;
            continue;
        };

        let key = id.to_string();
        let router = Arc::clone(&router);
        let writer = Arc::clone(&writer);
        let registry = Arc::clone(&in_flight);
        let task_key = key.clone();

        // Held across spawn so a fast task can't remove its entry before
        // it is inserted.
        {
            let mut registered = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            let abort = tasks.spawn(async move {
                let reply = match handle_request(&router, &method, params).await {
                    Ok(result) => success(id, result),
                    Err(error) => failure(id, error),
                };
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_key);
                if let Err(e) = write_message(&writer, &reply).await {
                    tracing::warn!(method = %method, error = %e, "failed to write response");
                }
            });
            registered.insert(key, abort);
        }

        while tasks.try_join_next().is_some() {}
    }

    tracing::info!(in_flight = tasks.len(), "consumer closed the stream");
    tasks.shutdown().await;
    Ok(())
}

/// Serve the router on this process's stdin/stdout.
pub async fn serve_stdio(router: Arc<Router>) -> std::io::Result<()> {
    serve(router, tokio::io::stdin(), tokio::io::stdout()).await
}

fn handle_notification(method: &str, params: &Value, in_flight: &InFlight) {
    match method {
        "notifications/cancelled" => {
            let Some(request_id) = params.get("requestId") else {
                return;
            };
            let handle = in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id.to_string());
            if let Some(handle) = handle {
                handle.abort();
                tracing::debug!(request_id = %request_id, "request cancelled by consumer");
            }
        }
        "notifications/initialized" => {}
        other => tracing::debug!(method = %other, "ignoring notification"),
    }
}

// ─── Request handling ────────────────────────────────────────────────────────

async fn handle_request(router: &Router, method: &str, params: Value) -> Result<Value, JsonRpcError> {
    match method {
        "initialize" => Ok(serde_json::json!({
            "protocolVersion": params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION),
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),

        "ping" => Ok(serde_json::json!({})),

        "tools/list" => {
            let query = list_query(&params);
            let listing = router.list_capabilities(query.as_deref()).await;
            let tools: Vec<_> = listing
                .capabilities
                .iter()
                .map(|c| c.to_tool_definition())
                .collect();
            Ok(serde_json::json!({ "tools": tools, "_meta": listing.meta() }))
        }

        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid_params("missing 'name'"))?;
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));

            router
                .invoke_capability(name, arguments)
                .await
                .map_err(|e| JsonRpcError {
                    code: e.code(),
                    message: e.message(),
                    data: e.data(),
                })
        }

        "router/stats" => serde_json::to_value(router.stats().await).map_err(|e| JsonRpcError {
            code: error_codes::INTERNAL_ERROR,
            message: format!("failed to serialize stats: {e}"),
            data: None,
        }),

        "router/refresh" => {
            let snapshot = router.refresh_catalog().await;
            Ok(serde_json::json!({
                "version": snapshot.version,
                "capabilities": snapshot.len(),
                "fingerprint": snapshot.fingerprint,
            }))
        }

        other => Err(JsonRpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("method not found: {other}"),
            data: None,
        }),
    }
}

/// Task text for a list call: `params.query`, else the first non-blank
/// context string in `params._meta`.
fn list_query(params: &Value) -> Option<String> {
    let non_blank = |v: &Value| {
        v.as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(query) = params.get("query").and_then(non_blank) {
        return Some(query);
    }
    let meta = params.get("_meta")?;
    CONTEXT_KEYS
        .iter()
        .find_map(|key| meta.get(*key).and_then(non_blank))
}

fn invalid_params(message: &str) -> JsonRpcError {
    JsonRpcError {
        code: error_codes::INVALID_PARAMS,
        message: message.to_string(),
        data: None,
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

fn success(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn failure(id: Value, error: JsonRpcError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

async fn write_message<W>(writer: &Mutex<W>, message: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
