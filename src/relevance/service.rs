//! The pluggable ranking boundary and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use crate::catalog::Capability;

use super::errors::RelevanceError;
use super::types::{HealthResponse, RelevanceQuery, SelectToolsRequest, SelectToolsResponse};

/// Raw ranking from a service, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub names: Vec<String>,
    pub scores: Vec<f32>,
}

/// Something that can rank capabilities against a task description.
#[async_trait]
pub trait RelevanceService: Send + Sync {
    /// Short label for logs and stats.
    fn name(&self) -> &'static str;

    /// Rank (a subset of) `query.candidates`. The caller validates and trims
    /// the result, so implementations may over-return.
    async fn select(&self, query: &RelevanceQuery) -> Result<Ranking, RelevanceError>;

    /// Whether the service is ready to rank.
    async fn health(&self) -> Result<bool, RelevanceError>;

    /// Told about every new catalog snapshot. Services that keep their own
    /// index can use it to learn descriptors.
    async fn sync_catalog(&self, _capabilities: &[Capability]) -> Result<(), RelevanceError> {
        Ok(())
    }
}

// ─── HTTP selection service ──────────────────────────────────────────────────

/// Client for a remote selection service speaking
/// `POST /select-tools` and `GET /health`.
pub struct HttpRelevanceService {
    http: HttpClient,
    base_url: String,
}

impl HttpRelevanceService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RelevanceError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelevanceError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RelevanceService for HttpRelevanceService {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn select(&self, query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        let url = format!("{}/select-tools", self.base_url);
        let body = SelectToolsRequest::from_query(query);

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelevanceError::RequestFailed {
                reason: format!("request to {url}: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RelevanceError::Http { status, body });
        }

        let parsed: SelectToolsResponse =
            response
                .json()
                .await
                .map_err(|e| RelevanceError::Malformed {
                    reason: format!("failed to parse select-tools response: {e}"),
                })?;

        Ok(Ranking {
            names: parsed.selected_tools,
            scores: parsed.scores,
        })
    }

    async fn health(&self) -> Result<bool, RelevanceError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RelevanceError::RequestFailed {
                reason: format!("request to {url}: {e}"),
            })?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let parsed: HealthResponse =
            response
                .json()
                .await
                .map_err(|e| RelevanceError::Malformed {
                    reason: format!("failed to parse health response: {e}"),
                })?;
        Ok(parsed.is_healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let service =
            HttpRelevanceService::new("http://localhost:8001/", Duration::from_secs(1)).unwrap();
        assert_eq!(service.base_url(), "http://localhost:8001");
    }

    /// Serve exactly one HTTP request with a canned JSON response, returning
    /// the request body.
    async fn one_shot_server(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );

        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let request_body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    let body = &text[split + 4..];
                    if body.len() >= length || n == 0 {
                        break body.to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request_body
        });

        (format!("http://{addr}"), task)
    }

    fn query() -> RelevanceQuery {
        RelevanceQuery {
            task: "read a file".into(),
            candidates: vec!["fs::read_file".into(), "math::add".into()],
            max_results: 5,
            score_threshold: 0.1,
        }
    }

    #[tokio::test]
    async fn select_speaks_the_wire_format() {
        let (url, server) = one_shot_server(
            "200 OK",
            r#"{"selected_tools":["fs::read_file"],"scores":[0.92],"query":"read a file","total_available":2,"total_selected":1}"#,
        )
        .await;
        let service = HttpRelevanceService::new(&url, Duration::from_secs(5)).unwrap();

        let ranking = service.select(&query()).await.unwrap();
        assert_eq!(ranking.names, vec!["fs::read_file"]);
        assert_eq!(ranking.scores, vec![0.92]);

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["query"], "read a file");
        assert_eq!(sent["available_tools"][1], "math::add");
        assert_eq!(sent["limit"], 5);
    }

    #[tokio::test]
    async fn error_status_is_http_error() {
        let (url, _server) = one_shot_server("503 Service Unavailable", r#"{"detail":"down"}"#).await;
        let service = HttpRelevanceService::new(&url, Duration::from_secs(5)).unwrap();

        let err = service.select(&query()).await.unwrap_err();
        assert!(matches!(err, RelevanceError::Http { status: 503, .. }));
    }

    #[tokio::test]
    async fn health_reads_retriever_flag() {
        let (url, _server) =
            one_shot_server("200 OK", r#"{"status":"healthy","retriever_available":true}"#).await;
        let service = HttpRelevanceService::new(&url, Duration::from_secs(5)).unwrap();
        assert!(service.health().await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_service_is_request_failure() {
        // Nothing listens on the discard port.
        let service =
            HttpRelevanceService::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let query = RelevanceQuery {
            task: "anything".into(),
            candidates: vec!["a::x".into()],
            max_results: 5,
            score_threshold: 0.0,
        };
        let err = service.select(&query).await.unwrap_err();
        assert!(matches!(err, RelevanceError::RequestFailed { .. }));
    }
}
