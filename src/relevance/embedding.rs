//! Local ranking over an OpenAI-compatible `/embeddings` endpoint.
//!
//! Capability descriptors are embedded once and cached per qualified name;
//! each query embeds only the task text and scores every candidate by cosine
//! similarity. Per-token embeddings are mean-pooled, and all vectors are
//! L2-normalized so cosine similarity is a dot product.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::catalog::Capability;

use super::errors::RelevanceError;
use super::service::{Ranking, RelevanceService};
use super::types::RelevanceQuery;

// ─── Embedding Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEmbeddingItem {
    index: usize,
    embedding: serde_json::Value, // number[] or number[][] (per-token)
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<RawEmbeddingItem>,
}

// ─── Service ─────────────────────────────────────────────────────────────────

struct CachedEmbedding {
    /// Descriptor the vector was computed from.
    descriptor: String,
    vector: Vec<f32>,
}

/// Ranks candidates by cosine similarity between the task and each
/// capability's semantic descriptor.
pub struct EmbeddingRelevanceService {
    http: HttpClient,
    base_url: String,
    model: Option<String>,
    /// Latest descriptor per qualified name, from catalog sync.
    descriptors: StdRwLock<HashMap<String, String>>,
    cache: Mutex<HashMap<String, CachedEmbedding>>,
}

impl EmbeddingRelevanceService {
    pub fn new(
        base_url: &str,
        model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RelevanceError> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelevanceError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            descriptors: StdRwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Number of cached capability embeddings.
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }

    fn descriptor_for(&self, qualified_name: &str) -> String {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(qualified_name)
            .cloned()
            .unwrap_or_else(|| qualified_name.to_string())
    }

    /// Embed a batch of texts via the `/embeddings` endpoint.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RelevanceError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut body = serde_json::json!({ "input": texts });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelevanceError::RequestFailed {
                reason: format!("embedding request to {url}: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(RelevanceError::Http { status, body });
        }

        let result: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| RelevanceError::Malformed {
                    reason: format!("failed to parse embedding response: {e}"),
                })?;

        if result.data.len() != texts.len() {
            return Err(RelevanceError::Malformed {
                reason: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    result.data.len()
                ),
            });
        }

        // Sort by index to ensure order matches input
        let mut items = result.data;
        items.sort_by_key(|item| item.index);

        items
            .into_iter()
            .map(|item| mean_pool_embedding(&item.embedding).map(l2_normalize))
            .collect()
    }

    /// Make sure every candidate has an up-to-date cached vector.
    ///
    /// The cache lock is never held across a request; concurrent callers
    /// missing the same descriptor may both embed it.
    async fn ensure_cached(&self, candidates: &[String]) -> Result<(), RelevanceError> {
        let missing: Vec<(String, String)> = {
            let cache = self.cache.lock().await;
            candidates
                .iter()
                .map(|name| (name.clone(), self.descriptor_for(name)))
                .filter(|(name, descriptor)| {
                    cache
                        .get(name)
                        .map_or(true, |cached| &cached.descriptor != descriptor)
                })
                .collect()
        };

        if missing.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = missing.iter().map(|(_, d)| d.clone()).collect();
        let vectors = self.embed_texts(&texts).await?;
        tracing::debug!(embedded = vectors.len(), "capability descriptors embedded");

        let mut cache = self.cache.lock().await;
        for ((name, descriptor), vector) in missing.into_iter().zip(vectors) {
            cache.insert(name, CachedEmbedding { descriptor, vector });
        }
        Ok(())
    }

    async fn embed_query(&self, task: &str) -> Result<Vec<f32>, RelevanceError> {
        self.embed_texts(&[task.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RelevanceError::Malformed {
                reason: "empty embedding for query".into(),
            })
    }
}

#[async_trait]
impl RelevanceService for EmbeddingRelevanceService {
    fn name(&self) -> &'static str {
        "embedding"
    }

    async fn select(&self, query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        if query.candidates.is_empty() {
            return Ok(Ranking::default());
        }

        let ((), query_vec) = futures::future::try_join(
            self.ensure_cached(&query.candidates),
            self.embed_query(&query.task),
        )
        .await?;

        let cache = self.cache.lock().await;
        let mut ranking = Ranking::default();
        for name in &query.candidates {
            let Some(cached) = cache.get(name) else {
                continue;
            };
            if cached.vector.len() != query_vec.len() {
                return Err(RelevanceError::Malformed {
                    reason: format!(
                        "dimension mismatch: expected {}, got {}",
                        query_vec.len(),
                        cached.vector.len()
                    ),
                });
            }
            ranking.names.push(name.clone());
            ranking.scores.push(cosine_similarity(&query_vec, &cached.vector));
        }
        Ok(ranking)
    }

    async fn health(&self) -> Result<bool, RelevanceError> {
        let vectors = self.embed_texts(&["health check".to_string()]).await?;
        Ok(vectors.first().is_some_and(|v| !v.is_empty()))
    }

    async fn sync_catalog(&self, capabilities: &[Capability]) -> Result<(), RelevanceError> {
        let fresh: HashMap<String, String> = capabilities
            .iter()
            .map(|c| (c.qualified_name.clone(), c.semantic_descriptor.clone()))
            .collect();

        self.cache
            .lock()
            .await
            .retain(|name, _| fresh.contains_key(name));
        *self
            .descriptors
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

// ─── Embedding Helpers ───────────────────────────────────────────────────────

/// Mean-pool per-token embeddings into a single vector.
///
/// 1D input is returned as-is; 2D input is averaged across tokens.
fn mean_pool_embedding(embedding: &serde_json::Value) -> Result<Vec<f32>, RelevanceError> {
    match embedding {
        serde_json::Value::Array(arr) if arr.is_empty() => Ok(Vec::new()),

        // 1D: already pooled
        serde_json::Value::Array(arr) if arr[0].is_number() => {
            Ok(arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
        }

        // 2D: per-token
        serde_json::Value::Array(arr) if arr[0].is_array() => {
            let tokens: Vec<Vec<f32>> = arr
                .iter()
                .filter_map(|row| {
                    row.as_array().map(|r| {
                        r.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
                    })
                })
                .collect();

            let n_tokens = tokens.len();
            let n_dim = tokens.first().map_or(0, Vec::len);
            let mut result = vec![0.0_f32; n_dim];

            for token in &tokens {
                for (d, val) in token.iter().enumerate().take(n_dim) {
                    result[d] += val;
                }
            }
            for val in &mut result {
                *val /= n_tokens as f32;
            }

            Ok(result)
        }

        _ => Err(RelevanceError::Malformed {
            reason: "unexpected embedding format (expected number[] or number[][])".to_string(),
        }),
    }
}

/// L2-normalize a vector. Zero vectors are returned unchanged.
fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.into_iter().map(|v| v / norm).collect()
    } else {
        vec
    }
}

/// Cosine similarity between two L2-normalized vectors (= dot product).
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// `/embeddings` stand-in: answers every request after `delay` with one
    /// unit vector per input.
    async fn embedding_server(delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(answer_embeddings(socket, delay));
            }
        });
        format!("http://{addr}")
    }

    async fn answer_embeddings(socket: TcpStream, delay: Duration) {
        let mut reader = BufReader::new(socket);
        let mut content_length = 0;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((key, value)) = header.split_once(':') {
                if key.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
        let inputs = request["input"].as_array().map_or(0, Vec::len);

        tokio::time::sleep(delay).await;
        let data: Vec<serde_json::Value> = (0..inputs)
            .map(|i| serde_json::json!({ "index": i, "embedding": [1.0, 0.0] }))
            .collect();
        let payload = serde_json::json!({ "data": data }).to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
            payload.len()
        );
        let mut socket = reader.into_inner();
        socket.write_all(response.as_bytes()).await.ok();
        socket.shutdown().await.ok();
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = l2_normalize(vec![1.0, 2.0, 3.0]);
        let score = cosine_similarity(&v, &v);
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = l2_normalize(vec![1.0, 0.0, 0.0]);
        let b = l2_normalize(vec![0.0, 1.0, 0.0]);
        assert!(cosine_similarity(&a, &b).abs() < 1e-5);
    }

    #[test]
    fn l2_normalize_zero_vector_unchanged() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn l2_normalize_scales_to_unit() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-5);
        assert!((v[1] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn mean_pool_1d_passthrough() {
        let pooled = mean_pool_embedding(&serde_json::json!([1.0, 2.0, 3.0])).unwrap();
        assert_eq!(pooled, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn mean_pool_integer_1d() {
        let pooled = mean_pool_embedding(&serde_json::json!([1, 0])).unwrap();
        assert_eq!(pooled, vec![1.0, 0.0]);
    }

    #[test]
    fn mean_pool_2d_averages_tokens() {
        let pooled =
            mean_pool_embedding(&serde_json::json!([[1.0, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn mean_pool_rejects_objects() {
        let err = mean_pool_embedding(&serde_json::json!({ "x": 1 })).unwrap_err();
        assert!(matches!(err, RelevanceError::Malformed { .. }));
    }

    #[tokio::test]
    async fn sync_catalog_sets_descriptors_and_prunes_cache() {
        let service =
            EmbeddingRelevanceService::new("http://127.0.0.1:9", None, Duration::from_millis(200))
                .unwrap();
        service.cache.lock().await.insert(
            "gone::tool".into(),
            CachedEmbedding {
                descriptor: "old".into(),
                vector: vec![1.0],
            },
        );

        let cap = Capability::from_tool(
            "fs",
            crate::backend::types::ToolDefinition {
                name: "read_file".into(),
                description: "Read a file".into(),
                input_schema: serde_json::json!({}),
            },
        );
        service.sync_catalog(std::slice::from_ref(&cap)).await.unwrap();

        assert_eq!(service.cached().await, 0);
        assert_eq!(service.descriptor_for("fs::read_file"), cap.semantic_descriptor);
        assert_eq!(service.descriptor_for("unknown::x"), "unknown::x");
    }

    #[tokio::test]
    async fn concurrent_selects_overlap_their_requests() {
        let url = embedding_server(Duration::from_millis(300)).await;
        let service = EmbeddingRelevanceService::new(&url, None, Duration::from_secs(5)).unwrap();
        let query = RelevanceQuery {
            task: "read a file".into(),
            candidates: vec!["fs::read_file".into(), "math::add".into()],
            max_results: 5,
            score_threshold: 0.0,
        };

        let started = std::time::Instant::now();
        let results =
            futures::future::join_all((0..4).map(|_| service.select(&query))).await;

        for result in results {
            let ranking = result.unwrap();
            assert_eq!(ranking.names, vec!["fs::read_file", "math::add"]);
            assert!((ranking.scores[0] - 1.0).abs() < 1e-5);
        }
        // Serialized, four selects need at least five 300ms round trips.
        assert!(started.elapsed() < Duration::from_millis(1200));
        assert_eq!(service.cached().await, 2);
    }

    #[tokio::test]
    async fn empty_candidates_need_no_network() {
        let service =
            EmbeddingRelevanceService::new("http://127.0.0.1:9", None, Duration::from_millis(200))
                .unwrap();
        let query = RelevanceQuery {
            task: "anything".into(),
            candidates: Vec::new(),
            max_results: 5,
            score_threshold: 0.0,
        };
        assert_eq!(service.select(&query).await.unwrap(), Ranking::default());
    }
}
