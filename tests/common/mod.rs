//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use toolgate::backend::{BackendDescriptor, BackendSettings, BackendSpec};
use toolgate::config::FilteringConfig;
use toolgate::relevance::{Ranking, RelevanceHealth, RelevanceQuery};
use toolgate::{
    BackendManager, Capability, MemoryBackend, MemoryConnector, RelevanceClient, RelevanceError,
    RelevanceService, Router,
};

const STOP_WORDS: &[&str] = &["a", "an", "and", "the", "to", "of", "in", "for", "from", "on"];

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Scores each candidate by the share of task words found in its semantic
/// descriptor. Deterministic stand-in for an embedding service.
#[derive(Default)]
pub struct LexicalService {
    descriptors: Mutex<HashMap<String, HashSet<String>>>,
}

#[async_trait]
impl RelevanceService for LexicalService {
    fn name(&self) -> &'static str {
        "lexical"
    }

    async fn select(&self, query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        let task = tokens(&query.task);
        let descriptors = self.descriptors.lock().unwrap();
        let mut ranking = Ranking::default();
        for name in &query.candidates {
            let words = descriptors.get(name).cloned().unwrap_or_else(|| tokens(name));
            let hits = task.iter().filter(|w| words.contains(*w)).count();
            ranking.names.push(name.clone());
            ranking.scores.push(hits as f32 / task.len().max(1) as f32);
        }
        Ok(ranking)
    }

    async fn health(&self) -> Result<bool, RelevanceError> {
        Ok(true)
    }

    async fn sync_catalog(&self, capabilities: &[Capability]) -> Result<(), RelevanceError> {
        let mut descriptors = self.descriptors.lock().unwrap();
        descriptors.clear();
        for cap in capabilities {
            descriptors.insert(cap.qualified_name.clone(), tokens(&cap.semantic_descriptor));
        }
        Ok(())
    }
}

/// Healthy, but every selection fails.
pub struct BrokenService;

#[async_trait]
impl RelevanceService for BrokenService {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn select(&self, _query: &RelevanceQuery) -> Result<Ranking, RelevanceError> {
        Err(RelevanceError::Http {
            status: 500,
            body: "index unavailable".into(),
        })
    }

    async fn health(&self) -> Result<bool, RelevanceError> {
        Ok(true)
    }
}

pub fn echo(args: serde_json::Value) -> Result<serde_json::Value, (i32, String)> {
    Ok(args)
}

/// The four-capability catalog used across scenarios.
pub fn fs_and_math() -> Vec<(&'static str, MemoryBackend)> {
    vec![
        (
            "fs",
            MemoryBackend::new()
                .tool_with_schema(
                    "read_file",
                    "Read the contents of a file",
                    serde_json::json!({
                        "type": "object",
                        "properties": { "path": { "type": "string", "description": "Path to read" } },
                        "required": ["path"]
                    }),
                    |args| Ok(serde_json::json!({ "content": [{ "type": "text", "text": format!("contents of {}", args["path"]) }] })),
                )
                .tool("list_dir", "List the entries of a directory", echo),
        ),
        (
            "math",
            MemoryBackend::new()
                .tool("add", "Add two numbers", |args| {
                    let a = args["a"].as_f64().unwrap_or(0.0);
                    let b = args["b"].as_f64().unwrap_or(0.0);
                    Ok(serde_json::json!({ "sum": a + b }))
                })
                .tool("sqrt", "Square root of a number", echo),
        ),
    ]
}

pub struct Harness {
    pub router: Arc<Router>,
    pub connector: Arc<MemoryConnector>,
}

/// Connect the given in-process backends and build a router over them.
pub async fn harness(
    backends: Vec<(&str, MemoryBackend)>,
    service: Arc<dyn RelevanceService>,
    filtering: FilteringConfig,
) -> Harness {
    let connector = Arc::new(MemoryConnector::new());
    let ids: Vec<String> = backends.iter().map(|(id, _)| id.to_string()).collect();
    for (id, backend) in backends {
        connector.register(id, backend);
    }

    let settings = BackendSettings {
        init_timeout: Duration::from_secs(2),
        call_timeout: Duration::from_secs(2),
        ..BackendSettings::default()
    };
    let manager = Arc::new(BackendManager::new(connector.clone(), settings));
    for id in ids {
        manager
            .connect(BackendDescriptor::new(id, BackendSpec::default()))
            .await
            .unwrap();
    }

    let relevance = RelevanceClient::new(
        service,
        Arc::new(RelevanceHealth::default()),
        Duration::from_secs(1),
    );
    let router = Router::new(manager, Some(relevance), filtering, Duration::from_secs(300));
    router.refresh_catalog().await;

    Harness {
        router: Arc::new(router),
        connector,
    }
}

pub fn filtering(max_results: usize, score_threshold: f32) -> FilteringConfig {
    FilteringConfig {
        max_results,
        score_threshold,
        ..FilteringConfig::default()
    }
}
