//! Relevance query/result types and the selection service wire format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::RelevanceError;

/// Upper bound the selection service accepts for `limit`.
pub const MAX_LIMIT: usize = 50;

/// Upper bound the selection service accepts for `similarity_threshold`.
pub const MAX_THRESHOLD: f32 = 2.0;

// ─── Query / Result ──────────────────────────────────────────────────────────

/// One ranking request. Created per list call.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceQuery {
    pub task: String,
    /// Qualified names, in catalog order.
    pub candidates: Vec<String>,
    pub max_results: usize,
    pub score_threshold: f32,
}

/// A capability name and its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCapability {
    pub qualified_name: String,
    pub score: f32,
}

/// Ranked selection, always a subset of the query's candidates.
///
/// Scores in `selected` never increase. Equal scores are not reordered by
/// score; they keep the order the candidates were given in, so the ranking is
/// deterministic but not strictly descending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelevanceResult {
    /// Non-increasing by score, ties in candidate order.
    pub selected: Vec<ScoredCapability>,
    pub query: String,
    pub total_candidates: usize,
    pub total_selected: usize,
}

impl RelevanceResult {
    /// Validate and clean up raw `(names, scores)` from a ranking service.
    ///
    /// Drops names outside the candidate set, repeats, scores below the
    /// threshold, and anything past `max_results`. Orders by descending
    /// score, ties by candidate order. Mismatched lengths and non-finite
    /// scores are rejected as malformed.
    pub fn normalize(
        query: &RelevanceQuery,
        names: Vec<String>,
        scores: Vec<f32>,
    ) -> Result<Self, RelevanceError> {
        if names.len() != scores.len() {
            return Err(RelevanceError::Malformed {
                reason: format!(
                    "{} names but {} scores",
                    names.len(),
                    scores.len()
                ),
            });
        }
        if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
            return Err(RelevanceError::Malformed {
                reason: format!("non-finite score {bad}"),
            });
        }

        let position: HashMap<&str, usize> = query
            .candidates
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut ranked: Vec<(usize, ScoredCapability)> = Vec::new();
        for (name, score) in names.into_iter().zip(scores) {
            let Some(&pos) = position.get(name.as_str()) else {
                continue;
            };
            if score < query.score_threshold || !seen.insert(pos) {
                continue;
            }
            ranked.push((
                pos,
                ScoredCapability {
                    qualified_name: name,
                    score,
                },
            ));
        }

        ranked.sort_by(|(pa, a), (pb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(pa.cmp(pb))
        });
        ranked.truncate(query.max_results);

        let selected: Vec<ScoredCapability> = ranked.into_iter().map(|(_, s)| s).collect();
        Ok(Self {
            total_selected: selected.len(),
            selected,
            query: query.task.clone(),
            total_candidates: query.candidates.len(),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.selected
            .iter()
            .map(|s| s.qualified_name.as_str())
            .collect()
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Why the unfiltered catalog was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassThroughReason {
    /// Filtering is turned off in configuration.
    Disabled,
    /// The circuit is open; no call was attempted.
    CircuitOpen,
    /// The cached health probe says the service is down.
    Unhealthy,
    /// The call did not finish within the per-query timeout.
    Timeout,
    /// Network failure or non-success status.
    ServiceError,
    /// The service answered with an unusable payload.
    Malformed,
    /// There was nothing to rank.
    EmptyCatalog,
}

impl PassThroughReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::CircuitOpen => "circuit_open",
            Self::Unhealthy => "unhealthy",
            Self::Timeout => "timeout",
            Self::ServiceError => "service_error",
            Self::Malformed => "malformed",
            Self::EmptyCatalog => "empty_catalog",
        }
    }
}

impl std::fmt::Display for PassThroughReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&RelevanceError> for PassThroughReason {
    fn from(err: &RelevanceError) -> Self {
        match err {
            RelevanceError::Timeout { .. } => Self::Timeout,
            RelevanceError::Malformed { .. } => Self::Malformed,
            RelevanceError::CircuitOpen => Self::CircuitOpen,
            RelevanceError::Http { .. } | RelevanceError::RequestFailed { .. } => {
                Self::ServiceError
            }
        }
    }
}

/// What the relevance client decided for one list call.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    Selected(RelevanceResult),
    PassThrough(PassThroughReason),
}

// ─── Wire Format ─────────────────────────────────────────────────────────────

/// `POST /select-tools` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectToolsRequest {
    pub query: String,
    pub available_tools: Vec<String>,
    pub limit: usize,
    pub similarity_threshold: f32,
}

impl SelectToolsRequest {
    /// Build a request, clamping limits to what the service accepts.
    pub fn from_query(query: &RelevanceQuery) -> Self {
        Self {
            query: query.task.clone(),
            available_tools: query.candidates.clone(),
            limit: query.max_results.clamp(1, MAX_LIMIT),
            similarity_threshold: query.score_threshold.clamp(0.0, MAX_THRESHOLD),
        }
    }
}

/// `POST /select-tools` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectToolsResponse {
    pub selected_tools: Vec<String>,
    pub scores: Vec<f32>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub total_available: usize,
    #[serde(default)]
    pub total_selected: usize,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub retriever_available: bool,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" && self.retriever_available
    }
}
