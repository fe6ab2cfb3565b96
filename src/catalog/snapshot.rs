//! Immutable catalog snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::capability::Capability;

/// One published view of the aggregate catalog.
///
/// Never mutated after construction; the aggregator swaps in a new
/// `Arc<CatalogSnapshot>` on every rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub built_at: DateTime<Utc>,
    /// SHA-256 over qualified names, descriptions and schemas.
    pub fingerprint: String,
    /// Sorted by qualified name.
    capabilities: Vec<Capability>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl CatalogSnapshot {
    /// Build a snapshot, sorting by qualified name and dropping repeated
    /// names (first occurrence wins).
    pub fn build(version: u64, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut capabilities: Vec<Capability> = capabilities.into_iter().collect();
        // Stable, so the first occurrence of a repeated name stays first.
        capabilities.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));

        let before = capabilities.len();
        capabilities.dedup_by(|later, earlier| later.qualified_name == earlier.qualified_name);
        if capabilities.len() != before {
            tracing::warn!(
                dropped = before - capabilities.len(),
                "duplicate qualified names in catalog"
            );
        }

        let index = capabilities
            .iter()
            .enumerate()
            .map(|(i, c)| (c.qualified_name.clone(), i))
            .collect();

        Self {
            version,
            built_at: Utc::now(),
            fingerprint: fingerprint(&capabilities),
            capabilities,
            index,
        }
    }

    /// An empty snapshot at version 0.
    pub fn empty() -> Self {
        Self::build(0, Vec::new())
    }

    pub fn get(&self, qualified_name: &str) -> Option<&Capability> {
        self.index.get(qualified_name).map(|&i| &self.capabilities[i])
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.index.contains_key(qualified_name)
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn qualified_names(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .map(|c| c.qualified_name.clone())
            .collect()
    }

    /// Capabilities belonging to one backend.
    pub fn for_backend<'a>(&'a self, backend_id: &'a str) -> impl Iterator<Item = &'a Capability> {
        self.capabilities
            .iter()
            .filter(move |c| c.backend_id == backend_id)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

fn fingerprint(capabilities: &[Capability]) -> String {
    let mut hasher = Sha256::new();
    for cap in capabilities {
        hasher.update(cap.qualified_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(cap.description.as_bytes());
        hasher.update([0u8]);
        hasher.update(cap.input_schema.to_string().as_bytes());
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}
