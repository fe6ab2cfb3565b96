//! Capability records and qualified naming.

use serde::{Deserialize, Serialize};

use crate::backend::types::ToolDefinition;

/// Separator between backend id and local name in a qualified name.
///
/// Backend ids may not contain it; config validation rejects them.
pub const QUALIFIED_NAME_SEPARATOR: &str = "::";

/// One invocable procedure exposed by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// `backend_id::local_name`, unique across the catalog.
    pub qualified_name: String,
    /// Name the backend itself knows the capability by.
    pub local_name: String,
    pub backend_id: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    /// Text used for semantic ranking.
    pub semantic_descriptor: String,
}

impl Capability {
    /// Build a capability from a backend's tool definition.
    pub fn from_tool(backend_id: &str, tool: ToolDefinition) -> Self {
        let semantic_descriptor =
            semantic_descriptor(backend_id, &tool.name, &tool.description, &tool.input_schema);
        Self {
            qualified_name: qualify(backend_id, &tool.name),
            local_name: tool.name,
            backend_id: backend_id.to_string(),
            description: tool.description,
            input_schema: tool.input_schema,
            semantic_descriptor,
        }
    }

    /// The consumer-facing tool definition (qualified name, description,
    /// input schema).
    pub fn to_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Join a backend id and local name into a qualified name.
pub fn qualify(backend_id: &str, local_name: &str) -> String {
    format!("{backend_id}{QUALIFIED_NAME_SEPARATOR}{local_name}")
}

/// Split a qualified name at the first separator.
///
/// Returns `None` when the separator is missing or either side is empty.
/// Local names may themselves contain the separator.
pub fn split_qualified(qualified_name: &str) -> Option<(&str, &str)> {
    let (backend, local) = qualified_name.split_once(QUALIFIED_NAME_SEPARATOR)?;
    if backend.is_empty() || local.is_empty() {
        return None;
    }
    Some((backend, local))
}

// ─── Semantic Descriptor ─────────────────────────────────────────────────────

/// Verbs worth surfacing as keywords when they appear in a description.
const ACTION_WORDS: &[&str] = &[
    "create", "read", "write", "update", "delete", "get", "set", "list", "search", "find",
    "execute", "run", "send", "receive", "fetch", "upload", "download", "generate", "analyze",
    "process", "transform",
];

/// `(trigger words in the name, use case)` pairs.
const USE_CASES: &[(&[&str], &str)] = &[
    (&["file", "read", "write", "dir"], "working with files or directories"),
    (&["git", "commit", "branch", "repo"], "managing version control or repositories"),
    (&["web", "http", "api", "request"], "making web requests or API calls"),
    (&["browser", "click", "navigate"], "automating browser interactions"),
    (&["search", "query", "find", "filter"], "searching or querying data"),
    (&["send", "email", "message", "notify"], "sending messages or notifications"),
];

/// Build the multi-line text a capability is ranked by.
///
/// ```text
/// Tool: read_file
/// Source: fs server
/// Description: Read a file from disk
/// Parameters:
/// - path (string): Absolute path
/// Keywords: file, read
/// Use when: working with files or directories
/// ```
pub fn semantic_descriptor(
    backend_id: &str,
    local_name: &str,
    description: &str,
    input_schema: &serde_json::Value,
) -> String {
    let mut lines = vec![
        format!("Tool: {local_name}"),
        format!("Source: {backend_id} server"),
        format!("Description: {description}"),
    ];

    if let Some(properties) = input_schema.get("properties").and_then(|p| p.as_object()) {
        if !properties.is_empty() {
            lines.push("Parameters:".to_string());
            for (name, def) in properties {
                let ty = def.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
                let desc = def
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("No description");
                lines.push(format!("- {name} ({ty}): {desc}"));
            }
        }
    }

    let keywords = keywords(local_name, description);
    if !keywords.is_empty() {
        lines.push(format!("Keywords: {}", keywords.join(", ")));
    }

    let name_lower = local_name.to_lowercase();
    let use_cases: Vec<&str> = USE_CASES
        .iter()
        .filter(|(triggers, _)| triggers.iter().any(|t| name_lower.contains(t)))
        .map(|(_, use_case)| *use_case)
        .collect();
    if !use_cases.is_empty() {
        lines.push(format!("Use when: {}", use_cases.join("; ")));
    }

    lines.join("\n")
}

/// Name parts plus action verbs found in the description, sorted and deduped.
fn keywords(local_name: &str, description: &str) -> Vec<String> {
    let mut words: Vec<String> = local_name
        .to_lowercase()
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();

    let description_lower = description.to_lowercase();
    words.extend(
        ACTION_WORDS
            .iter()
            .filter(|w| description_lower.contains(*w))
            .map(|w| w.to_string()),
    );

    words.sort();
    words.dedup();
    words
}
