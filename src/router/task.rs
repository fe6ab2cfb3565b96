//! Task description strategies.
//!
//! The list path needs free text to rank capabilities against. A
//! [`DescriberChain`] asks each strategy in turn and takes the first answer.

use std::sync::{Mutex as StdMutex, PoisonError};

/// What a describer can look at.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// Query supplied with the list call, if any.
    pub explicit_query: Option<String>,
    /// Qualified name of the capability invoked most recently.
    pub last_invoked: Option<String>,
}

/// One way of deriving a task description.
pub trait TaskDescriber: Send + Sync {
    fn describe(&self, context: &TaskContext) -> Option<String>;
}

/// Uses the caller's query verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitQuery;

impl TaskDescriber for ExplicitQuery {
    fn describe(&self, context: &TaskContext) -> Option<String> {
        context
            .explicit_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
    }
}

/// Turns the last invoked capability's name into words:
/// `fs::read_file` → `"fs read file"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastInvoked;

impl TaskDescriber for LastInvoked {
    fn describe(&self, context: &TaskContext) -> Option<String> {
        let name = context.last_invoked.as_deref()?;
        let words: Vec<&str> = name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        (!words.is_empty()).then(|| words.join(" "))
    }
}

/// Always answers with a fixed description.
#[derive(Debug, Clone)]
pub struct GenericDefault(pub String);

/// Description used when nothing better is known.
pub const DEFAULT_TASK: &str = "general task execution";

impl Default for GenericDefault {
    fn default() -> Self {
        Self(DEFAULT_TASK.to_string())
    }
}

impl TaskDescriber for GenericDefault {
    fn describe(&self, _context: &TaskContext) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Ordered strategies; the first `Some` wins.
pub struct DescriberChain {
    describers: Vec<Box<dyn TaskDescriber>>,
}

impl Default for DescriberChain {
    /// Explicit query → last invoked capability → generic default.
    fn default() -> Self {
        Self::new()
            .then(ExplicitQuery)
            .then(LastInvoked)
            .then(GenericDefault::default())
    }
}

impl DescriberChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self {
            describers: Vec::new(),
        }
    }

    pub fn then(mut self, describer: impl TaskDescriber + 'static) -> Self {
        self.describers.push(Box::new(describer));
        self
    }

    /// First answer from the chain, or the generic default if none answer.
    pub fn describe(&self, context: &TaskContext) -> String {
        self.describers
            .iter()
            .find_map(|d| d.describe(context))
            .unwrap_or_else(|| DEFAULT_TASK.to_string())
    }
}

/// Remembers the most recently invoked capability.
#[derive(Debug, Default)]
pub struct LastInvokedTracker {
    last: StdMutex<Option<String>>,
}

impl LastInvokedTracker {
    pub fn record(&self, qualified_name: &str) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(qualified_name.to_string());
    }

    pub fn get(&self) -> Option<String> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
