//! Execution tool contract and registry.
//!
//! Concrete research tools (web search, web fetch, knowledge-base lookup) are
//! external collaborators; the kernel only knows their I/O contract. The one
//! executor bundled here is `SynthesizeExecutor`, which routes synthesis steps
//! through the configured chat provider.

pub mod synthesize;

use crate::errors::ToolError;
use crate::llm::TokenUsage;
use crate::plan::{JsonMap, Step};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use synthesize::SynthesizeExecutor;

/// One record of a search-result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Output of one executed step: text, a search-result sequence, or any other
/// structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepOutput {
    SearchResults(Vec<SearchResult>),
    Text(String),
    Structured(Value),
}

impl StepOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_search_results(&self) -> Option<&[SearchResult]> {
        match self {
            Self::SearchResults(results) => Some(results),
            _ => None,
        }
    }

    /// True when the output is a non-empty sequence (search results or a
    /// structured JSON array with elements).
    pub fn has_items(&self) -> bool {
        match self {
            Self::SearchResults(results) => !results.is_empty(),
            Self::Structured(Value::Array(items)) => !items.is_empty(),
            _ => false,
        }
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub output: StepOutput,
    pub tokens_used: Option<TokenUsage>,
    pub metadata: Option<JsonMap>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: StepOutput::Text(text.into()),
            tokens_used: None,
            metadata: None,
        }
    }

    pub fn search_results(results: Vec<SearchResult>) -> Self {
        Self {
            output: StepOutput::SearchResults(results),
            tokens_used: None,
            metadata: None,
        }
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Executor contract for a single tool. May fail; the step executor turns
/// failures into failed step results.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, step: &Step, cancel: &CancellationToken)
    -> Result<ToolOutput, ToolError>;
}

/// Lookup from tool name to executor. The catalog of registered names is what
/// the planner advertises to the LLM.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Sorted catalog of registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
