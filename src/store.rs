//! Persisted research results and the result-store contract.

use crate::decompose::DecompositionResult;
use crate::errors::StoreError;
use crate::extract::Source;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Wall-clock spent in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub execution_time_ms: u64,
}

/// Outcome of one executed sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQueryOutcome {
    pub answer: String,
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Execution metadata carried on a persisted result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchMetadata {
    pub total_execution_time_ms: u64,
    #[serde(default)]
    pub phases: Vec<PhaseTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposition: Option<DecompositionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_query_results: Option<HashMap<String, SubQueryOutcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_cycles: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_coverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_improvement: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_agentic_pipeline: Option<bool>,
}

/// The answer a session produced, with its citations and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub query: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub metadata: ResearchMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Durable result store contract. The bundled implementation is in-memory;
/// durable backends are external collaborators.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: &ResearchResult) -> Result<(), StoreError>;
    async fn find_by_session(&self, session_id: &str)
    -> Result<Option<ResearchResult>, StoreError>;
}

/// In-memory result store keyed by session id.
#[derive(Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<String, ResearchResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, result: &ResearchResult) -> Result<(), StoreError> {
        self.results
            .write()
            .await
            .insert(result.session_id.clone(), result.clone());
        Ok(())
    }

    async fn find_by_session(
        &self,
        session_id: &str,
    ) -> Result<Option<ResearchResult>, StoreError> {
        Ok(self.results.read().await.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Relevance;

    fn sample_result(session_id: &str) -> ResearchResult {
        ResearchResult {
            session_id: session_id.to_string(),
            plan_id: Some("plan-1".to_string()),
            query: "what is rust".to_string(),
            answer: "a systems language".to_string(),
            sources: vec![Source {
                url: "https://rust-lang.org".to_string(),
                title: "Rust".to_string(),
                relevance: Relevance::High,
            }],
            metadata: ResearchMetadata {
                total_execution_time_ms: 1200,
                phases: vec![PhaseTiming {
                    phase: "Search".to_string(),
                    execution_time_ms: 800,
                }],
                ..Default::default()
            },
            confidence: Some(0.9),
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip() {
        let store = MemoryResultStore::new();
        let result = sample_result("sess-1");
        store.save(&result).await.unwrap();

        let found = store.find_by_session("sess-1").await.unwrap().unwrap();
        assert_eq!(found, result);
        assert!(store.find_by_session("sess-2").await.unwrap().is_none());
    }

    #[test]
    fn metadata_omits_unused_fields_in_json() {
        let result = sample_result("sess-1");
        let value = serde_json::to_value(&result).unwrap();
        assert!(value["metadata"].get("decomposition").is_none());
        assert!(value["metadata"].get("used_agentic_pipeline").is_none());
        assert_eq!(value["metadata"]["total_execution_time_ms"], 1200);
    }
}
