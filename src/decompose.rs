//! Query decomposition: one LLM turn splitting a complex query into a DAG of
//! typed sub-queries, plus the wave-ordered execution plan over them.

use crate::errors::{DecompositionError, LogError};
use crate::events::{EventType, LogEntry, LogStore};
use crate::llm::{ChatMessage, LlmClient};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Question category of a sub-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueryType {
    #[default]
    Factual,
    Temporal,
    Comparative,
    Causal,
    Analytical,
}

impl SubQueryType {
    fn parse(raw: &str) -> Self {
        match raw {
            "temporal" => Self::Temporal,
            "comparative" => Self::Comparative,
            "causal" => Self::Causal,
            "analytical" => Self::Analytical,
            _ => Self::Factual,
        }
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// A derived question in a decomposed query graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub id: String,
    pub text: String,
    pub order: u32,
    /// Ids of sub-queries whose answers this one builds on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(rename = "type")]
    pub query_type: SubQueryType,
    pub priority: Priority,
    /// 1 (trivial) ..= 5 (hard).
    pub estimated_complexity: u8,
}

/// Outcome of one decomposition invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionResult {
    pub original_query: String,
    pub is_complex: bool,
    pub reasoning: String,
    pub sub_queries: Vec<SubQuery>,
    /// Waves of sub-query ids; later waves depend on earlier ones.
    pub execution_plan: Vec<Vec<String>>,
}

impl DecompositionResult {
    /// Trivial result for a query that needs no splitting.
    pub fn simple(query: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            original_query: query.into(),
            is_complex: false,
            reasoning: reasoning.into(),
            sub_queries: Vec::new(),
            execution_plan: Vec::new(),
        }
    }

    pub fn sub_query(&self, id: &str) -> Option<&SubQuery> {
        self.sub_queries.iter().find(|sq| sq.id == id)
    }
}

/// Compute the wave-ordered execution plan over a sub-query graph.
///
/// Unknown dependency ids are treated as satisfied (logged, not fatal); a
/// true cycle raises `DecompositionError::CircularDependency`.
pub fn build_execution_plan(
    sub_queries: &[SubQuery],
) -> Result<Vec<Vec<String>>, DecompositionError> {
    let known: HashSet<&str> = sub_queries.iter().map(|sq| sq.id.as_str()).collect();
    for sq in sub_queries {
        for dep in &sq.dependencies {
            if !known.contains(dep.as_str()) {
                warn!(sub_query = %sq.id, dependency = %dep, "unknown dependency id; treating as satisfied");
            }
        }
    }

    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut completed: HashSet<&str> = HashSet::new();

    loop {
        let ready: Vec<&SubQuery> = sub_queries
            .iter()
            .filter(|sq| !completed.contains(sq.id.as_str()))
            .filter(|sq| {
                sq.dependencies.iter().all(|dep| {
                    completed.contains(dep.as_str()) || !known.contains(dep.as_str())
                })
            })
            .collect();

        if ready.is_empty() {
            break;
        }
        let mut wave: Vec<String> = ready.iter().map(|sq| sq.id.clone()).collect();
        for sq in ready {
            completed.insert(sq.id.as_str());
        }
        // Deterministic intra-wave order: declared sub-query order.
        wave.sort_by_key(|id| {
            sub_queries
                .iter()
                .find(|sq| &sq.id == id)
                .map(|sq| sq.order)
                .unwrap_or(u32::MAX)
        });
        waves.push(wave);
    }

    let remaining: Vec<String> = sub_queries
        .iter()
        .filter(|sq| !completed.contains(sq.id.as_str()))
        .map(|sq| sq.id.clone())
        .collect();
    if !remaining.is_empty() {
        return Err(DecompositionError::CircularDependency { remaining });
    }

    Ok(waves)
}

const DECOMPOSITION_SYSTEM_PROMPT: &str = r#"You analyze research queries and decide whether they need to be split into sub-queries.

Respond with a single JSON object, no prose:
{
  "is_complex": <bool>,
  "reasoning": "<why>",
  "sub_queries": [
    {
      "id": "<short local id, e.g. sq1>",
      "text": "<the sub-question>",
      "order": <int>,
      "dependencies": ["<ids of sub-queries this builds on>"],
      "type": "factual|temporal|comparative|causal|analytical",
      "priority": "high|medium|low",
      "estimated_complexity": <1-5>
    }
  ]
}

A query is complex when it compares multiple subjects, spans time ranges, or
chains cause and effect. Simple lookups are not complex; return is_complex
false and an empty sub_queries array for those."#;

/// Raw sub-query as produced by the model, before validation and id
/// assignment.
#[derive(Debug, Deserialize)]
struct RawSubQuery {
    id: String,
    text: String,
    #[serde(default)]
    order: u32,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default, rename = "type")]
    query_type: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    estimated_complexity: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawDecomposition {
    is_complex: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    sub_queries: Vec<RawSubQuery>,
}

/// LLM-driven query decomposer.
pub struct QueryDecomposer {
    llm: Arc<dyn LlmClient>,
    log: Arc<dyn LogStore>,
    model: Option<String>,
}

impl QueryDecomposer {
    pub fn new(llm: Arc<dyn LlmClient>, log: Arc<dyn LogStore>) -> Self {
        Self {
            llm,
            log,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Run one decomposition turn for a query.
    pub async fn decompose_query(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DecompositionResult, DecompositionError> {
        self.log
            .append(
                LogEntry::new(session_id, EventType::DecompositionStarted)
                    .with_data("query", json!(query)),
            )
            .await?;

        let messages = [
            ChatMessage::system(DECOMPOSITION_SYSTEM_PROMPT),
            ChatMessage::user(format!("Query: {query}")),
        ];
        let response = match self
            .llm
            .chat(&messages, None, self.model.as_deref(), cancel)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.emit_failed(session_id, &err.to_string()).await?;
                return Err(err.into());
            }
        };

        let result = match self.parse(query, response.message.text()) {
            Ok(result) => result,
            Err(err) => {
                self.emit_failed(session_id, &err.to_string()).await?;
                return Err(err);
            }
        };

        for sq in &result.sub_queries {
            self.log
                .append(
                    LogEntry::new(session_id, EventType::SubQueryIdentified)
                        .with_data("sub_query_id", json!(sq.id))
                        .with_data("text", json!(sq.text))
                        .with_data("type", json!(sq.query_type))
                        .with_data("priority", json!(sq.priority)),
                )
                .await?;
        }
        self.log
            .append(
                LogEntry::new(session_id, EventType::DecompositionCompleted)
                    .with_data("is_complex", json!(result.is_complex))
                    .with_data("sub_query_count", json!(result.sub_queries.len()))
                    .with_data("wave_count", json!(result.execution_plan.len())),
            )
            .await?;

        Ok(result)
    }

    fn parse(&self, query: &str, content: &str) -> Result<DecompositionResult, DecompositionError> {
        let block = extract_json_block(content).ok_or_else(|| {
            DecompositionError::InvalidResponse("no JSON object in response".to_string())
        })?;
        let raw: RawDecomposition = serde_json::from_str(block)
            .map_err(|e| DecompositionError::InvalidResponse(e.to_string()))?;

        if !raw.is_complex {
            return Ok(DecompositionResult::simple(query, raw.reasoning));
        }
        if raw.sub_queries.is_empty() {
            return Err(DecompositionError::InvalidResponse(
                "complex decomposition with no sub-queries".to_string(),
            ));
        }

        // Assign durable ids, then remap dependencies through them. Unknown
        // raw ids survive verbatim and fall out at wave building.
        let id_map: HashMap<String, String> = raw
            .sub_queries
            .iter()
            .map(|sq| (sq.id.clone(), format!("sq-{}", Uuid::new_v4())))
            .collect();

        let sub_queries: Vec<SubQuery> = raw
            .sub_queries
            .into_iter()
            .map(|sq| SubQuery {
                id: id_map[&sq.id].clone(),
                text: sq.text,
                order: sq.order,
                dependencies: sq
                    .dependencies
                    .iter()
                    .map(|dep| id_map.get(dep).cloned().unwrap_or_else(|| dep.clone()))
                    .collect(),
                query_type: SubQueryType::parse(sq.query_type.as_deref().unwrap_or_default()),
                priority: Priority::parse(sq.priority.as_deref().unwrap_or_default()),
                estimated_complexity: sq.estimated_complexity.unwrap_or(2).clamp(1, 5),
            })
            .collect();

        let execution_plan = build_execution_plan(&sub_queries)?;
        debug!(
            sub_queries = sub_queries.len(),
            waves = execution_plan.len(),
            "decomposition parsed"
        );

        Ok(DecompositionResult {
            original_query: query.to_string(),
            is_complex: true,
            reasoning: raw.reasoning,
            sub_queries,
            execution_plan,
        })
    }

    async fn emit_failed(&self, session_id: &str, error: &str) -> Result<(), LogError> {
        self.log
            .append(
                LogEntry::new(session_id, EventType::DecompositionCompleted)
                    .with_data("error", json!(error)),
            )
            .await?;
        Ok(())
    }
}

/// Pull the first JSON object out of a model response, tolerating fenced
/// code blocks and surrounding prose.
pub fn extract_json_block(content: &str) -> Option<&str> {
    if let Some(start) = content.find("```json") {
        let rest = &content[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end >= start).then(|| content[start..=end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryLogStore;
    use crate::llm::{ChatResponse, ScriptedLlm};

    fn sq(id: &str, order: u32, deps: Vec<&str>) -> SubQuery {
        SubQuery {
            id: id.to_string(),
            text: format!("question {id}"),
            order,
            dependencies: deps.into_iter().map(String::from).collect(),
            query_type: SubQueryType::Factual,
            priority: Priority::Medium,
            estimated_complexity: 2,
        }
    }

    #[test]
    fn execution_plan_orders_waves_by_dependency() {
        let sub_queries = vec![
            sq("sq-a", 0, vec![]),
            sq("sq-b", 1, vec![]),
            sq("sq-c", 2, vec!["sq-a", "sq-b"]),
        ];
        let plan = build_execution_plan(&sub_queries).unwrap();
        assert_eq!(plan, vec![vec!["sq-a", "sq-b"], vec!["sq-c"]]);
    }

    #[test]
    fn execution_plan_detects_cycles() {
        let sub_queries = vec![sq("sq-a", 0, vec!["sq-b"]), sq("sq-b", 1, vec!["sq-a"])];
        let err = build_execution_plan(&sub_queries).unwrap_err();
        assert!(matches!(
            err,
            DecompositionError::CircularDependency { .. }
        ));
    }

    #[test]
    fn unknown_dependencies_are_satisfied() {
        let sub_queries = vec![sq("sq-a", 0, vec!["sq-ghost"])];
        let plan = build_execution_plan(&sub_queries).unwrap();
        assert_eq!(plan, vec![vec!["sq-a"]]);
    }

    #[test]
    fn execution_plan_is_stable_across_recomputation() {
        let sub_queries = vec![
            sq("sq-a", 0, vec![]),
            sq("sq-b", 1, vec!["sq-a"]),
            sq("sq-c", 2, vec!["sq-a"]),
        ];
        let first = build_execution_plan(&sub_queries).unwrap();
        let second = build_execution_plan(&sub_queries).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn json_block_extraction_handles_fences_and_prose() {
        assert_eq!(
            extract_json_block("```json\n{\"a\": 1}\n```").unwrap(),
            "{\"a\": 1}"
        );
        assert_eq!(
            extract_json_block("Sure! Here you go: {\"a\": 1} hope that helps").unwrap(),
            "{\"a\": 1}"
        );
        assert!(extract_json_block("no json here").is_none());
    }

    #[tokio::test]
    async fn complex_query_gets_durable_ids_and_waves() {
        let script = ScriptedLlm::with_responses(vec![ChatResponse::text(
            r#"{
                "is_complex": true,
                "reasoning": "comparison over a time range",
                "sub_queries": [
                    {"id": "a", "text": "AI impact", "order": 0, "dependencies": [], "type": "factual", "priority": "high", "estimated_complexity": 3},
                    {"id": "b", "text": "Blockchain impact", "order": 1, "dependencies": [], "type": "factual", "priority": "high", "estimated_complexity": 3},
                    {"id": "c", "text": "Compare them", "order": 2, "dependencies": ["a", "b"], "type": "comparative", "priority": "medium", "estimated_complexity": 4}
                ]
            }"#,
        )]);
        let log = Arc::new(MemoryLogStore::new());
        let decomposer = QueryDecomposer::new(Arc::new(script), log.clone());

        let result = decomposer
            .decompose_query(
                "Compare economic impacts of AI and blockchain between 2020 and 2024",
                "sess-1",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.is_complex);
        assert_eq!(result.sub_queries.len(), 3);
        assert!(result.sub_queries.iter().all(|sq| sq.id.starts_with("sq-")));
        assert_eq!(result.execution_plan.len(), 2);
        assert_eq!(result.execution_plan[0].len(), 2);
        assert_eq!(result.execution_plan[1].len(), 1);

        // The compare sub-query depends on the two durable ids.
        let compare = result
            .sub_queries
            .iter()
            .find(|sq| sq.query_type == SubQueryType::Comparative)
            .unwrap();
        assert_eq!(compare.dependencies.len(), 2);
        assert!(compare.dependencies.iter().all(|d| d.starts_with("sq-")));

        let events = log.find_by_session("sess-1").await.unwrap();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types[0], EventType::DecompositionStarted);
        assert_eq!(
            types.iter().filter(|t| **t == EventType::SubQueryIdentified).count(),
            3
        );
        assert_eq!(*types.last().unwrap(), EventType::DecompositionCompleted);
    }

    #[tokio::test]
    async fn simple_query_short_circuits() {
        let script = ScriptedLlm::with_responses(vec![ChatResponse::text(
            r#"{"is_complex": false, "reasoning": "single lookup", "sub_queries": []}"#,
        )]);
        let log = Arc::new(MemoryLogStore::new());
        let decomposer = QueryDecomposer::new(Arc::new(script), log);

        let result = decomposer
            .decompose_query("What is quantum computing?", "sess-1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_complex);
        assert!(result.sub_queries.is_empty());
        assert!(result.execution_plan.is_empty());
    }

    #[tokio::test]
    async fn invalid_json_surfaces_on_completion_event() {
        let script =
            ScriptedLlm::with_responses(vec![ChatResponse::text("not json at all")]);
        let log = Arc::new(MemoryLogStore::new());
        let decomposer = QueryDecomposer::new(Arc::new(script), log.clone());

        let err = decomposer
            .decompose_query("anything", "sess-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DecompositionError::InvalidResponse(_)));

        let events = log.find_by_session("sess-1").await.unwrap();
        let completed = events
            .iter()
            .find(|e| e.event_type == EventType::DecompositionCompleted)
            .unwrap();
        assert!(completed.data.contains_key("error"));
    }
}
