//! Coverage analysis: LLM-scored answer coverage over the query's aspects,
//! with gap-filling retrieval suggestions.

use crate::decompose::{Priority, SubQuery, extract_json_block};
use crate::errors::LlmError;
use crate::events::{EventType, LogEntry, LogStore};
use crate::extract::Source;
use crate::llm::{ChatMessage, LlmClient};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One identified aspect of the query and how well it is answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAspect {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub answered: bool,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_sources: Vec<String>,
}

/// A suggested follow-up retrieval to close a gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedRetrieval {
    pub aspect: String,
    pub search_query: String,
    pub priority: Priority,
    pub reasoning: String,
}

/// Outcome of one coverage analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    /// Confidence-weighted fraction of aspects answered, in [0, 1].
    pub overall_coverage: f64,
    pub aspects_covered: Vec<CoverageAspect>,
    pub aspects_missing: Vec<CoverageAspect>,
    pub suggested_retrievals: Vec<SuggestedRetrieval>,
    pub is_complete: bool,
}

const COVERAGE_SYSTEM_PROMPT: &str = r#"You assess how completely an answer covers a research query.

Break the query into its distinct aspects and judge each against the answer.
Respond with a single JSON object, no prose:
{
  "aspects": [
    {
      "id": "<short id>",
      "description": "<what this aspect asks>",
      "keywords": ["..."],
      "answered": <bool>,
      "confidence": <0.0-1.0>,
      "supporting_sources": ["<urls from the source list that support it>"]
    }
  ],
  "suggested_retrievals": [
    {
      "aspect": "<aspect id>",
      "search_query": "<query that would close the gap>",
      "priority": "high|medium|low",
      "reasoning": "<why>"
    }
  ]
}"#;

#[derive(Debug, Deserialize)]
struct RawAspect {
    id: String,
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    answered: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    supporting_sources: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSuggestedRetrieval {
    aspect: String,
    search_query: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawCoverage {
    #[serde(default)]
    aspects: Vec<RawAspect>,
    #[serde(default)]
    suggested_retrievals: Vec<RawSuggestedRetrieval>,
}

/// LLM-driven coverage analyzer.
pub struct CoverageAnalyzer {
    llm: Arc<dyn LlmClient>,
    log: Arc<dyn LogStore>,
    model: Option<String>,
    /// Aspect confidence at or above which an aspect counts as covered.
    min_confidence: f64,
    /// Overall coverage at or above which the answer is complete.
    coverage_threshold: f64,
}

impl CoverageAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>, log: Arc<dyn LogStore>) -> Self {
        Self {
            llm,
            log,
            model: None,
            min_confidence: 0.7,
            coverage_threshold: 0.85,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_thresholds(mut self, min_confidence: f64, coverage_threshold: f64) -> Self {
        self.min_confidence = min_confidence;
        self.coverage_threshold = coverage_threshold;
        self
    }

    /// Score the current answer against the query's aspects.
    pub async fn analyze_coverage(
        &self,
        query: &str,
        current_answer: &str,
        sources: &[Source],
        sub_queries: Option<&[SubQuery]>,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CoverageResult, LlmError> {
        if let Err(err) = self
            .log
            .append(
                LogEntry::new(session_id, EventType::CoverageAnalysisStarted)
                    .with_data("query", json!(query))
                    .with_data("source_count", json!(sources.len())),
            )
            .await
        {
            return Err(LlmError::InvalidResponse(err.to_string()));
        }

        let mut user = format!("Query: {query}\n\nCurrent answer:\n{current_answer}\n\nSources:\n");
        for source in sources {
            user.push_str(&format!("- {} ({})\n", source.title, source.url));
        }
        if let Some(sub_queries) = sub_queries
            && !sub_queries.is_empty()
        {
            user.push_str("\nSub-queries already investigated:\n");
            for sq in sub_queries {
                user.push_str(&format!("- {}\n", sq.text));
            }
        }

        let messages = [
            ChatMessage::system(COVERAGE_SYSTEM_PROMPT),
            ChatMessage::user(user),
        ];
        let response = self
            .llm
            .chat(&messages, None, self.model.as_deref(), cancel)
            .await?;

        let result = self.score(response.message.text())?;
        debug!(
            coverage = result.overall_coverage,
            complete = result.is_complete,
            "coverage analyzed"
        );

        if let Err(err) = self
            .log
            .append(
                LogEntry::new(session_id, EventType::CoverageAnalysisCompleted)
                    .with_data("overall_coverage", json!(result.overall_coverage))
                    .with_data("is_complete", json!(result.is_complete))
                    .with_data("missing_count", json!(result.aspects_missing.len())),
            )
            .await
        {
            return Err(LlmError::InvalidResponse(err.to_string()));
        }

        Ok(result)
    }

    fn score(&self, content: &str) -> Result<CoverageResult, LlmError> {
        let block = extract_json_block(content)
            .ok_or_else(|| LlmError::InvalidResponse("no JSON object in response".to_string()))?;
        let raw: RawCoverage = serde_json::from_str(block)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let aspects: Vec<CoverageAspect> = raw
            .aspects
            .into_iter()
            .map(|a| CoverageAspect {
                id: a.id,
                description: a.description,
                keywords: a.keywords,
                answered: a.answered,
                confidence: a.confidence.clamp(0.0, 1.0),
                supporting_sources: a.supporting_sources,
            })
            .collect();

        let overall_coverage = if aspects.is_empty() {
            0.0
        } else {
            aspects
                .iter()
                .map(|a| if a.answered { a.confidence } else { 0.0 })
                .sum::<f64>()
                / aspects.len() as f64
        };

        let (aspects_covered, aspects_missing): (Vec<_>, Vec<_>) = aspects
            .into_iter()
            .partition(|a| a.answered && a.confidence >= self.min_confidence);

        let suggested_retrievals: Vec<SuggestedRetrieval> = raw
            .suggested_retrievals
            .into_iter()
            .filter(|s| !s.search_query.is_empty())
            .map(|s| {
                let priority = match &s.priority {
                    Some(raw_priority) => Priority::parse(raw_priority),
                    None => aspects_missing
                        .iter()
                        .find(|a| a.id == s.aspect)
                        .map(default_gap_priority)
                        .unwrap_or_default(),
                };
                SuggestedRetrieval {
                    aspect: s.aspect,
                    search_query: s.search_query,
                    priority,
                    reasoning: s.reasoning,
                }
            })
            .collect();

        Ok(CoverageResult {
            overall_coverage,
            aspects_covered,
            aspects_missing,
            suggested_retrievals,
            is_complete: overall_coverage >= self.coverage_threshold,
        })
    }
}

/// Default priority for filling a gap on a missing aspect.
fn default_gap_priority(aspect: &CoverageAspect) -> Priority {
    if !aspect.answered {
        Priority::High
    } else if aspect.confidence < 0.7 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryLogStore;
    use crate::llm::{ChatResponse, ScriptedLlm};

    fn analyzer(response: &str) -> CoverageAnalyzer {
        let script = ScriptedLlm::with_responses(vec![ChatResponse::text(response)]);
        CoverageAnalyzer::new(Arc::new(script), Arc::new(MemoryLogStore::new()))
    }

    #[tokio::test]
    async fn coverage_is_mean_of_answered_confidence() {
        let analyzer = analyzer(
            r#"{
                "aspects": [
                    {"id": "a1", "description": "d1", "answered": true, "confidence": 0.9},
                    {"id": "a2", "description": "d2", "answered": true, "confidence": 0.8},
                    {"id": "a3", "description": "d3", "answered": false, "confidence": 0.3}
                ],
                "suggested_retrievals": []
            }"#,
        );

        let result = analyzer
            .analyze_coverage("q", "answer", &[], None, "sess-1", &CancellationToken::new())
            .await
            .unwrap();

        let expected = (0.9 + 0.8 + 0.0) / 3.0;
        assert!((result.overall_coverage - expected).abs() < 1e-9);
        assert_eq!(result.aspects_covered.len(), 2);
        assert_eq!(result.aspects_missing.len(), 1);
        assert!(!result.is_complete);
    }

    #[tokio::test]
    async fn complete_when_over_threshold() {
        let analyzer = analyzer(
            r#"{
                "aspects": [
                    {"id": "a1", "description": "d1", "answered": true, "confidence": 0.95},
                    {"id": "a2", "description": "d2", "answered": true, "confidence": 0.85}
                ],
                "suggested_retrievals": []
            }"#,
        );

        let result = analyzer
            .analyze_coverage("q", "answer", &[], None, "sess-1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_complete);
        assert!(result.suggested_retrievals.is_empty());
    }

    #[tokio::test]
    async fn missing_aspect_priority_defaults() {
        let analyzer = analyzer(
            r#"{
                "aspects": [
                    {"id": "gap", "description": "unanswered", "answered": false, "confidence": 0.1},
                    {"id": "weak", "description": "low confidence", "answered": true, "confidence": 0.5}
                ],
                "suggested_retrievals": [
                    {"aspect": "gap", "search_query": "fill gap"},
                    {"aspect": "weak", "search_query": "strengthen"},
                    {"aspect": "gap", "search_query": "explicit", "priority": "low"}
                ]
            }"#,
        );

        let result = analyzer
            .analyze_coverage("q", "answer", &[], None, "sess-1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.suggested_retrievals[0].priority, Priority::High);
        assert_eq!(result.suggested_retrievals[1].priority, Priority::Medium);
        // An explicit priority is kept as-is.
        assert_eq!(result.suggested_retrievals[2].priority, Priority::Low);
    }

    #[tokio::test]
    async fn no_aspects_means_zero_coverage() {
        let analyzer = analyzer(r#"{"aspects": [], "suggested_retrievals": []}"#);
        let result = analyzer
            .analyze_coverage("q", "", &[], None, "sess-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.overall_coverage, 0.0);
        assert!(!result.is_complete);
    }

    #[tokio::test]
    async fn malformed_response_is_an_error() {
        let analyzer = analyzer("no json");
        let err = analyzer
            .analyze_coverage("q", "", &[], None, "sess-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
