//! Evaluator contracts and the bundled LLM-backed evaluator.
//!
//! Plan, retrieval, and answer evaluation share one verdict shape. The
//! orchestrator treats `passed ∨ evaluation_skipped` as success and swallows
//! evaluator errors, so a broken evaluator can never sink a session.

use crate::decompose::extract_json_block;
use crate::errors::LlmError;
use crate::extract::Source;
use crate::llm::{ChatMessage, LlmClient};
use crate::plan::{Plan, StepResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dimension scores below this count as failing.
pub const FAILING_DIMENSION_THRESHOLD: f64 = 0.6;

/// Verdict of one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub passed: bool,
    /// Per-dimension scores in [0, 1].
    pub scores: BTreeMap<String, f64>,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub flagged_severe: bool,
    #[serde(default)]
    pub should_regenerate: bool,
    #[serde(default)]
    pub evaluation_skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl EvaluationReport {
    /// Report for an evaluation that could not run; counts as success.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            scores: BTreeMap::new(),
            confidence: 0.0,
            reasons: Vec::new(),
            flagged_severe: false,
            should_regenerate: false,
            evaluation_skipped: true,
            skip_reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.passed || self.evaluation_skipped
    }

    /// Dimensions scoring under the failing threshold, sorted by name.
    pub fn failing_dimensions(&self) -> Vec<String> {
        self.scores
            .iter()
            .filter(|(_, score)| **score < FAILING_DIMENSION_THRESHOLD)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// One concrete problem/fix pair surfaced by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueFix {
    pub issue: String,
    pub fix: String,
}

/// Structured critique handed back to the planner for regeneration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFeedback {
    pub critique: String,
    pub failing_dimensions: Vec<String>,
    pub issues: Vec<IssueFix>,
}

impl PlanFeedback {
    pub fn from_report(report: &EvaluationReport) -> Self {
        Self {
            critique: report.reasons.join("; "),
            failing_dimensions: report.failing_dimensions(),
            issues: report
                .reasons
                .iter()
                .map(|reason| IssueFix {
                    issue: reason.clone(),
                    fix: format!("Address: {reason}"),
                })
                .collect(),
        }
    }
}

#[async_trait]
pub trait PlanEvaluator: Send + Sync {
    async fn evaluate_plan(
        &self,
        plan: &Plan,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError>;
}

#[async_trait]
pub trait RetrievalEvaluator: Send + Sync {
    async fn evaluate_retrieval(
        &self,
        query: &str,
        step_results: &[StepResult],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError>;
}

#[async_trait]
pub trait AnswerEvaluator: Send + Sync {
    async fn evaluate_answer(
        &self,
        query: &str,
        answer: &str,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError>;
}

const EVALUATION_SYSTEM_PROMPT: &str = r#"You are a strict research quality evaluator.

Score the material you are given on the named dimensions, each 0.0-1.0.
Respond with a single JSON object, no prose:
{
  "passed": <bool>,
  "scores": {"<dimension>": <0.0-1.0>},
  "confidence": <0.0-1.0>,
  "reasons": ["<only when something is wrong>"],
  "flagged_severe": <bool>,
  "should_regenerate": <bool>
}"#;

#[derive(Debug, Deserialize)]
struct RawVerdict {
    passed: bool,
    #[serde(default)]
    scores: BTreeMap<String, f64>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    flagged_severe: bool,
    #[serde(default)]
    should_regenerate: bool,
}

/// LLM-backed evaluator covering all three contracts with one JSON protocol.
pub struct LlmEvaluator {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
}

impl LlmEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, model: None }
    }

    /// Route verdicts through a larger model, typically `ESCALATION_MODEL`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    async fn verdict(
        &self,
        user: String,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError> {
        let messages = [
            ChatMessage::system(EVALUATION_SYSTEM_PROMPT),
            ChatMessage::user(user),
        ];
        let response = self
            .llm
            .chat(&messages, None, self.model.as_deref(), cancel)
            .await?;

        let block = extract_json_block(response.message.text())
            .ok_or_else(|| LlmError::InvalidResponse("no JSON object in verdict".to_string()))?;
        let raw: RawVerdict = serde_json::from_str(block)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(EvaluationReport {
            passed: raw.passed,
            scores: raw
                .scores
                .into_iter()
                .map(|(k, v)| (k, v.clamp(0.0, 1.0)))
                .collect(),
            confidence: raw.confidence.clamp(0.0, 1.0),
            reasons: raw.reasons,
            flagged_severe: raw.flagged_severe,
            should_regenerate: raw.should_regenerate,
            evaluation_skipped: false,
            skip_reason: None,
        })
    }
}

#[async_trait]
impl PlanEvaluator for LlmEvaluator {
    async fn evaluate_plan(
        &self,
        plan: &Plan,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError> {
        let user = format!(
            "Evaluate this research plan on dimensions: completeness, relevance, efficiency, ordering.\n\n\
             Query: {query}\n\n{}",
            plan.summary()
        );
        self.verdict(user, cancel).await
    }
}

#[async_trait]
impl RetrievalEvaluator for LlmEvaluator {
    async fn evaluate_retrieval(
        &self,
        query: &str,
        step_results: &[StepResult],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError> {
        let mut user = format!(
            "Evaluate these retrieval results on dimensions: relevance, diversity, sufficiency.\n\nQuery: {query}\n\n"
        );
        for result in step_results {
            user.push_str(&format!(
                "- {} [{}]: {}\n",
                result.tool_name,
                serde_json::to_string(&result.status).unwrap_or_default(),
                result
                    .output
                    .as_ref()
                    .map(|o| serde_json::to_string(o).unwrap_or_default())
                    .unwrap_or_else(|| "no output".to_string()),
            ));
        }
        self.verdict(user, cancel).await
    }
}

#[async_trait]
impl AnswerEvaluator for LlmEvaluator {
    async fn evaluate_answer(
        &self,
        query: &str,
        answer: &str,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Result<EvaluationReport, LlmError> {
        let mut user = format!(
            "Evaluate this answer on dimensions: accuracy, completeness, citation_support.\n\n\
             Query: {query}\n\nAnswer:\n{answer}\n\nSources:\n"
        );
        for source in sources {
            user.push_str(&format!("- {} ({})\n", source.title, source.url));
        }
        self.verdict(user, cancel).await
    }
}
