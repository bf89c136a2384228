//! Decomposed path: execute a sub-query DAG wave by wave, then synthesize
//! one answer from the per-sub-query results.
//!
//! Sub-queries run as isolated nested researches with their own working
//! memory slot and planner. Failures are non-fatal: a failed sub-query
//! records a partial answer and later waves still run.

use super::Orchestrator;
use crate::decompose::{DecompositionResult, SubQuery};
use crate::errors::OrchestratorError;
use crate::events::{EventType, LogEntry};
use crate::executor::{PhaseContext, PhaseExecutor};
use crate::extract::{deduplicate_sources, extract_phase_output};
use crate::llm::ChatMessage;
use crate::plan::{PhaseStatus, PlanStatus, StepResult};
use crate::planner::{Planner, PlannerConfig};
use crate::store::{ResearchMetadata, ResearchResult, SubQueryOutcome};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Per-dependency answer prefix carried into a dependent sub-query.
const DEPENDENCY_CONTEXT_CHARS: usize = 500;

impl Orchestrator {
    /// Execute a complex query's sub-query DAG and synthesize the answer.
    ///
    /// `sub_query_retrieval_cycles` switches each sub-query from a plain
    /// nested plan execution to iterative retrieval with that cycle cap
    /// (the agentic pipeline uses 1).
    pub(super) async fn run_decomposed(
        &self,
        query: &str,
        session_id: &str,
        decomposition: &DecompositionResult,
        sub_query_retrieval_cycles: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, OrchestratorError> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_subqueries));
        let mut outcomes: HashMap<String, SubQueryOutcome> = HashMap::new();

        for wave in &decomposition.execution_plan {
            let snapshot = outcomes.clone();
            let wave_outcomes = join_all(
                wave.iter()
                    .filter_map(|id| decomposition.sub_query(id))
                    .map(|sub_query| {
                        let semaphore = semaphore.clone();
                        let snapshot = &snapshot;
                        async move {
                            let _permit =
                                semaphore.acquire().await.expect("semaphore never closed");
                            let outcome = self
                                .execute_sub_query(
                                    session_id,
                                    sub_query,
                                    snapshot,
                                    sub_query_retrieval_cycles,
                                    cancel,
                                )
                                .await;
                            (sub_query.id.clone(), outcome)
                        }
                    }),
            )
            .await;

            for (id, outcome) in wave_outcomes {
                outcomes.insert(id, outcome);
            }
        }

        let (answer, _) = self
            .final_synthesis(query, session_id, decomposition, &outcomes, cancel)
            .await?;

        let mut sources = Vec::new();
        for outcome in outcomes.values() {
            sources.extend(outcome.sources.iter().cloned());
        }
        let sources = deduplicate_sources(sources);

        Ok(ResearchResult {
            session_id: session_id.to_string(),
            plan_id: None,
            query: query.to_string(),
            answer,
            sources,
            metadata: ResearchMetadata {
                total_execution_time_ms: started.elapsed().as_millis() as u64,
                decomposition: Some(decomposition.clone()),
                sub_query_results: Some(outcomes),
                ..Default::default()
            },
            confidence: None,
        })
    }

    /// Run one sub-query as an isolated nested research. Never fails the
    /// parent: errors become a partial outcome.
    async fn execute_sub_query(
        &self,
        parent_session: &str,
        sub_query: &SubQuery,
        prior: &HashMap<String, SubQueryOutcome>,
        retrieval_cycles: Option<u32>,
        cancel: &CancellationToken,
    ) -> SubQueryOutcome {
        if let Err(err) = self
            .log
            .append(
                LogEntry::new(parent_session, EventType::SubQueryExecutionStarted)
                    .with_data("sub_query_id", json!(sub_query.id))
                    .with_data("text", json!(sub_query.text)),
            )
            .await
        {
            warn!(%err, "failed to record sub-query start");
        }

        let nested_session = format!("{parent_session}:{}", sub_query.id);
        self.memory.initialize(&nested_session, &sub_query.text).await;
        let run = self
            .run_sub_query(sub_query, prior, &nested_session, retrieval_cycles, cancel)
            .await;
        self.memory.cleanup(&nested_session).await;

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(sub_query = %sub_query.id, %err, "sub-query failed; recording partial result");
                SubQueryOutcome {
                    answer: format!("Failed to answer: {err}"),
                    sources: Vec::new(),
                    confidence: None,
                }
            }
        };

        if let Err(err) = self
            .log
            .append(
                LogEntry::new(parent_session, EventType::SubQueryExecutionCompleted)
                    .with_data("sub_query_id", json!(sub_query.id))
                    .with_data("answer_length", json!(outcome.answer.len()))
                    .with_data("source_count", json!(outcome.sources.len())),
            )
            .await
        {
            warn!(%err, "failed to record sub-query completion");
        }
        outcome
    }

    async fn run_sub_query(
        &self,
        sub_query: &SubQuery,
        prior: &HashMap<String, SubQueryOutcome>,
        nested_session: &str,
        retrieval_cycles: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<SubQueryOutcome, OrchestratorError> {
        let enriched = enrich_with_dependencies(sub_query, prior);

        if let Some(max_cycles) = retrieval_cycles {
            let retrieval = self
                .run_iterative_retrieval(&enriched, nested_session, max_cycles, cancel)
                .await?;
            return Ok(SubQueryOutcome {
                answer: retrieval.answer,
                sources: retrieval.sources,
                confidence: retrieval.final_coverage,
            });
        }

        // Plain nested execution: fresh plan, sequential phases, no replan
        // or evaluation machinery.
        let planner = Planner::new(
            self.llm.clone(),
            self.log.clone(),
            &self.registry,
            PlannerConfig::from_engine(&self.config),
            nested_session,
        );
        let mut plan = planner.create_plan(&enriched, cancel).await?;
        plan.status = PlanStatus::Executing;

        let phase_executor = PhaseExecutor::new(self.registry.clone(), self.log.clone());
        let plan_id = plan.id.clone();
        let plan_query = plan.query.clone();
        let mut accumulated: Vec<StepResult> = Vec::new();
        let mut sources = Vec::new();
        let mut answer = String::new();

        for idx in 0..plan.phases.len() {
            if plan.phases[idx].status == PhaseStatus::Skipped {
                continue;
            }
            let ctx = PhaseContext {
                session_id: nested_session,
                plan_id: &plan_id,
                plan_query: &plan_query,
                accumulated: &accumulated,
                completion_reason: None,
            };
            let result = phase_executor
                .execute(&mut plan.phases[idx], &ctx, cancel)
                .await?;

            accumulated.extend(result.step_results.iter().cloned());
            let (phase_sources, output) =
                extract_phase_output(&result, self.config.min_output_length);
            sources.extend(phase_sources);
            if !output.is_empty() {
                answer = output;
            }

            if result.status == PhaseStatus::Failed {
                return Err(OrchestratorError::Aborted {
                    session_id: nested_session.to_string(),
                    reason: result
                        .error
                        .unwrap_or_else(|| "phase failed".to_string()),
                });
            }
        }

        Ok(SubQueryOutcome {
            answer,
            sources: deduplicate_sources(sources),
            confidence: None,
        })
    }

    /// One LLM call combining all sub-query answers; falls back to
    /// concatenation when the call fails. Returns `(answer, used_fallback)`.
    async fn final_synthesis(
        &self,
        query: &str,
        session_id: &str,
        decomposition: &DecompositionResult,
        outcomes: &HashMap<String, SubQueryOutcome>,
        cancel: &CancellationToken,
    ) -> Result<(String, bool), OrchestratorError> {
        self.log
            .append(
                LogEntry::new(session_id, EventType::FinalSynthesisStarted)
                    .with_data("sub_query_count", json!(outcomes.len())),
            )
            .await?;

        let mut pairs = String::new();
        for sub_query in &decomposition.sub_queries {
            if let Some(outcome) = outcomes.get(&sub_query.id) {
                pairs.push_str(&format!(
                    "Question: {}\nAnswer: {}\n\n",
                    sub_query.text, outcome.answer
                ));
            }
        }

        let messages = [
            ChatMessage::system(
                "You are a research assistant. Combine the sub-answers into one \
                 coherent, well-structured answer to the original query.",
            ),
            ChatMessage::user(format!("Original query: {query}\n\n{pairs}")),
        ];
        let (answer, used_fallback) = match self
            .llm
            .chat(&messages, None, self.config.model.as_deref(), cancel)
            .await
        {
            Ok(response) if !response.message.text().is_empty() => {
                (response.message.text().to_string(), false)
            }
            Ok(_) => (fallback_concat(decomposition, outcomes), true),
            Err(err) => {
                warn!(%err, "final synthesis failed; concatenating sub-answers");
                (fallback_concat(decomposition, outcomes), true)
            }
        };

        self.log
            .append(
                LogEntry::new(session_id, EventType::FinalSynthesisCompleted)
                    .with_data("answer_length", json!(answer.len()))
                    .with_data("fallback", json!(used_fallback)),
            )
            .await?;
        Ok((answer, used_fallback))
    }
}

fn enrich_with_dependencies(
    sub_query: &SubQuery,
    prior: &HashMap<String, SubQueryOutcome>,
) -> String {
    let mut enriched = sub_query.text.clone();
    for dep in &sub_query.dependencies {
        if let Some(outcome) = prior.get(dep) {
            let prefix: String = outcome.answer.chars().take(DEPENDENCY_CONTEXT_CHARS).collect();
            if !prefix.is_empty() {
                enriched.push_str(&format!("\n\nContext from an earlier finding: {prefix}"));
            }
        }
    }
    enriched
}

fn fallback_concat(
    decomposition: &DecompositionResult,
    outcomes: &HashMap<String, SubQueryOutcome>,
) -> String {
    let mut answer = String::new();
    for sub_query in &decomposition.sub_queries {
        if let Some(outcome) = outcomes.get(&sub_query.id) {
            answer.push_str(&format!("**{}**\n{}\n\n", sub_query.text, outcome.answer));
        }
    }
    answer.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::{Priority, SubQueryType};
    use crate::extract::{Relevance, Source};

    fn sq(id: &str, text: &str, deps: Vec<&str>) -> SubQuery {
        SubQuery {
            id: id.to_string(),
            text: text.to_string(),
            order: 0,
            dependencies: deps.into_iter().map(String::from).collect(),
            query_type: SubQueryType::Factual,
            priority: Priority::Medium,
            estimated_complexity: 2,
        }
    }

    fn outcome(answer: &str) -> SubQueryOutcome {
        SubQueryOutcome {
            answer: answer.to_string(),
            sources: vec![Source {
                url: "https://a.example".to_string(),
                title: "A".to_string(),
                relevance: Relevance::High,
            }],
            confidence: None,
        }
    }

    #[test]
    fn dependency_context_is_truncated_to_prefix() {
        let long_answer = "x".repeat(2_000);
        let mut prior = HashMap::new();
        prior.insert("sq-dep".to_string(), outcome(&long_answer));

        let enriched = enrich_with_dependencies(&sq("sq-1", "compare them", vec!["sq-dep"]), &prior);
        assert!(enriched.starts_with("compare them"));
        assert!(enriched.len() < 600);
        assert!(enriched.contains("Context from an earlier finding"));
    }

    #[test]
    fn missing_dependency_outcome_adds_no_context() {
        let prior = HashMap::new();
        let enriched = enrich_with_dependencies(&sq("sq-1", "question", vec!["sq-ghost"]), &prior);
        assert_eq!(enriched, "question");
    }

    #[test]
    fn fallback_concatenates_in_sub_query_order() {
        let decomposition = DecompositionResult {
            original_query: "q".to_string(),
            is_complex: true,
            reasoning: String::new(),
            sub_queries: vec![sq("sq-a", "first question", vec![]), sq("sq-b", "second question", vec![])],
            execution_plan: vec![vec!["sq-a".to_string(), "sq-b".to_string()]],
        };
        let mut outcomes = HashMap::new();
        outcomes.insert("sq-b".to_string(), outcome("second answer"));
        outcomes.insert("sq-a".to_string(), outcome("first answer"));

        let combined = fallback_concat(&decomposition, &outcomes);
        let first = combined.find("first question").unwrap();
        let second = combined.find("second question").unwrap();
        assert!(first < second);
        assert!(combined.contains("**first question**\nfirst answer"));
    }
}
