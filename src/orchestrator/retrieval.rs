//! Iterative retrieval and the agentic pipeline.
//!
//! Iterative retrieval loops search → synthesize → coverage analysis until
//! the coverage threshold is met, the analyzer has no more suggestions, or
//! the cycle cap is reached. The agentic pipeline composes decomposition,
//! iterative retrieval, and a reflection pass.

use super::{Orchestrator, is_retrieval_phase, new_session_id};
use crate::errors::OrchestratorError;
use crate::events::{EventType, LogEntry};
use crate::executor::{PhaseContext, PhaseExecutor, StepContext, StepExecutor};
use crate::extract::{Source, deduplicate_sources, extract_phase_output};
use crate::plan::{JsonMap, PhaseResult, PlanStatus, Step, StepType};
use crate::planner::{Planner, PlannerConfig};
use crate::reflect::ReflectionConfig;
use crate::store::{ResearchMetadata, ResearchResult};
use serde_json::json;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default cycle cap for the standalone iterative-retrieval entry point.
pub const DEFAULT_RETRIEVAL_CYCLES: u32 = 2;

/// What an iterative-retrieval run produced.
pub(super) struct RetrievalOutcome {
    pub answer: String,
    pub sources: Vec<Source>,
    pub cycles: u32,
    pub final_coverage: Option<f64>,
}

impl Orchestrator {
    /// Run a session as iterative retrieval cycles gated by coverage.
    pub async fn execute_with_iterative_retrieval(
        &self,
        query: &str,
        session_id: Option<String>,
        max_cycles: u32,
    ) -> Result<ResearchResult, OrchestratorError> {
        let session_id = session_id.unwrap_or_else(new_session_id);
        let cancel = CancellationToken::new();
        self.memory.initialize(&session_id, query).await;
        self.log
            .append(
                LogEntry::new(&session_id, EventType::SessionStarted)
                    .with_data("query", json!(query))
                    .with_data("mode", json!("iterative_retrieval")),
            )
            .await?;

        let started = Instant::now();
        let outcome = self
            .run_iterative_retrieval(query, &session_id, max_cycles, &cancel)
            .await;
        self.memory.cleanup(&session_id).await;

        match outcome {
            Ok(retrieval) => {
                let result = ResearchResult {
                    session_id: session_id.clone(),
                    plan_id: None,
                    query: query.to_string(),
                    answer: retrieval.answer,
                    sources: retrieval.sources,
                    metadata: ResearchMetadata {
                        total_execution_time_ms: started.elapsed().as_millis() as u64,
                        retrieval_cycles: Some(retrieval.cycles),
                        final_coverage: retrieval.final_coverage,
                        ..Default::default()
                    },
                    confidence: retrieval.final_coverage,
                };
                self.finish_session(result).await
            }
            Err(err) => {
                cancel.cancel();
                self.emit_session_failed(&session_id, &err).await?;
                Err(err)
            }
        }
    }

    /// Agentic pipeline: decompose, retrieve iteratively, then reflect.
    pub async fn orchestrate_agentic_research(
        &self,
        query: &str,
        session_id: Option<String>,
    ) -> Result<ResearchResult, OrchestratorError> {
        let session_id = session_id.unwrap_or_else(new_session_id);
        let cancel = CancellationToken::new();
        self.memory.initialize(&session_id, query).await;
        self.log
            .append(
                LogEntry::new(&session_id, EventType::SessionStarted)
                    .with_data("query", json!(query))
                    .with_data("mode", json!("agentic")),
            )
            .await?;

        let outcome = self.run_agentic(query, &session_id, &cancel).await;
        self.memory.cleanup(&session_id).await;

        match outcome {
            Ok(result) => self.finish_session(result).await,
            Err(err) => {
                cancel.cancel();
                self.emit_session_failed(&session_id, &err).await?;
                Err(err)
            }
        }
    }

    async fn run_agentic(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, OrchestratorError> {
        let decomposer =
            crate::decompose::QueryDecomposer::new(self.llm.clone(), self.log.clone());
        let decomposition = decomposer.decompose_query(query, session_id, cancel).await?;
        if let Some(memory) = self.memory.get(session_id).await {
            memory.write().await.set_scratch(
                "decomposition",
                serde_json::to_value(&decomposition).unwrap_or_default(),
            );
        }

        let started = Instant::now();
        let mut result = if decomposition.is_complex {
            self.run_decomposed(query, session_id, &decomposition, Some(1), cancel)
                .await?
        } else {
            let retrieval = self
                .run_iterative_retrieval(query, session_id, DEFAULT_RETRIEVAL_CYCLES, cancel)
                .await?;
            ResearchResult {
                session_id: session_id.to_string(),
                plan_id: None,
                query: query.to_string(),
                answer: retrieval.answer,
                sources: retrieval.sources,
                metadata: ResearchMetadata {
                    total_execution_time_ms: started.elapsed().as_millis() as u64,
                    retrieval_cycles: Some(retrieval.cycles),
                    final_coverage: retrieval.final_coverage,
                    ..Default::default()
                },
                confidence: retrieval.final_coverage,
            }
        };

        if let Some(reflector) = &self.reflector {
            let reflection_config = ReflectionConfig {
                max_iterations: 2,
                min_improvement_threshold: 0.05,
                quality_target_threshold: 0.85,
                timeout_per_iteration: self.config.reflection_iteration_timeout,
            };
            match reflector
                .reflect(query, &result.answer, &result.sources, &reflection_config, cancel)
                .await
            {
                Ok(outcome) => {
                    if let Some(final_answer) = outcome.final_answer {
                        result.answer = final_answer;
                    }
                    result.metadata.reflection_iterations = Some(outcome.iterations);
                    result.metadata.total_improvement = Some(outcome.total_improvement);
                }
                Err(err) => warn!(%err, "reflection failed; keeping unreflected answer"),
            }
        }
        result.metadata.used_agentic_pipeline = Some(true);
        Ok(result)
    }

    /// The retrieval loop itself. Cycle 1 executes a fresh plan's first
    /// retrieval phase; later cycles execute only the coverage analyzer's
    /// suggested retrievals.
    pub(super) async fn run_iterative_retrieval(
        &self,
        query: &str,
        session_id: &str,
        max_cycles: u32,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome, OrchestratorError> {
        let analyzer = self.coverage_analyzer();
        let phase_executor = PhaseExecutor::new(self.registry.clone(), self.log.clone());
        let step_executor = StepExecutor::new(self.registry.clone(), self.log.clone());

        let mut sources: Vec<Source> = Vec::new();
        let mut answer = String::new();
        let mut final_coverage: Option<f64> = None;
        let mut suggestions = Vec::new();
        let mut cycles = 0;

        for cycle in 1..=max_cycles {
            cycles = cycle;
            self.log
                .append(
                    LogEntry::new(session_id, EventType::RetrievalCycleStarted)
                        .with_data("cycle", json!(cycle)),
                )
                .await?;

            if cycle == 1 {
                let planner = Planner::new(
                    self.llm.clone(),
                    self.log.clone(),
                    &self.registry,
                    PlannerConfig::from_engine(&self.config),
                    session_id,
                );
                let mut plan = planner.create_plan(query, cancel).await?;
                plan.status = PlanStatus::Executing;

                let idx = plan
                    .phases
                    .iter()
                    .position(|p| is_retrieval_phase(&p.name))
                    .unwrap_or(0);
                let plan_id = plan.id.clone();
                let plan_query = plan.query.clone();
                let ctx = PhaseContext {
                    session_id,
                    plan_id: &plan_id,
                    plan_query: &plan_query,
                    accumulated: &[],
                    completion_reason: None,
                };
                let result = phase_executor
                    .execute(&mut plan.phases[idx], &ctx, cancel)
                    .await?;

                let (cycle_sources, output) =
                    extract_phase_output(&result, self.config.min_output_length);
                sources.extend(cycle_sources);
                if !output.is_empty() {
                    answer = output;
                }
            } else {
                let mut results = Vec::new();
                for suggestion in &suggestions {
                    let step = suggestion_step(suggestion, cycle);
                    let ctx = StepContext {
                        session_id,
                        plan_id: "retrieval",
                        phase_id: &step.phase_id,
                        plan_query: query,
                        prior_results: &[],
                    };
                    results.push(step_executor.execute(&step, &ctx, cancel).await?);
                }
                let (cycle_sources, _) = extract_phase_output(
                    &PhaseResult::completed(results),
                    self.config.min_output_length,
                );
                sources.extend(cycle_sources);
            }
            sources = deduplicate_sources(sources);

            match self
                .synthesize_from_sources(query, &answer, &sources, cancel)
                .await
            {
                Ok(synthesized) if !synthesized.is_empty() => answer = synthesized,
                Ok(_) => {}
                Err(err) => warn!(%err, "answer regeneration failed; keeping previous answer"),
            }

            let coverage = match analyzer
                .analyze_coverage(query, &answer, &sources, None, session_id, cancel)
                .await
            {
                Ok(coverage) => coverage,
                Err(err) => {
                    warn!(%err, "coverage analysis failed; ending retrieval");
                    self.log
                        .append(
                            LogEntry::new(session_id, EventType::RetrievalCycleCompleted)
                                .with_data("cycle", json!(cycle))
                                .with_data("termination_reason", json!("coverage_analysis_failed")),
                        )
                        .await?;
                    break;
                }
            };

            self.log
                .append(
                    LogEntry::new(session_id, EventType::CoverageChecked)
                        .with_data("cycle", json!(cycle))
                        .with_data("overall_coverage", json!(coverage.overall_coverage))
                        .with_data("is_complete", json!(coverage.is_complete)),
                )
                .await?;
            final_coverage = Some(coverage.overall_coverage);

            // Record open gaps in working memory for observers.
            if let Some(memory) = self.memory.get(session_id).await {
                let mut memory = memory.write().await;
                for aspect in &coverage.aspects_missing {
                    memory.add_gap(aspect.description.clone());
                }
            }

            let termination = if coverage.is_complete {
                Some("coverage_threshold_met")
            } else if coverage.suggested_retrievals.is_empty() {
                Some("no_suggestions")
            } else if cycle == max_cycles {
                Some("max_cycles_reached")
            } else {
                None
            };
            suggestions = coverage.suggested_retrievals;

            let mut completed = LogEntry::new(session_id, EventType::RetrievalCycleCompleted)
                .with_data("cycle", json!(cycle))
                .with_data("source_count", json!(sources.len()));
            if let Some(reason) = termination {
                completed = completed.with_data("termination_reason", json!(reason));
            }
            self.log.append(completed).await?;

            if let Some(reason) = termination {
                info!(cycle, reason, "iterative retrieval finished");
                break;
            }
        }

        Ok(RetrievalOutcome {
            answer,
            sources,
            cycles,
            final_coverage,
        })
    }
}

fn suggestion_step(suggestion: &crate::coverage::SuggestedRetrieval, cycle: u32) -> Step {
    let mut config = JsonMap::new();
    config.insert("query".to_string(), json!(suggestion.search_query));
    config.insert("max_results".to_string(), json!(5));
    Step::new(
        &format!("retrieval-cycle-{cycle}"),
        StepType::Search,
        "tavily_search",
        config,
        Vec::new(),
        0,
    )
}
