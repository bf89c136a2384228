//! Top-level session state machine.
//!
//! One `Orchestrator` serves many sessions. Each session runs
//! decompose → plan → evaluate → execute → (replan | recover) → persist,
//! with working memory initialized up front and cleaned up on both success
//! and failure paths. Every session ends with exactly one terminal event:
//! `session_completed` or `session_failed`.

mod decomposed;
mod retrieval;

use crate::config::EngineConfig;
use crate::coverage::CoverageAnalyzer;
use crate::decompose::QueryDecomposer;
use crate::errors::OrchestratorError;
use crate::evaluate::{AnswerEvaluator, PlanEvaluator, PlanFeedback, RetrievalEvaluator};
use crate::events::{EventType, LogEntry, LogStore};
use crate::executor::{PhaseContext, PhaseExecutor};
use crate::extract::{Source, deduplicate_sources, extract_phase_output};
use crate::llm::{ChatMessage, LlmClient};
use crate::memory::MemoryRegistry;
use crate::plan::{PhaseResult, PhaseStatus, Plan, PlanStatus, StepResult, StepStatus};
use crate::planner::{FailureContext, Planner, PlannerConfig, RecoveryKind};
use crate::reflect::Reflector;
use crate::store::{MemoryResultStore, PhaseTiming, ResearchMetadata, ResearchResult, ResultStore};
use crate::tools::ToolRegistry;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Phase names that look like retrieval work.
const RETRIEVAL_PHASE_MARKERS: [&str; 4] = ["search", "fetch", "gather", "retriev"];

/// Rounds of LLM-directed recovery per failed phase before giving up.
const MAX_RECOVERY_ROUNDS: u32 = 3;

pub(crate) fn is_retrieval_phase(name: &str) -> bool {
    let name = name.to_lowercase();
    RETRIEVAL_PHASE_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
}

/// The research orchestration engine.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    log: Arc<dyn LogStore>,
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryRegistry>,
    results: Arc<dyn ResultStore>,
    plan_evaluator: Option<Arc<dyn PlanEvaluator>>,
    retrieval_evaluator: Option<Arc<dyn RetrievalEvaluator>>,
    answer_evaluator: Option<Arc<dyn AnswerEvaluator>>,
    reflector: Option<Arc<dyn Reflector>>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        log: Arc<dyn LogStore>,
        registry: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            llm,
            log,
            registry,
            memory: Arc::new(MemoryRegistry::new()),
            results: Arc::new(MemoryResultStore::new()),
            plan_evaluator: None,
            retrieval_evaluator: None,
            answer_evaluator: None,
            reflector: None,
            config,
        }
    }

    pub fn with_result_store(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = results;
        self
    }

    pub fn with_plan_evaluator(mut self, evaluator: Arc<dyn PlanEvaluator>) -> Self {
        self.plan_evaluator = Some(evaluator);
        self
    }

    pub fn with_retrieval_evaluator(mut self, evaluator: Arc<dyn RetrievalEvaluator>) -> Self {
        self.retrieval_evaluator = Some(evaluator);
        self
    }

    pub fn with_answer_evaluator(mut self, evaluator: Arc<dyn AnswerEvaluator>) -> Self {
        self.answer_evaluator = Some(evaluator);
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn memory(&self) -> &Arc<MemoryRegistry> {
        &self.memory
    }

    pub fn result_store(&self) -> &Arc<dyn ResultStore> {
        &self.results
    }

    /// Run one research session end to end.
    pub async fn execute_research(
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
                    .with_data("query", json!(query)),
            )
            .await?;

        let outcome = self.run_session(query, &session_id, &cancel).await;
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

    async fn run_session(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, OrchestratorError> {
        let decomposer = QueryDecomposer::new(self.llm.clone(), self.log.clone());
        let decomposition = decomposer.decompose_query(query, session_id, cancel).await?;

        if let Some(memory) = self.memory.get(session_id).await {
            memory.write().await.set_scratch(
                "decomposition",
                serde_json::to_value(&decomposition).unwrap_or_default(),
            );
        }

        if decomposition.is_complex {
            self.run_decomposed(query, session_id, &decomposition, None, cancel)
                .await
        } else {
            self.run_simple(query, session_id, cancel).await
        }
    }

    /// Simple path: one plan, evaluated and executed phase by phase.
    async fn run_simple(
        &self,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, OrchestratorError> {
        self.derive_sub_goals(query, session_id).await;

        let planner = Planner::new(
            self.llm.clone(),
            self.log.clone(),
            &self.registry,
            PlannerConfig::from_engine(&self.config),
            session_id,
        );
        let mut plan = self
            .plan_with_evaluation(&planner, query, session_id, cancel)
            .await?;

        self.log
            .append(
                LogEntry::new(session_id, EventType::PlanCreated)
                    .with_plan(&plan.id)
                    .with_data("plan", serde_json::to_value(&plan).unwrap_or_default()),
            )
            .await?;
        plan.status = PlanStatus::Executing;

        let started = Instant::now();
        let phase_executor = PhaseExecutor::new(self.registry.clone(), self.log.clone());
        let mut accumulated: Vec<StepResult> = Vec::new();
        let mut sources: Vec<Source> = Vec::new();
        let mut final_output = String::new();
        let mut timings: Vec<PhaseTiming> = Vec::new();
        let mut retrieval_evaluated = false;

        let plan_id = plan.id.clone();
        let plan_query = plan.query.clone();

        let mut idx = 0;
        while idx < plan.phases.len() {
            if plan.phases[idx].status == PhaseStatus::Skipped {
                idx += 1;
                continue;
            }
            let phase_id = plan.phases[idx].id.clone();
            let phase_name = plan.phases[idx].name.clone();
            let phase_order = plan.phases[idx].order;
            let replan_checkpoint = plan.phases[idx].replan_checkpoint;

            if let Some(memory) = self.memory.get(session_id).await {
                memory.write().await.update_phase(&phase_name, phase_order);
            }

            let phase_started = Instant::now();
            let ctx = PhaseContext {
                session_id,
                plan_id: &plan_id,
                plan_query: &plan_query,
                accumulated: &accumulated,
                completion_reason: None,
            };
            let mut result = phase_executor
                .execute(&mut plan.phases[idx], &ctx, cancel)
                .await?;

            if result.status == PhaseStatus::Failed {
                result = self
                    .recover_phase(
                        &planner,
                        &mut plan,
                        idx,
                        result,
                        session_id,
                        &accumulated,
                        &phase_executor,
                        cancel,
                    )
                    .await?;
            }

            timings.push(PhaseTiming {
                phase: phase_name.clone(),
                execution_time_ms: phase_started.elapsed().as_millis() as u64,
            });
            accumulated.extend(result.step_results.iter().cloned());
            planner
                .set_phase_results(&phase_id, result.step_results.clone())
                .await;

            let (phase_sources, output) =
                extract_phase_output(&result, self.config.min_output_length);
            sources.extend(phase_sources);
            sources = deduplicate_sources(sources);
            if !output.is_empty() {
                final_output = output;
                if let Some(memory) = self.memory.get(session_id).await {
                    memory
                        .write()
                        .await
                        .add_gathered_info(format!("{phase_name}: output captured"));
                }
            }

            if is_retrieval_phase(&phase_name)
                && !retrieval_evaluated
                && result
                    .step_results
                    .iter()
                    .any(|r| r.output.as_ref().is_some_and(|o| o.has_items()))
            {
                retrieval_evaluated = true;
                self.run_retrieval_evaluation(query, &result.step_results, session_id, cancel)
                    .await;
            }

            if replan_checkpoint && result.status == PhaseStatus::Completed {
                let modified = planner
                    .replan(&mut plan, &phase_id, &result, None, cancel)
                    .await?;
                if modified && plan.phases[idx].has_pending_steps() {
                    let ctx = PhaseContext {
                        session_id,
                        plan_id: &plan_id,
                        plan_query: &plan_query,
                        accumulated: &accumulated,
                        completion_reason: Some("replan_execution"),
                    };
                    let rerun = phase_executor
                        .execute(&mut plan.phases[idx], &ctx, cancel)
                        .await?;
                    accumulated.extend(rerun.step_results.iter().cloned());
                    let mut merged = result.step_results.clone();
                    merged.extend(rerun.step_results.iter().cloned());
                    planner.set_phase_results(&phase_id, merged).await;

                    let (extra_sources, extra_output) =
                        extract_phase_output(&rerun, self.config.min_output_length);
                    sources.extend(extra_sources);
                    sources = deduplicate_sources(sources);
                    if !extra_output.is_empty() {
                        final_output = extra_output;
                    }
                }
            }

            idx += 1;
        }
        plan.status = PlanStatus::Completed;

        let confidence = self
            .run_answer_evaluation(query, &final_output, &sources, session_id, cancel)
            .await;

        Ok(ResearchResult {
            session_id: session_id.to_string(),
            plan_id: Some(plan_id),
            query: query.to_string(),
            answer: final_output,
            sources,
            metadata: ResearchMetadata {
                total_execution_time_ms: started.elapsed().as_millis() as u64,
                phases: timings,
                ..Default::default()
            },
            confidence,
        })
    }

    /// Plan, evaluating and regenerating up to the attempt cap.
    async fn plan_with_evaluation(
        &self,
        planner: &Planner,
        query: &str,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan, OrchestratorError> {
        let mut plan = planner.create_plan(query, cancel).await?;
        let Some(evaluator) = &self.plan_evaluator else {
            return Ok(plan);
        };

        for attempt in 1..=self.config.max_plan_attempts {
            self.log
                .append(
                    LogEntry::new(session_id, EventType::EvaluationStarted)
                        .with_plan(&plan.id)
                        .with_data("kind", json!("plan"))
                        .with_data("attempt", json!(attempt)),
                )
                .await?;

            let report = match evaluator.evaluate_plan(&plan, query, cancel).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(%err, "plan evaluation failed; proceeding as skipped");
                    self.log
                        .append(
                            LogEntry::new(session_id, EventType::EvaluationCompleted)
                                .with_plan(&plan.id)
                                .with_data("kind", json!("plan"))
                                .with_data("evaluation_skipped", json!(true))
                                .with_data("skip_reason", json!(err.to_string())),
                        )
                        .await?;
                    return Ok(plan);
                }
            };

            self.log
                .append(
                    LogEntry::new(session_id, EventType::EvaluationCompleted)
                        .with_plan(&plan.id)
                        .with_data("kind", json!("plan"))
                        .with_data("passed", json!(report.passed))
                        .with_data("confidence", json!(report.confidence))
                        .with_data(
                            "scores",
                            serde_json::to_value(&report.scores).unwrap_or_default(),
                        ),
                )
                .await?;

            if report.is_success() {
                return Ok(plan);
            }
            if attempt == self.config.max_plan_attempts {
                self.log
                    .append(
                        LogEntry::new(session_id, EventType::PlanEvaluationWarning)
                            .with_plan(&plan.id)
                            .with_data("attempts", json!(attempt))
                            .with_data("reasons", json!(report.reasons)),
                    )
                    .await?;
                return Ok(plan);
            }

            let feedback = PlanFeedback::from_report(&report);
            plan = planner
                .regenerate_plan_with_feedback(query, &feedback, cancel)
                .await?;
        }
        Ok(plan)
    }

    /// LLM-directed recovery loop for a failed phase. Returns the merged
    /// phase result once the phase completes, or an abort error.
    #[allow(clippy::too_many_arguments)]
    async fn recover_phase(
        &self,
        planner: &Planner,
        plan: &mut Plan,
        idx: usize,
        mut result: PhaseResult,
        session_id: &str,
        accumulated: &[StepResult],
        phase_executor: &PhaseExecutor,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, OrchestratorError> {
        let plan_id = plan.id.clone();
        let plan_query = plan.query.clone();

        for round in 1..=MAX_RECOVERY_ROUNDS {
            let Some(failed) = result.first_failed_step().cloned() else {
                return Ok(result);
            };
            if failed.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            let phase_id = plan.phases[idx].id.clone();
            let step = match plan.phases[idx].step(&failed.step_id) {
                Some(step) => step.clone(),
                None => break,
            };
            let failure = FailureContext {
                plan_id: plan_id.clone(),
                phase_id: phase_id.clone(),
                step,
                error: failed.error.clone().unwrap_or_else(|| {
                    crate::plan::StepError::new("step failed with no recorded error")
                }),
                attempts: round,
            };
            let decision = planner.decide_recovery(&failure, cancel).await?;
            info!(step = %failed.step_id, action = ?decision.action, "recovery decision");

            match decision.action {
                RecoveryKind::Abort => {
                    plan.status = PlanStatus::Failed;
                    return Err(OrchestratorError::Aborted {
                        session_id: session_id.to_string(),
                        reason: decision.reason,
                    });
                }
                RecoveryKind::Retry => {
                    if let Some(live) = plan.phases[idx].step_mut(&failed.step_id) {
                        if let Some(config) = decision
                            .modifications
                            .as_ref()
                            .and_then(|m| m.retry_with_config.clone())
                        {
                            live.config = config;
                        }
                        live.status = StepStatus::Pending;
                    }
                }
                RecoveryKind::Skip => {
                    if let Some(live) = plan.phases[idx].step_mut(&failed.step_id) {
                        live.status = StepStatus::Skipped;
                    }
                }
                RecoveryKind::Alternative => {
                    let phase = &mut plan.phases[idx];
                    phase.steps.retain(|s| s.id != failed.step_id);
                    for sibling in &mut phase.steps {
                        sibling.dependencies.retain(|dep| dep != &failed.step_id);
                    }
                    if let Some(modifications) = decision.modifications {
                        for alternative in modifications.alternative_steps {
                            phase.steps.push(alternative);
                        }
                    }
                }
            }

            let ctx = PhaseContext {
                session_id,
                plan_id: &plan_id,
                plan_query: &plan_query,
                accumulated,
                completion_reason: None,
            };
            let rerun = phase_executor
                .execute(&mut plan.phases[idx], &ctx, cancel)
                .await?;

            let mut merged: Vec<StepResult> = result
                .step_results
                .iter()
                .filter(|r| !r.is_failed())
                .cloned()
                .collect();
            merged.extend(rerun.step_results.iter().cloned());
            result = PhaseResult {
                status: rerun.status,
                step_results: merged,
                error: rerun.error,
            };
            if result.status == PhaseStatus::Completed {
                return Ok(result);
            }
        }

        plan.status = PlanStatus::Failed;
        Err(OrchestratorError::Aborted {
            session_id: session_id.to_string(),
            reason: format!(
                "phase '{}' still failing after {MAX_RECOVERY_ROUNDS} recovery rounds",
                plan.phases[idx].name
            ),
        })
    }

    /// Best-effort retrieval evaluation; errors are swallowed.
    async fn run_retrieval_evaluation(
        &self,
        query: &str,
        step_results: &[StepResult],
        session_id: &str,
        cancel: &CancellationToken,
    ) {
        let Some(evaluator) = &self.retrieval_evaluator else {
            return;
        };
        let started = self
            .log
            .append(
                LogEntry::new(session_id, EventType::EvaluationStarted)
                    .with_data("kind", json!("retrieval")),
            )
            .await;
        if started.is_err() {
            return;
        }

        let entry = match evaluator.evaluate_retrieval(query, step_results, cancel).await {
            Ok(report) => LogEntry::new(session_id, EventType::EvaluationCompleted)
                .with_data("kind", json!("retrieval"))
                .with_data("passed", json!(report.passed))
                .with_data("confidence", json!(report.confidence)),
            Err(err) => {
                warn!(%err, "retrieval evaluation failed; proceeding as skipped");
                LogEntry::new(session_id, EventType::EvaluationCompleted)
                    .with_data("kind", json!("retrieval"))
                    .with_data("evaluation_skipped", json!(true))
                    .with_data("skip_reason", json!(err.to_string()))
            }
        };
        if let Err(err) = self.log.append(entry).await {
            warn!(%err, "failed to record retrieval evaluation");
        }
    }

    /// Best-effort answer evaluation; returns the verdict confidence.
    async fn run_answer_evaluation(
        &self,
        query: &str,
        answer: &str,
        sources: &[Source],
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Option<f64> {
        let evaluator = self.answer_evaluator.as_ref()?;
        self.log
            .append(
                LogEntry::new(session_id, EventType::EvaluationStarted)
                    .with_data("kind", json!("answer")),
            )
            .await
            .ok()?;

        match evaluator.evaluate_answer(query, answer, sources, cancel).await {
            Ok(report) => {
                let entry = LogEntry::new(session_id, EventType::EvaluationCompleted)
                    .with_data("kind", json!("answer"))
                    .with_data("passed", json!(report.passed))
                    .with_data("confidence", json!(report.confidence));
                if let Err(err) = self.log.append(entry).await {
                    warn!(%err, "failed to record answer evaluation");
                }
                Some(report.confidence)
            }
            Err(err) => {
                warn!(%err, "answer evaluation failed; proceeding as skipped");
                let entry = LogEntry::new(session_id, EventType::EvaluationCompleted)
                    .with_data("kind", json!("answer"))
                    .with_data("evaluation_skipped", json!(true))
                    .with_data("skip_reason", json!(err.to_string()));
                if let Err(err) = self.log.append(entry).await {
                    warn!(%err, "failed to record answer evaluation");
                }
                None
            }
        }
    }

    /// Keyword-derived sub-goals for the simple path.
    async fn derive_sub_goals(&self, query: &str, session_id: &str) {
        let Some(memory) = self.memory.get(session_id).await else {
            return;
        };
        let lowered = query.to_lowercase();
        let mut memory = memory.write().await;

        let mut matched = false;
        if ["compare", "difference", " vs"]
            .iter()
            .any(|k| lowered.contains(k))
        {
            memory.add_sub_goal("Compare the subjects named in the query", "Compare");
            matched = true;
        }
        if ["how", "explain", "what is"]
            .iter()
            .any(|k| lowered.contains(k))
        {
            memory.add_sub_goal("Explain the core concept", "Explain");
            matched = true;
        }
        if ["when", "date", "year"].iter().any(|k| lowered.contains(k)) {
            memory.add_sub_goal("Establish the timeline", "Temporal");
            matched = true;
        }
        if ["why", "reason"].iter().any(|k| lowered.contains(k)) {
            memory.add_sub_goal("Identify causes and reasons", "Causal");
            matched = true;
        }
        if ["where", "location"].iter().any(|k| lowered.contains(k)) {
            memory.add_sub_goal("Pin down the relevant locations", "Location");
            matched = true;
        }
        if !matched {
            memory.add_sub_goal("Cover the query comprehensively", "Comprehensive");
        }
    }

    /// One synthesis turn over the accumulated sources and draft answer.
    pub(crate) async fn synthesize_from_sources(
        &self,
        query: &str,
        draft: &str,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Result<String, crate::errors::LlmError> {
        let mut user = format!("Query: {query}\n");
        if !draft.is_empty() {
            user.push_str(&format!("\nDraft answer:\n{draft}\n"));
        }
        user.push_str("\nSources:\n");
        for source in sources {
            user.push_str(&format!("- {} ({})\n", source.title, source.url));
        }
        user.push_str("\nWrite the best answer supported by these sources, citing them.");

        let messages = [
            ChatMessage::system("You are a research assistant. Produce a clear, well-cited answer."),
            ChatMessage::user(user),
        ];
        let response = self
            .llm
            .chat(&messages, None, self.config.model.as_deref(), cancel)
            .await?;
        Ok(response.message.text().to_string())
    }

    /// Persist the result and emit the success terminal event. Persistence
    /// failures are logged but do not fail the session.
    async fn finish_session(
        &self,
        result: ResearchResult,
    ) -> Result<ResearchResult, OrchestratorError> {
        if let Err(err) = self.results.save(&result).await {
            warn!(%err, session = %result.session_id, "failed to persist research result");
        }
        self.log
            .append(
                LogEntry::new(&result.session_id, EventType::SessionCompleted)
                    .with_data("answer_length", json!(result.answer.len()))
                    .with_data("source_count", json!(result.sources.len())),
            )
            .await?;
        debug!(session = %result.session_id, "session completed");
        Ok(result)
    }

    async fn emit_session_failed(
        &self,
        session_id: &str,
        err: &OrchestratorError,
    ) -> Result<(), OrchestratorError> {
        self.log
            .append(
                LogEntry::new(session_id, EventType::SessionFailed)
                    .with_data("error", json!(err.to_string())),
            )
            .await?;
        Ok(())
    }

    pub(crate) fn coverage_analyzer(&self) -> CoverageAnalyzer {
        let analyzer = CoverageAnalyzer::new(self.llm.clone(), self.log.clone())
            .with_thresholds(self.config.min_confidence, self.config.coverage_threshold);
        match &self.config.escalation_model {
            Some(model) => analyzer.with_model(model.clone()),
            None => analyzer,
        }
    }
}

fn new_session_id() -> String {
    format!("session-{}", Uuid::new_v4())
}
