//! LLM-driven planner: builds and mutates plans through a closed tool-call
//! protocol, reviews them at replan checkpoints, and authors recovery
//! decisions for failed steps.

pub mod catalog;
pub mod handlers;

use crate::config::EngineConfig;
use crate::errors::PlannerError;
use crate::events::{EventType, LogEntry, LogStore};
use crate::llm::{ChatMessage, LlmClient};
use crate::plan::{
    JsonMap, PhaseResult, PhaseStatus, Plan, PlanStatus, Step, StepError, StepResult, StepType,
};
use crate::tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use catalog::{PlanningAction, RecoveryAction, planning_tools, recovery_tools};
pub use handlers::{HandlerReply, PlanState, ensure_synthesis_phase, validate_tool_config};

/// Planner tuning, usually derived from the engine config.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub max_iterations: u32,
    pub create_plan_max_attempts: u32,
    pub finalize_auto_recovery_threshold: u32,
    pub model: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            create_plan_max_attempts: 3,
            finalize_auto_recovery_threshold: 2,
            model: None,
        }
    }
}

impl PlannerConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_iterations: config.planner_max_iterations,
            create_plan_max_attempts: config.create_plan_max_attempts,
            finalize_auto_recovery_threshold: config.finalize_auto_recovery_threshold,
            model: config.model.clone(),
        }
    }
}

/// What to do about a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    Retry,
    Skip,
    Alternative,
    Abort,
}

/// Optional payload accompanying a recovery decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryModifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_with_config: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_steps: Vec<Step>,
}

/// LLM-authored recovery decision for one failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub action: RecoveryKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifications: Option<RecoveryModifications>,
}

/// Everything the planner needs to reason about a step failure.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub plan_id: String,
    pub phase_id: String,
    pub step: Step,
    pub error: StepError,
    pub attempts: u32,
}

fn planning_system_prompt(available_tools: &[String]) -> String {
    format!(
        r#"You are a research planner. Build an execution plan for the query using the planning tools.

Rules:
- Call create_plan first, then add_phase for each stage, then add_step for the work in each phase.
- Every phase must contain at least one step before finalize_plan will succeed.
- Steps may depend on earlier steps in the same phase via depends_on; independent steps run concurrently.
- Mark a phase with replan_checkpoint when its results should trigger a plan review.
- End with a synthesis phase that produces the final answer.
- When the plan is complete, call finalize_plan.

Execution tools available for steps: {}"#,
        available_tools.join(", ")
    )
}

const REPLAN_SYSTEM_PROMPT: &str = r#"You are reviewing a research plan mid-execution. A phase just finished; decide whether the remaining plan still fits what was learned.

Use the planning tools to adjust the plan: add steps to close gaps, remove or modify steps that are no longer useful, skip phases that became redundant, or insert new phases. If the plan is fine as is, call get_plan_status and stop. Do not call finalize_plan."#;

const RECOVERY_SYSTEM_PROMPT: &str = r#"A research step failed. Decide how to recover by calling exactly one recovery tool:
- retry_step when the failure looks transient (optionally with a modified config)
- skip_step when the step is not essential to answering the query
- replace_step when a different tool or query would work better
- abort_plan only when the failure makes the whole plan unworkable"#;

const CONTINUE_NUDGE: &str =
    "Continue building the plan with the planning tools. Call finalize_plan once every phase has its steps.";

/// The planner owns one session's plan state. Create one per session.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    log: Arc<dyn LogStore>,
    config: PlannerConfig,
    session_id: String,
    available_tools: Vec<String>,
    state: Mutex<PlanState>,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        log: Arc<dyn LogStore>,
        registry: &ToolRegistry,
        config: PlannerConfig,
        session_id: impl Into<String>,
    ) -> Self {
        let available_tools = registry.tool_names();
        let state = PlanState::new(
            available_tools.clone(),
            config.create_plan_max_attempts,
            config.finalize_auto_recovery_threshold,
        );
        Self {
            llm,
            log,
            config,
            session_id: session_id.into(),
            available_tools,
            state: Mutex::new(state),
        }
    }

    /// Build a fresh plan for a query.
    pub async fn create_plan(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Plan, PlannerError> {
        self.log
            .append(
                LogEntry::new(&self.session_id, EventType::PlanningStarted)
                    .with_data("query", json!(query))
                    .with_data("available_tools", json!(self.available_tools)),
            )
            .await?;
        self.state.lock().await.reset_for_new_plan();

        let transcript = vec![
            ChatMessage::system(planning_system_prompt(&self.available_tools)),
            ChatMessage::user(format!("Build a research plan for this query: {query}")),
        ];
        self.run_planning_loop(transcript, cancel).await
    }

    /// Rebuild the plan after a failed evaluation, feeding the critique back
    /// into the transcript.
    pub async fn regenerate_plan_with_feedback(
        &self,
        query: &str,
        feedback: &crate::evaluate::PlanFeedback,
        cancel: &CancellationToken,
    ) -> Result<Plan, PlannerError> {
        self.log
            .append(
                LogEntry::new(&self.session_id, EventType::PlanRegenerationStarted)
                    .with_data("failing_dimensions", json!(feedback.failing_dimensions))
                    .with_data("critique", json!(feedback.critique)),
            )
            .await?;
        self.state.lock().await.reset_for_new_plan();

        let feedback_json = serde_json::to_string_pretty(feedback).unwrap_or_default();
        let transcript = vec![
            ChatMessage::system(planning_system_prompt(&self.available_tools)),
            ChatMessage::user(format!(
                "Build a research plan for this query: {query}\n\n\
                 A previous plan failed evaluation. Address this critique:\n{feedback_json}"
            )),
        ];
        self.run_planning_loop(transcript, cancel).await
    }

    /// Side-channel: record a completed phase's results so replan turns can
    /// consult them via `get_phase_results`.
    pub async fn set_phase_results(&self, phase_id: &str, results: Vec<StepResult>) {
        self.state.lock().await.set_phase_results(phase_id, results);
    }

    /// One plan-review turn after a checkpoint phase or a failure. Returns
    /// whether the plan was modified.
    pub async fn replan(
        &self,
        plan: &mut Plan,
        completed_phase_id: &str,
        phase_result: &PhaseResult,
        failure_info: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool, PlannerError> {
        self.log
            .append(
                LogEntry::new(&self.session_id, EventType::ReplanTriggered)
                    .with_plan(&plan.id)
                    .with_phase(completed_phase_id)
                    .with_data("failure", json!(failure_info)),
            )
            .await?;

        let transcript = vec![
            ChatMessage::system(REPLAN_SYSTEM_PROMPT),
            ChatMessage::user(replan_briefing(
                plan,
                completed_phase_id,
                phase_result,
                failure_info,
            )),
        ];

        plan.status = PlanStatus::Replanning;
        // Reacquire the plan for the duration of this turn.
        self.state.lock().await.install_plan(plan.clone());

        let tools = planning_tools();
        let response = self
            .llm
            .chat(&transcript, Some(&tools), self.config.model.as_deref(), cancel)
            .await?;

        let mut modified = false;
        for call in response.calls() {
            match catalog::parse_planning_action(call) {
                Ok(action) => {
                    let reply = {
                        let mut state = self.state.lock().await;
                        state.apply(action)?
                    };
                    self.emit_pending(&reply.events).await?;
                    if reply.mutated {
                        modified = true;
                    }
                    if reply.is_error() {
                        debug!(payload = %reply.payload, "replan tool-call rejected");
                    }
                }
                Err(message) => warn!(%message, "unparseable replan tool-call"),
            }
        }

        if let Some(updated) = self.state.lock().await.take_plan() {
            *plan = updated;
        }
        plan.status = PlanStatus::Executing;

        self.log
            .append(
                LogEntry::new(&self.session_id, EventType::ReplanCompleted)
                    .with_plan(&plan.id)
                    .with_phase(completed_phase_id)
                    .with_data("modified", json!(modified)),
            )
            .await?;
        Ok(modified)
    }

    /// One recovery turn for a failed step.
    pub async fn decide_recovery(
        &self,
        failure: &FailureContext,
        cancel: &CancellationToken,
    ) -> Result<RecoveryDecision, PlannerError> {
        let transcript = vec![
            ChatMessage::system(RECOVERY_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Step '{}' (tool '{}') failed.\nConfig: {}\nError: {}\nPrior attempts: {}\n\n\
                 Choose one recovery tool.",
                failure.step.id,
                failure.step.tool_name,
                Value::Object(failure.step.config.clone()),
                failure.error.message,
                failure.attempts,
            )),
        ];

        let tools = recovery_tools();
        let response = self
            .llm
            .chat(&transcript, Some(&tools), self.config.model.as_deref(), cancel)
            .await?;

        for call in response.calls() {
            match catalog::parse_recovery_action(call) {
                Ok(action) => return Ok(self.map_recovery(action, failure)),
                Err(message) => warn!(%message, "unparseable recovery tool-call"),
            }
        }
        Ok(RecoveryDecision {
            action: RecoveryKind::Abort,
            reason: "No recovery decision made by planner".to_string(),
            modifications: None,
        })
    }

    fn map_recovery(&self, action: RecoveryAction, failure: &FailureContext) -> RecoveryDecision {
        match action {
            RecoveryAction::RetryStep {
                reason,
                modified_config,
                ..
            } => RecoveryDecision {
                action: RecoveryKind::Retry,
                reason: reason.unwrap_or_else(|| "retry".to_string()),
                modifications: modified_config.map(|config| RecoveryModifications {
                    retry_with_config: Some(config),
                    alternative_steps: Vec::new(),
                }),
            },
            RecoveryAction::SkipStep { reason, .. } => RecoveryDecision {
                action: RecoveryKind::Skip,
                reason: reason.unwrap_or_else(|| "skip".to_string()),
                modifications: None,
            },
            RecoveryAction::ReplaceStep {
                alternative_tool_name,
                alternative_config,
                reason,
                ..
            } => {
                let step_type = match alternative_tool_name.as_str() {
                    "tavily_search" | "web_search" => StepType::Search,
                    "web_fetch" => StepType::Fetch,
                    name if name.contains("synth") => StepType::Llm,
                    _ => StepType::ToolCall,
                };
                let replacement = Step::new(
                    &failure.phase_id,
                    step_type,
                    &alternative_tool_name,
                    alternative_config,
                    Vec::new(),
                    failure.step.order,
                );
                RecoveryDecision {
                    action: RecoveryKind::Alternative,
                    reason: reason.unwrap_or_else(|| "replace".to_string()),
                    modifications: Some(RecoveryModifications {
                        retry_with_config: None,
                        alternative_steps: vec![replacement],
                    }),
                }
            }
            RecoveryAction::AbortPlan { reason } => RecoveryDecision {
                action: RecoveryKind::Abort,
                reason: reason.unwrap_or_else(|| "abort".to_string()),
                modifications: None,
            },
        }
    }

    async fn run_planning_loop(
        &self,
        mut transcript: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<Plan, PlannerError> {
        let tools = planning_tools();
        let mut finalized = false;

        for iteration in 0..self.config.max_iterations {
            self.log
                .append(
                    LogEntry::new(&self.session_id, EventType::PlanningIteration)
                        .with_data("iteration", json!(iteration)),
                )
                .await?;

            let response = self
                .llm
                .chat(&transcript, Some(&tools), self.config.model.as_deref(), cancel)
                .await?;

            let calls = response.calls().to_vec();
            transcript.push(response.message.clone());

            if calls.is_empty() {
                transcript.push(ChatMessage::user(CONTINUE_NUDGE));
                continue;
            }

            for call in &calls {
                let payload = match catalog::parse_planning_action(call) {
                    Ok(action) => {
                        let reply = {
                            let mut state = self.state.lock().await;
                            state.apply(action)?
                        };
                        self.emit_pending(&reply.events).await?;
                        if reply.finalized && !reply.is_error() {
                            finalized = true;
                        }
                        reply.payload
                    }
                    Err(message) => json!({"error": message}),
                };
                transcript.push(ChatMessage::tool_result(
                    &call.id,
                    serde_json::to_string(&payload).unwrap_or_default(),
                ));
            }

            if finalized {
                break;
            }
        }

        let mut plan = self
            .state
            .lock()
            .await
            .take_plan()
            .ok_or(PlannerError::NoPlanCreated)?;

        if ensure_synthesis_phase(&mut plan) {
            let synthesis = plan.phases.last().expect("just appended");
            self.log
                .append(
                    LogEntry::new(&self.session_id, EventType::SynthesisPhaseAutoAdded)
                        .with_plan(&plan.id)
                        .with_phase(&synthesis.id)
                        .with_data("name", json!(synthesis.name)),
                )
                .await?;
        }
        debug!(plan_id = %plan.id, phases = plan.phases.len(), finalized, "planning loop done");
        Ok(plan)
    }

    async fn emit_pending(&self, events: &[handlers::PendingEvent]) -> Result<(), PlannerError> {
        let plan_id = self.state.lock().await.plan_id();
        for pending in events {
            let mut entry = LogEntry::new(&self.session_id, pending.event_type)
                .with_data_map(pending.data.clone());
            if let Some(plan_id) = &plan_id {
                entry = entry.with_plan(plan_id);
            }
            if let Some(phase_id) = &pending.phase_id {
                entry = entry.with_phase(phase_id);
            }
            if let Some(step_id) = &pending.step_id {
                entry = entry.with_step(step_id);
            }
            self.log.append(entry).await?;
        }
        Ok(())
    }
}

/// Briefing for one replan turn: plan summary, the finished phase, reduced
/// step results, any failure, and what is still pending.
fn replan_briefing(
    plan: &Plan,
    completed_phase_id: &str,
    phase_result: &PhaseResult,
    failure_info: Option<&str>,
) -> String {
    let mut briefing = plan.summary();
    briefing.push_str("\n\nJust finished phase: ");
    match plan.phase(completed_phase_id) {
        Some(phase) => briefing.push_str(&format!("{} ({})", phase.name, phase.id)),
        None => briefing.push_str(completed_phase_id),
    }

    briefing.push_str("\nStep results:\n");
    for result in &phase_result.step_results {
        briefing.push_str(&format!(
            "- {} status={} has_output={}\n",
            result.step_id,
            serde_json::to_string(&result.status).unwrap_or_default(),
            result.output.is_some(),
        ));
    }
    if let Some(failure) = failure_info {
        briefing.push_str(&format!("\nFailure: {failure}\n"));
    }

    let remaining: Vec<&str> = plan
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Pending)
        .map(|p| p.name.as_str())
        .collect();
    briefing.push_str(&format!("\nRemaining phases: {}", remaining.join(", ")));
    briefing
}
