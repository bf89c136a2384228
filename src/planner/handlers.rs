//! State-mutation handlers for planning tool-calls.
//!
//! Handlers enforce the plan invariants and return structured payloads for
//! the LLM. Invariant violations never become `Err`: they come back as
//! `{"error": …}` payloads with remediation hints so the model can correct
//! itself. The only fatal outcome here is exceeding the `create_plan` guard.

use super::catalog::PlanningAction;
use crate::errors::PlannerError;
use crate::events::EventType;
use crate::plan::{JsonMap, Phase, PhaseStatus, Plan, Step, StepResult, StepType};
use serde_json::{Value, json};
use std::collections::HashMap;

/// An event a handler wants emitted once the mutation is committed.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub event_type: EventType,
    pub phase_id: Option<String>,
    pub step_id: Option<String>,
    pub data: JsonMap,
}

impl PendingEvent {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            phase_id: None,
            step_id: None,
            data: JsonMap::new(),
        }
    }

    fn phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    fn step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    fn data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Outcome of applying one planning action.
#[derive(Debug)]
pub struct HandlerReply {
    /// Structured result handed back to the LLM as the tool message.
    pub payload: Value,
    /// A `finalize_plan` call succeeded.
    pub finalized: bool,
    /// The plan was actually changed.
    pub mutated: bool,
    pub events: Vec<PendingEvent>,
}

impl HandlerReply {
    fn ok(payload: Value) -> Self {
        Self {
            payload,
            finalized: false,
            mutated: false,
            events: Vec::new(),
        }
    }

    fn error(payload: Value) -> Self {
        debug_assert!(payload.get("error").is_some());
        Self {
            payload,
            finalized: false,
            mutated: false,
            events: Vec::new(),
        }
    }

    fn mutated(mut self) -> Self {
        self.mutated = true;
        self
    }

    fn with_event(mut self, event: PendingEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_error(&self) -> bool {
        self.payload.get("error").is_some()
    }
}

/// Per-tool config validation, run before any mutation.
pub fn validate_tool_config(tool_name: &str, config: &JsonMap) -> Result<(), String> {
    if config.is_empty() {
        return Err(format!("config for '{tool_name}' must not be empty"));
    }
    let require_string = |key: &str| -> Result<(), String> {
        match config.get(key).and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(format!("'{tool_name}' requires a non-empty '{key}'")),
        }
    };
    match tool_name {
        "tavily_search" | "web_search" => require_string("query"),
        "web_fetch" => require_string("url"),
        "synthesize" => require_string("prompt"),
        _ => Ok(()),
    }
}

/// Single-owner planning state for one session.
pub struct PlanState {
    plan: Option<Plan>,
    create_plan_calls: u32,
    consecutive_finalize_failures: u32,
    phase_results: HashMap<String, Vec<StepResult>>,
    available_tools: Vec<String>,
    create_plan_max_attempts: u32,
    finalize_auto_recovery_threshold: u32,
}

impl PlanState {
    pub fn new(
        available_tools: Vec<String>,
        create_plan_max_attempts: u32,
        finalize_auto_recovery_threshold: u32,
    ) -> Self {
        Self {
            plan: None,
            create_plan_calls: 0,
            consecutive_finalize_failures: 0,
            phase_results: HashMap::new(),
            available_tools,
            create_plan_max_attempts,
            finalize_auto_recovery_threshold,
        }
    }

    /// Prepare for a fresh plan build. The `create_plan` call counter is a
    /// per-session guard and survives resets.
    pub fn reset_for_new_plan(&mut self) {
        self.plan = None;
        self.consecutive_finalize_failures = 0;
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn plan_id(&self) -> Option<String> {
        self.plan.as_ref().map(|p| p.id.clone())
    }

    /// Transfer plan ownership out (to the orchestrator).
    pub fn take_plan(&mut self) -> Option<Plan> {
        self.plan.take()
    }

    /// Reacquire a plan for the duration of one replan turn.
    pub fn install_plan(&mut self, plan: Plan) {
        self.plan = Some(plan);
    }

    pub fn set_phase_results(&mut self, phase_id: &str, results: Vec<StepResult>) {
        self.phase_results.insert(phase_id.to_string(), results);
    }

    /// Apply one planning action. Fatal only when the `create_plan` runaway
    /// guard trips; every other rejection is a structured error payload.
    pub fn apply(&mut self, action: PlanningAction) -> Result<HandlerReply, PlannerError> {
        if !matches!(action, PlanningAction::CreatePlan { .. }) && self.plan.is_none() {
            return Ok(HandlerReply::error(json!({
                "error": "no plan exists yet",
                "required_action": "create_plan",
            })));
        }

        match action {
            PlanningAction::CreatePlan { query, name } => self.create_plan(&query, name),
            PlanningAction::AddPhase {
                name,
                description,
                replan_checkpoint,
            } => Ok(self.add_phase(&name, description, replan_checkpoint)),
            PlanningAction::AddStep {
                phase_id,
                step_type,
                tool_name,
                config,
                depends_on,
            } => Ok(self.add_step(&phase_id, &step_type, &tool_name, config, depends_on)),
            PlanningAction::ModifyStep { step_id, changes } => {
                Ok(self.modify_step(&step_id, changes))
            }
            PlanningAction::RemoveStep { step_id, reason } => {
                Ok(self.remove_step(&step_id, reason))
            }
            PlanningAction::SkipPhase { phase_id, reason } => {
                Ok(self.skip_phase(&phase_id, reason))
            }
            PlanningAction::InsertPhaseAfter {
                after_phase_id,
                name,
                description,
                replan_checkpoint,
            } => Ok(self.insert_phase_after(&after_phase_id, &name, description, replan_checkpoint)),
            PlanningAction::GetPlanStatus => Ok(self.plan_status()),
            PlanningAction::GetPhaseResults { phase_id } => Ok(self.phase_results_reply(phase_id)),
            PlanningAction::FinalizePlan => Ok(self.finalize_plan()),
        }
    }

    fn create_plan(
        &mut self,
        query: &str,
        name: Option<String>,
    ) -> Result<HandlerReply, PlannerError> {
        if self.create_plan_calls >= self.create_plan_max_attempts {
            return Err(PlannerError::CreatePlanLimitExceeded {
                attempts: self.create_plan_calls,
            });
        }
        self.create_plan_calls += 1;
        self.consecutive_finalize_failures = 0;

        let plan = Plan::new(query);
        let plan_id = plan.id.clone();
        self.plan = Some(plan);

        Ok(HandlerReply::ok(json!({
            "plan_id": plan_id,
            "name": name,
            "next": "add phases with add_phase, then steps with add_step",
        }))
        .mutated())
    }

    fn add_phase(
        &mut self,
        name: &str,
        description: Option<String>,
        replan_checkpoint: Option<bool>,
    ) -> HandlerReply {
        let plan = self.plan.as_mut().unwrap();
        let phase = Phase::new(
            &plan.id,
            name,
            description.as_deref().unwrap_or_default(),
            replan_checkpoint.unwrap_or(false),
            plan.next_phase_order(),
        );
        let phase_id = phase.id.clone();
        let order = phase.order;
        plan.phases.push(phase);

        HandlerReply::ok(json!({"phase_id": phase_id, "order": order}))
            .mutated()
            .with_event(
                PendingEvent::new(EventType::PhaseAdded)
                    .phase(&phase_id)
                    .data("name", json!(name))
                    .data("order", json!(order)),
            )
    }

    fn add_step(
        &mut self,
        phase_id: &str,
        step_type: &str,
        tool_name: &str,
        config: JsonMap,
        depends_on: Option<Vec<String>>,
    ) -> HandlerReply {
        let Some(step_type) = StepType::parse(step_type) else {
            return HandlerReply::error(json!({
                "error": format!("unknown step type '{step_type}'"),
                "allowed_types": ["tool_call", "llm_call", "search", "fetch", "llm"],
            }));
        };
        if tool_name.is_empty() {
            return HandlerReply::error(json!({"error": "tool_name must not be empty"}));
        }
        if !self.available_tools.iter().any(|t| t == tool_name) {
            return HandlerReply::error(json!({
                "error": format!("unknown tool '{tool_name}'"),
                "available_tools": self.available_tools,
            }));
        }
        if let Err(message) = validate_tool_config(tool_name, &config) {
            return HandlerReply::error(json!({"error": message}));
        }

        let plan = self.plan.as_mut().unwrap();
        let Some(phase) = plan.phase_mut(phase_id) else {
            return HandlerReply::error(json!({
                "error": format!("unknown phase id '{phase_id}'"),
            }));
        };

        let dependencies = depends_on.unwrap_or_default();
        for dep in &dependencies {
            if phase.step(dep).is_none() {
                return HandlerReply::error(json!({
                    "error": format!("dependency '{dep}' is not a step in phase '{phase_id}'"),
                }));
            }
        }

        let step = Step::new(
            phase_id,
            step_type,
            tool_name,
            config,
            dependencies,
            phase.next_step_order(),
        );
        let step_id = step.id.clone();
        phase.steps.push(step);

        HandlerReply::ok(json!({"step_id": step_id}))
            .mutated()
            .with_event(
                PendingEvent::new(EventType::StepAdded)
                    .phase(phase_id)
                    .step(&step_id)
                    .data("tool_name", json!(tool_name)),
            )
    }

    fn modify_step(&mut self, step_id: &str, changes: JsonMap) -> HandlerReply {
        let plan = self.plan.as_mut().unwrap();
        let Some(step) = plan.find_step_mut(step_id) else {
            return HandlerReply::error(json!({
                "error": format!("unknown step id '{step_id}'"),
            }));
        };

        let mut applied: Vec<String> = Vec::new();
        for (key, value) in changes {
            match (key.as_str(), value) {
                ("tool_name", Value::String(tool_name)) if !tool_name.is_empty() => {
                    step.tool_name = tool_name;
                    applied.push(key.clone());
                }
                ("config", Value::Object(config)) => {
                    step.config = config;
                    applied.push(key.clone());
                }
                ("type", Value::String(raw)) => match StepType::parse(&raw) {
                    Some(step_type) => {
                        step.step_type = step_type;
                        applied.push(key.clone());
                    }
                    None => {
                        return HandlerReply::error(json!({
                            "error": format!("unknown step type '{raw}'"),
                        }));
                    }
                },
                ("depends_on", Value::Array(deps)) => {
                    step.dependencies = deps
                        .into_iter()
                        .filter_map(|d| d.as_str().map(str::to_string))
                        .collect();
                    applied.push(key.clone());
                }
                (other, _) => {
                    return HandlerReply::error(json!({
                        "error": format!("unsupported change field '{other}'"),
                        "allowed_fields": ["tool_name", "config", "type", "depends_on"],
                    }));
                }
            }
        }
        let step_id = step.id.clone();
        let phase_id = step.phase_id.clone();

        HandlerReply::ok(json!({"step_id": step_id, "applied": applied}))
            .mutated()
            .with_event(
                PendingEvent::new(EventType::StepModified)
                    .phase(&phase_id)
                    .step(&step_id),
            )
    }

    fn remove_step(&mut self, step_id: &str, reason: Option<String>) -> HandlerReply {
        let plan = self.plan.as_mut().unwrap();
        for phase in &mut plan.phases {
            if let Some(idx) = phase.steps.iter().position(|s| s.id == step_id) {
                let phase_id = phase.id.clone();
                phase.steps.remove(idx);
                // Drop references from sibling dependency sets.
                for step in &mut phase.steps {
                    step.dependencies.retain(|dep| dep != step_id);
                }
                return HandlerReply::ok(json!({"removed": step_id}))
                    .mutated()
                    .with_event(
                        PendingEvent::new(EventType::StepRemoved)
                            .phase(&phase_id)
                            .step(step_id)
                            .data("reason", json!(reason)),
                    );
            }
        }
        HandlerReply::error(json!({"error": format!("unknown step id '{step_id}'")}))
    }

    fn skip_phase(&mut self, phase_id: &str, reason: Option<String>) -> HandlerReply {
        let plan = self.plan.as_mut().unwrap();
        let Some(phase) = plan.phase_mut(phase_id) else {
            return HandlerReply::error(json!({
                "error": format!("unknown phase id '{phase_id}'"),
            }));
        };
        phase.status = PhaseStatus::Skipped;
        HandlerReply::ok(json!({"skipped": phase_id, "reason": reason})).mutated()
    }

    fn insert_phase_after(
        &mut self,
        after_phase_id: &str,
        name: &str,
        description: Option<String>,
        replan_checkpoint: Option<bool>,
    ) -> HandlerReply {
        let plan = self.plan.as_mut().unwrap();
        let Some(after_idx) = plan.phases.iter().position(|p| p.id == after_phase_id) else {
            return HandlerReply::error(json!({
                "error": format!("unknown phase id '{after_phase_id}'"),
            }));
        };

        let order = plan.phases[after_idx].order + 1;
        let plan_id = plan.id.clone();
        let phase = Phase::new(
            &plan_id,
            name,
            description.as_deref().unwrap_or_default(),
            replan_checkpoint.unwrap_or(false),
            order,
        );
        let phase_id = phase.id.clone();
        plan.phases.insert(after_idx + 1, phase);
        for later in plan.phases.iter_mut().skip(after_idx + 2) {
            later.order += 1;
        }

        HandlerReply::ok(json!({"phase_id": phase_id, "order": order}))
            .mutated()
            .with_event(
                PendingEvent::new(EventType::PhaseAdded)
                    .phase(&phase_id)
                    .data("name", json!(name))
                    .data("inserted_after", json!(after_phase_id)),
            )
    }

    fn plan_status(&self) -> HandlerReply {
        let plan = self.plan.as_ref().unwrap();
        let phases: Vec<Value> = plan
            .phases
            .iter()
            .map(|p| {
                json!({
                    "phase_id": p.id,
                    "name": p.name,
                    "status": p.status,
                    "order": p.order,
                    "step_count": p.steps.len(),
                    "replan_checkpoint": p.replan_checkpoint,
                })
            })
            .collect();
        HandlerReply::ok(json!({
            "plan_id": plan.id,
            "query": plan.query,
            "status": plan.status,
            "phases": phases,
        }))
    }

    fn phase_results_reply(&self, phase_id: Option<String>) -> HandlerReply {
        let reduce = |results: &[StepResult]| -> Vec<Value> {
            results
                .iter()
                .map(|r| {
                    json!({
                        "step_id": r.step_id,
                        "status": r.status,
                        "has_output": r.output.is_some(),
                    })
                })
                .collect()
        };

        let payload = match phase_id {
            Some(phase_id) => match self.phase_results.get(&phase_id) {
                Some(results) => json!({"phase_id": phase_id, "results": reduce(results)}),
                None => json!({"phase_id": phase_id, "results": []}),
            },
            None => {
                let all: HashMap<&String, Vec<Value>> = self
                    .phase_results
                    .iter()
                    .map(|(id, results)| (id, reduce(results)))
                    .collect();
                json!({"results_by_phase": all})
            }
        };
        HandlerReply::ok(payload)
    }

    fn finalize_plan(&mut self) -> HandlerReply {
        let empty_phase_ids: Vec<String> = {
            let plan = self.plan.as_ref().unwrap();
            plan.phases
                .iter()
                .filter(|p| p.status != PhaseStatus::Skipped && p.steps.is_empty())
                .map(|p| p.id.clone())
                .collect()
        };

        if empty_phase_ids.is_empty() {
            self.consecutive_finalize_failures = 0;
            let mut reply = HandlerReply::ok(json!({"finalized": true}));
            reply.finalized = true;
            return reply;
        }

        self.consecutive_finalize_failures += 1;
        if self.consecutive_finalize_failures < self.finalize_auto_recovery_threshold {
            return HandlerReply::error(json!({
                "error": "plan has phases with no steps",
                "empty_phase_ids": empty_phase_ids,
                "remediation": "add at least one step to each listed phase with add_step, then call finalize_plan again",
            }));
        }

        // Second consecutive failure: fill each empty phase with a default
        // step keyed off the phase name.
        self.consecutive_finalize_failures = 0;
        let plan = self.plan.as_mut().unwrap();
        let query = plan.query.clone();
        let mut events = Vec::new();
        for phase_id in &empty_phase_ids {
            let phase = plan.phase_mut(phase_id).unwrap();
            let step = default_step_for_phase(phase, &query);
            let step_id = step.id.clone();
            let tool_name = step.tool_name.clone();
            phase.steps.push(step);
            events.push(
                PendingEvent::new(EventType::StepAutoAdded)
                    .phase(phase_id)
                    .step(&step_id)
                    .data("tool_name", json!(tool_name)),
            );
        }
        events.push(
            PendingEvent::new(EventType::AutoRecovery)
                .data("reason", json!("finalize_plan failed twice with empty phases"))
                .data("filled_phases", json!(empty_phase_ids)),
        );

        let mut reply = HandlerReply::ok(json!({
            "finalized": true,
            "auto_recovered": true,
            "filled_phases": empty_phase_ids,
        }))
        .mutated();
        reply.finalized = true;
        reply.events = events;
        reply
    }
}

/// Default step injected into an empty phase during finalize auto-recovery.
fn default_step_for_phase(phase: &Phase, plan_query: &str) -> Step {
    let name = phase.name.to_lowercase();
    let topic = if phase.description.is_empty() {
        phase.name.clone()
    } else {
        phase.description.clone()
    };

    let mut config = JsonMap::new();
    let (step_type, tool_name) = if name.contains("search") {
        config.insert("query".to_string(), json!(topic));
        (StepType::Search, "tavily_search")
    } else if name.contains("fetch") {
        config.insert("url".to_string(), json!(topic));
        (StepType::Fetch, "web_fetch")
    } else if name.contains("synth") {
        config.insert(
            "prompt".to_string(),
            json!(format!("Synthesize an answer to: {plan_query}")),
        );
        (StepType::Llm, "synthesize")
    } else {
        config.insert("query".to_string(), json!(topic));
        (StepType::Search, "tavily_search")
    };

    Step::new(&phase.id, step_type, tool_name, config, Vec::new(), 0)
}

/// Unconditional synthesis guarantee: append a synthesis phase when the plan
/// has none. Returns whether a phase was appended; calling it again on the
/// same plan is a no-op.
pub fn ensure_synthesis_phase(plan: &mut Plan) -> bool {
    if plan.has_synthesis_phase() {
        return false;
    }
    let mut phase = Phase::new(
        &plan.id,
        "Synthesis & Answer Generation",
        "Combine gathered results into the final answer",
        false,
        plan.next_phase_order(),
    );
    let mut config = JsonMap::new();
    config.insert(
        "prompt".to_string(),
        json!(format!(
            "Synthesize a comprehensive answer to: {}",
            plan.query
        )),
    );
    config.insert("query".to_string(), json!(plan.query));
    phase.steps.push(Step::new(
        &phase.id,
        StepType::Llm,
        "synthesize",
        config,
        Vec::new(),
        0,
    ));
    plan.phases.push(phase);
    true
}
