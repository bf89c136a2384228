//! Plan tree types: Plan → Phase → Step, plus per-execution result types.
//!
//! The tree is strictly top-down owned; cross-entity links are ids, never
//! back-pointers. Plans are built and mutated only by the planner's tool-call
//! handlers, then transferred to the orchestrator for execution.

use crate::llm::TokenUsage;
use crate::tools::StepOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type JsonMap = Map<String, Value>;

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Planning,
    Executing,
    Replanning,
    Completed,
    Failed,
}

/// Phase lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ToolCall,
    LlmCall,
    Search,
    Fetch,
    Llm,
}

impl StepType {
    /// Parse the wire name used in planning tool-calls.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tool_call" => Some(Self::ToolCall),
            "llm_call" => Some(Self::LlmCall),
            "search" => Some(Self::Search),
            "fetch" => Some(Self::Fetch),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

/// The ordered sequence of phases produced by the planner for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub query: String,
    pub status: PlanStatus,
    pub phases: Vec<Phase>,
    pub created_at: DateTime<Utc>,
}

/// Markers in a phase name that identify it as a synthesis phase.
pub const SYNTHESIS_NAME_MARKERS: [&str; 5] =
    ["synth", "answer", "final", "summary", "conclusion"];

impl Plan {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: new_id("plan"),
            query: query.into(),
            status: PlanStatus::Planning,
            phases: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// Locate a step anywhere in the plan.
    pub fn find_step(&self, step_id: &str) -> Option<(&Phase, &Step)> {
        for phase in &self.phases {
            if let Some(step) = phase.step(step_id) {
                return Some((phase, step));
            }
        }
        None
    }

    pub fn find_step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.phases
            .iter_mut()
            .find_map(|phase| phase.step_mut(step_id))
    }

    /// Order value for the next appended phase.
    pub fn next_phase_order(&self) -> u32 {
        self.phases.len() as u32
    }

    /// Whether the plan already carries a synthesis phase, either by phase
    /// name or by a synthesis-shaped step.
    pub fn has_synthesis_phase(&self) -> bool {
        let by_name = self.phases.iter().any(|phase| {
            let name = phase.name.to_lowercase();
            SYNTHESIS_NAME_MARKERS
                .iter()
                .any(|marker| name.contains(marker))
        });
        if by_name {
            return true;
        }
        self.phases.iter().flat_map(|p| &p.steps).any(|step| {
            step.tool_name.contains("synth")
                || step.tool_name == "llm"
                || step.tool_name == "text_synthesis"
        })
    }

    /// Compact one-line-per-phase summary used in replan transcripts.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Plan {} for query: {}", self.id, self.query)];
        for phase in &self.phases {
            lines.push(format!(
                "  [{}] {} ({:?}, {} steps{})",
                phase.order,
                phase.name,
                phase.status,
                phase.steps.len(),
                if phase.replan_checkpoint {
                    ", replan checkpoint"
                } else {
                    ""
                },
            ));
        }
        lines.join("\n")
    }
}

/// A named stage of the plan, owning a local DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub plan_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: PhaseStatus,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub replan_checkpoint: bool,
    pub order: u32,
}

impl Phase {
    pub fn new(
        plan_id: &str,
        name: &str,
        description: &str,
        replan_checkpoint: bool,
        order: u32,
    ) -> Self {
        Self {
            id: new_id("phase"),
            plan_id: plan_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: PhaseStatus::Pending,
            steps: Vec::new(),
            replan_checkpoint,
            order,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn pending_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.status == StepStatus::Pending)
    }

    pub fn has_pending_steps(&self) -> bool {
        self.pending_steps().next().is_some()
    }

    pub fn next_step_order(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// An atomic tool invocation with a config, dependency set, and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub phase_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub tool_name: String,
    #[serde(default)]
    pub config: JsonMap,
    /// Ids of steps in the same phase this step must wait for.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub order: u32,
}

impl Step {
    pub fn new(
        phase_id: &str,
        step_type: StepType,
        tool_name: &str,
        config: JsonMap,
        dependencies: Vec<String>,
        order: u32,
    ) -> Self {
        Self {
            id: new_id("step"),
            phase_id: phase_id.to_string(),
            step_type,
            tool_name: tool_name.to_string(),
            config,
            dependencies,
            status: StepStatus::Pending,
            order,
        }
    }
}

/// Structured step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            stack: None,
        }
    }

    /// Failure marker for a cancelled invocation.
    pub fn cancelled() -> Self {
        Self {
            message: "invocation cancelled".to_string(),
            kind: Some("cancelled".to_string()),
            stack: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind.as_deref() == Some("cancelled")
    }
}

/// Outcome of one executed step.
///
/// Invariant: `status == Completed` implies `output` is present and
/// `status == Failed` implies `error` is present; the constructors are the
/// only way these are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub tool_name: String,
    pub status: StepStatus,
    /// Frozen config snapshot at dispatch time.
    pub input: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<TokenUsage>,
}

impl StepResult {
    pub fn completed(
        step: &Step,
        input: JsonMap,
        output: StepOutput,
        duration_ms: u64,
        tokens_used: Option<TokenUsage>,
    ) -> Self {
        Self {
            step_id: step.id.clone(),
            tool_name: step.tool_name.clone(),
            status: StepStatus::Completed,
            input,
            output: Some(output),
            error: None,
            duration_ms,
            tokens_used,
        }
    }

    pub fn failed(step: &Step, input: JsonMap, error: StepError, duration_ms: u64) -> Self {
        Self {
            step_id: step.id.clone(),
            tool_name: step.tool_name.clone(),
            status: StepStatus::Failed,
            input,
            output: None,
            error: Some(error),
            duration_ms,
            tokens_used: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.is_cancelled())
    }
}

/// Outcome of one executed phase. Step results keep step insertion order
/// regardless of completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub status: PhaseStatus,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn completed(step_results: Vec<StepResult>) -> Self {
        Self {
            status: PhaseStatus::Completed,
            step_results,
            error: None,
        }
    }

    pub fn failed(step_results: Vec<StepResult>, error: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Failed,
            step_results,
            error: Some(error.into()),
        }
    }

    pub fn first_failed_step(&self) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.is_failed())
    }
}
