//! Closed catalogs of planning and recovery tool-calls.
//!
//! Both catalogs are sum types with schema-described payloads. Incoming tool
//! calls are parsed into tagged actions; dispatch downstream is one `match`.

use crate::llm::{Tool, ToolCall};
use crate::plan::JsonMap;
use serde::Deserialize;
use serde_json::{Value, json};

/// A planning tool-call, parsed and typed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum PlanningAction {
    CreatePlan {
        query: String,
        #[serde(default)]
        name: Option<String>,
    },
    AddPhase {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        replan_checkpoint: Option<bool>,
    },
    AddStep {
        phase_id: String,
        #[serde(rename = "type")]
        step_type: String,
        tool_name: String,
        #[serde(default)]
        config: JsonMap,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
    },
    ModifyStep {
        step_id: String,
        changes: JsonMap,
    },
    RemoveStep {
        step_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    SkipPhase {
        phase_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    InsertPhaseAfter {
        after_phase_id: String,
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        replan_checkpoint: Option<bool>,
    },
    GetPlanStatus,
    GetPhaseResults {
        #[serde(default)]
        phase_id: Option<String>,
    },
    FinalizePlan,
}

impl PlanningAction {
    /// Whether a successful application of this action mutates the plan.
    /// Finalize and the read-only introspection tools do not count.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::GetPlanStatus | Self::GetPhaseResults { .. } | Self::FinalizePlan
        )
    }
}

/// A recovery tool-call, parsed and typed.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryStep {
        step_id: String,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        modified_config: Option<JsonMap>,
    },
    SkipStep {
        step_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    ReplaceStep {
        step_id: String,
        alternative_tool_name: String,
        #[serde(default)]
        alternative_config: JsonMap,
        #[serde(default)]
        reason: Option<String>,
    },
    AbortPlan {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Parse a tool call into a planning action.
pub fn parse_planning_action(call: &ToolCall) -> Result<PlanningAction, String> {
    parse_tagged(call)
}

/// Parse a tool call into a recovery action.
pub fn parse_recovery_action(call: &ToolCall) -> Result<RecoveryAction, String> {
    parse_tagged(call)
}

fn parse_tagged<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, String> {
    let mut object = match &call.function.arguments {
        Value::Object(map) => map.clone(),
        Value::Null => JsonMap::new(),
        other => {
            return Err(format!(
                "arguments for '{}' must be an object, got {other}",
                call.function.name
            ));
        }
    };
    object.insert("tool".to_string(), json!(call.function.name));
    serde_json::from_value(Value::Object(object))
        .map_err(|e| format!("invalid arguments for '{}': {e}", call.function.name))
}

/// The ten planning tools offered to the LLM.
pub fn planning_tools() -> Vec<Tool> {
    vec![
        Tool::function(
            "create_plan",
            "Initialize an empty research plan for the query. Must be called before any other planning tool.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The research query this plan answers"},
                    "name": {"type": "string", "description": "Optional short plan name"}
                },
                "required": ["query"]
            }),
        ),
        Tool::function(
            "add_phase",
            "Append a phase to the plan. Returns the new phase id.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "replan_checkpoint": {
                        "type": "boolean",
                        "description": "Review the plan after this phase completes"
                    }
                },
                "required": ["name"]
            }),
        ),
        Tool::function(
            "add_step",
            "Append a step to a phase. The step's config must satisfy the tool's requirements.",
            json!({
                "type": "object",
                "properties": {
                    "phase_id": {"type": "string"},
                    "type": {
                        "type": "string",
                        "enum": ["tool_call", "llm_call", "search", "fetch", "llm"]
                    },
                    "tool_name": {"type": "string"},
                    "config": {"type": "object"},
                    "depends_on": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Step ids in the same phase that must finish first"
                    }
                },
                "required": ["phase_id", "type", "tool_name", "config"]
            }),
        ),
        Tool::function(
            "modify_step",
            "Shallow-overwrite fields of an existing step.",
            json!({
                "type": "object",
                "properties": {
                    "step_id": {"type": "string"},
                    "changes": {"type": "object"}
                },
                "required": ["step_id", "changes"]
            }),
        ),
        Tool::function(
            "remove_step",
            "Remove a step from the plan.",
            json!({
                "type": "object",
                "properties": {
                    "step_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["step_id"]
            }),
        ),
        Tool::function(
            "skip_phase",
            "Mark a phase as skipped; it will not execute.",
            json!({
                "type": "object",
                "properties": {
                    "phase_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["phase_id"]
            }),
        ),
        Tool::function(
            "insert_phase_after",
            "Splice a new phase in after an existing one.",
            json!({
                "type": "object",
                "properties": {
                    "after_phase_id": {"type": "string"},
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "replan_checkpoint": {"type": "boolean"}
                },
                "required": ["after_phase_id", "name"]
            }),
        ),
        Tool::function(
            "get_plan_status",
            "Read the current plan structure and statuses.",
            json!({"type": "object", "properties": {}}),
        ),
        Tool::function(
            "get_phase_results",
            "Read the recorded results of completed phases.",
            json!({
                "type": "object",
                "properties": {
                    "phase_id": {"type": "string"}
                }
            }),
        ),
        Tool::function(
            "finalize_plan",
            "Validate and finish the plan. Every phase must contain at least one step.",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}

/// The four recovery tools offered to the LLM after a step failure.
pub fn recovery_tools() -> Vec<Tool> {
    vec![
        Tool::function(
            "retry_step",
            "Retry the failed step, optionally with a modified config.",
            json!({
                "type": "object",
                "properties": {
                    "step_id": {"type": "string"},
                    "reason": {"type": "string"},
                    "modified_config": {"type": "object"}
                },
                "required": ["step_id", "reason"]
            }),
        ),
        Tool::function(
            "skip_step",
            "Skip the failed step and continue the phase.",
            json!({
                "type": "object",
                "properties": {
                    "step_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["step_id", "reason"]
            }),
        ),
        Tool::function(
            "replace_step",
            "Replace the failed step with a different tool invocation.",
            json!({
                "type": "object",
                "properties": {
                    "step_id": {"type": "string"},
                    "alternative_tool_name": {"type": "string"},
                    "alternative_config": {"type": "object"},
                    "reason": {"type": "string"}
                },
                "required": ["step_id", "alternative_tool_name", "alternative_config", "reason"]
            }),
        ),
        Tool::function(
            "abort_plan",
            "Abort the whole plan; the session fails.",
            json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string"}
                },
                "required": ["reason"]
            }),
        ),
    ]
}
