//! Event taxonomy and log entry types.

use crate::plan::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The closed set of recognized event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStarted,
    SessionCompleted,
    SessionFailed,
    PlanningStarted,
    PlanningIteration,
    PlanCreated,
    PhaseAdded,
    StepAdded,
    StepModified,
    StepRemoved,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    ReplanTriggered,
    ReplanCompleted,
    AutoRecovery,
    StepAutoAdded,
    SynthesisPhaseAutoAdded,
    EvaluationStarted,
    EvaluationCompleted,
    PlanEvaluationWarning,
    PlanRegenerationStarted,
    DecompositionStarted,
    SubQueryIdentified,
    DecompositionCompleted,
    SubQueryExecutionStarted,
    SubQueryExecutionCompleted,
    FinalSynthesisStarted,
    FinalSynthesisCompleted,
    CoverageAnalysisStarted,
    CoverageAnalysisCompleted,
    CoverageChecked,
    RetrievalCycleStarted,
    RetrievalCycleCompleted,
}

impl EventType {
    /// Wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionCompleted => "session_completed",
            Self::SessionFailed => "session_failed",
            Self::PlanningStarted => "planning_started",
            Self::PlanningIteration => "planning_iteration",
            Self::PlanCreated => "plan_created",
            Self::PhaseAdded => "phase_added",
            Self::StepAdded => "step_added",
            Self::StepModified => "step_modified",
            Self::StepRemoved => "step_removed",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseFailed => "phase_failed",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ReplanTriggered => "replan_triggered",
            Self::ReplanCompleted => "replan_completed",
            Self::AutoRecovery => "auto_recovery",
            Self::StepAutoAdded => "step_auto_added",
            Self::SynthesisPhaseAutoAdded => "synthesis_phase_auto_added",
            Self::EvaluationStarted => "evaluation_started",
            Self::EvaluationCompleted => "evaluation_completed",
            Self::PlanEvaluationWarning => "plan_evaluation_warning",
            Self::PlanRegenerationStarted => "plan_regeneration_started",
            Self::DecompositionStarted => "decomposition_started",
            Self::SubQueryIdentified => "sub_query_identified",
            Self::DecompositionCompleted => "decomposition_completed",
            Self::SubQueryExecutionStarted => "sub_query_execution_started",
            Self::SubQueryExecutionCompleted => "sub_query_execution_completed",
            Self::FinalSynthesisStarted => "final_synthesis_started",
            Self::FinalSynthesisCompleted => "final_synthesis_completed",
            Self::CoverageAnalysisStarted => "coverage_analysis_started",
            Self::CoverageAnalysisCompleted => "coverage_analysis_completed",
            Self::CoverageChecked => "coverage_checked",
            Self::RetrievalCycleStarted => "retrieval_cycle_started",
            Self::RetrievalCycleCompleted => "retrieval_cycle_completed",
        }
    }
}

/// One append-only log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub data: JsonMap,
}

impl LogEntry {
    pub fn new(session_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            id: format!("log-{}", Uuid::new_v4()),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            event_type,
            plan_id: None,
            phase_id: None,
            step_id: None,
            data: JsonMap::new(),
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_data_map(mut self, data: JsonMap) -> Self {
        self.data = data;
        self
    }

    /// Whether this entry records a failure (`error` key present or a
    /// `*_failed` event type).
    pub fn has_error(&self) -> bool {
        self.data.contains_key("error")
            || matches!(
                self.event_type,
                EventType::SessionFailed | EventType::PhaseFailed | EventType::StepFailed
            )
    }
}

/// Query filters for the log store.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub session_id: Option<String>,
    pub event_types: Option<Vec<EventType>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub plan_id: Option<String>,
    pub phase_id: Option<String>,
    pub step_id: Option<String>,
    pub has_error: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub descending: bool,
}

impl LogFilter {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn with_event_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(session_id) = &self.session_id
            && &entry.session_id != session_id
        {
            return false;
        }
        if let Some(event_types) = &self.event_types
            && !event_types.contains(&entry.event_type)
        {
            return false;
        }
        if let Some(since) = &self.since
            && entry.timestamp < *since
        {
            return false;
        }
        if let Some(until) = &self.until
            && entry.timestamp > *until
        {
            return false;
        }
        if let Some(plan_id) = &self.plan_id
            && entry.plan_id.as_deref() != Some(plan_id)
        {
            return false;
        }
        if let Some(phase_id) = &self.phase_id
            && entry.phase_id.as_deref() != Some(phase_id)
        {
            return false;
        }
        if let Some(step_id) = &self.step_id
            && entry.step_id.as_deref() != Some(step_id)
        {
            return false;
        }
        if let Some(has_error) = self.has_error
            && entry.has_error() != has_error
        {
            return false;
        }
        true
    }
}
