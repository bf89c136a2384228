//! Phase execution: wave scheduling, concurrent step dispatch, ordered
//! result collection, and short-circuit on failure.

use super::step::{StepContext, StepExecutor};
use crate::dag::build_execution_queue;
use crate::errors::LogError;
use crate::events::{EventType, LogEntry, LogStore};
use crate::plan::{Phase, PhaseResult, PhaseStatus, Step, StepResult, StepStatus};
use crate::tools::ToolRegistry;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read-only execution context for one phase.
pub struct PhaseContext<'a> {
    pub session_id: &'a str,
    pub plan_id: &'a str,
    pub plan_query: &'a str,
    /// Step results accumulated from earlier phases.
    pub accumulated: &'a [StepResult],
    /// Extra marker on the `phase_completed` event (e.g. a replan re-run).
    pub completion_reason: Option<&'a str>,
}

/// Executes one phase's pending steps as dependency-ordered waves. Steps in
/// the same wave run concurrently; their results are collected in insertion
/// order so downstream extraction stays deterministic.
pub struct PhaseExecutor {
    steps: StepExecutor,
    log: Arc<dyn LogStore>,
}

impl PhaseExecutor {
    pub fn new(registry: Arc<ToolRegistry>, log: Arc<dyn LogStore>) -> Self {
        Self {
            steps: StepExecutor::new(registry, log.clone()),
            log,
        }
    }

    /// Run the phase's pending steps. Already-terminal steps are left alone,
    /// which makes re-execution after a replan run only the new steps.
    pub async fn execute(
        &self,
        phase: &mut Phase,
        ctx: &PhaseContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<PhaseResult, LogError> {
        phase.status = PhaseStatus::Running;
        self.log
            .append(
                LogEntry::new(ctx.session_id, EventType::PhaseStarted)
                    .with_plan(ctx.plan_id)
                    .with_phase(&phase.id)
                    .with_data("name", json!(phase.name)),
            )
            .await?;

        // Dependencies on steps that already ran are satisfied; drop them so
        // wave computation only orders the pending subset.
        let terminal: HashSet<String> = phase
            .steps
            .iter()
            .filter(|s| s.status.is_terminal())
            .map(|s| s.id.clone())
            .collect();
        let pending: Vec<Step> = phase
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| {
                let mut step = s.clone();
                step.dependencies.retain(|dep| !terminal.contains(dep));
                step
            })
            .collect();

        let waves = build_execution_queue(&pending);
        debug!(phase = %phase.id, steps = pending.len(), waves = waves.len(), "phase scheduled");

        let mut collected: Vec<StepResult> = Vec::new();
        for wave in waves {
            let wave_steps: Vec<&Step> = wave
                .iter()
                .filter_map(|id| pending.iter().find(|s| &s.id == id))
                .collect();

            // Prior results visible to this wave: earlier phases plus every
            // completed wave of this phase.
            let prior: Vec<StepResult> = ctx
                .accumulated
                .iter()
                .chain(collected.iter())
                .cloned()
                .collect();
            let phase_id = phase.id.clone();
            let step_ctx = StepContext {
                session_id: ctx.session_id,
                plan_id: ctx.plan_id,
                phase_id: &phase_id,
                plan_query: ctx.plan_query,
                prior_results: &prior,
            };

            for step in &wave_steps {
                if let Some(live) = phase.step_mut(&step.id) {
                    live.status = StepStatus::Running;
                }
            }

            let outcomes = join_all(
                wave_steps
                    .iter()
                    .map(|step| self.steps.execute(step, &step_ctx, cancel)),
            )
            .await;

            let mut wave_failed: Option<StepResult> = None;
            for outcome in outcomes {
                let result = outcome?;
                if let Some(live) = phase.step_mut(&result.step_id) {
                    live.status = result.status;
                }
                if result.is_failed() && wave_failed.is_none() {
                    wave_failed = Some(result.clone());
                }
                collected.push(result);
            }

            if let Some(failed) = wave_failed {
                phase.status = PhaseStatus::Failed;
                let error = failed
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "step failed".to_string());
                self.log
                    .append(
                        LogEntry::new(ctx.session_id, EventType::PhaseFailed)
                            .with_plan(ctx.plan_id)
                            .with_phase(&phase.id)
                            .with_step(&failed.step_id)
                            .with_data("error", json!(error)),
                    )
                    .await?;
                return Ok(PhaseResult::failed(collected, error));
            }
        }

        phase.status = PhaseStatus::Completed;
        let mut completed = LogEntry::new(ctx.session_id, EventType::PhaseCompleted)
            .with_plan(ctx.plan_id)
            .with_phase(&phase.id)
            .with_data("step_count", json!(collected.len()));
        if let Some(reason) = ctx.completion_reason {
            completed = completed.with_data("reason", json!(reason));
        }
        self.log.append(completed).await?;

        Ok(PhaseResult::completed(collected))
    }
}
