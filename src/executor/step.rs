//! Single-step execution: config enrichment, dispatch, timing, events.

use crate::errors::{LogError, ToolError};
use crate::events::{EventType, LogEntry, LogStore};
use crate::plan::{JsonMap, Step, StepError, StepResult};
use crate::tools::{StepOutput, ToolRegistry};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_SYNTH_SYSTEM_PROMPT: &str =
    "You are a research assistant. Synthesize the gathered information into a clear, \
     well-structured answer. Cite the sources you draw on.";

/// Read-only execution context for one step.
pub struct StepContext<'a> {
    pub session_id: &'a str,
    pub plan_id: &'a str,
    pub phase_id: &'a str,
    pub plan_query: &'a str,
    /// Results of previously completed waves and phases, insertion-ordered.
    pub prior_results: &'a [StepResult],
}

/// Runs one step against the tool registry.
///
/// Tool failures never surface as `Err` — they become failed step results.
/// The only `Err` out of `execute` is a log-append failure, which is fatal
/// to the calling operation.
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    log: Arc<dyn LogStore>,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>, log: Arc<dyn LogStore>) -> Self {
        Self { registry, log }
    }

    pub async fn execute(
        &self,
        step: &Step,
        ctx: &StepContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepResult, LogError> {
        let started = Instant::now();
        let config = enrich_config(step, ctx);
        let run_step = Step {
            config: config.clone(),
            ..step.clone()
        };

        self.log
            .append(
                LogEntry::new(ctx.session_id, EventType::StepStarted)
                    .with_plan(ctx.plan_id)
                    .with_phase(ctx.phase_id)
                    .with_step(&step.id)
                    .with_data("tool_name", json!(step.tool_name))
                    .with_data("config", Value::Object(config.clone())),
            )
            .await?;

        let outcome = match self.registry.get(&step.tool_name) {
            Some(executor) if cancel.is_cancelled() => {
                drop(executor);
                Err(ToolError::Cancelled)
            }
            Some(executor) => executor.execute(&run_step, cancel).await,
            None => Err(ToolError::UnknownTool(step.tool_name.clone())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                self.log
                    .append(
                        LogEntry::new(ctx.session_id, EventType::StepCompleted)
                            .with_plan(ctx.plan_id)
                            .with_phase(ctx.phase_id)
                            .with_step(&step.id)
                            .with_data("duration_ms", json!(duration_ms))
                            .with_data(
                                "output",
                                serde_json::to_value(&output.output).unwrap_or(Value::Null),
                            )
                            .with_data("tokens_used", json!(output.tokens_used)),
                    )
                    .await?;
                Ok(StepResult::completed(
                    step,
                    config,
                    output.output,
                    duration_ms,
                    output.tokens_used,
                ))
            }
            Err(tool_error) => {
                let error = if tool_error.is_cancelled() {
                    StepError::cancelled()
                } else {
                    StepError::new(tool_error.to_string())
                };
                debug!(step = %step.id, tool = %step.tool_name, %tool_error, "step failed");
                self.log
                    .append(
                        LogEntry::new(ctx.session_id, EventType::StepFailed)
                            .with_plan(ctx.plan_id)
                            .with_phase(ctx.phase_id)
                            .with_step(&step.id)
                            .with_data("duration_ms", json!(duration_ms))
                            .with_data("error", json!(error.message))
                            .with_data("error_kind", json!(error.kind)),
                    )
                    .await?;
                Ok(StepResult::failed(step, config, error, duration_ms))
            }
        }
    }
}

/// Enrich a step's config before dispatch: synthesis steps get the query and
/// gathered context injected; steps with an empty config get a tool-keyed
/// default.
fn enrich_config(step: &Step, ctx: &StepContext<'_>) -> JsonMap {
    let mut config = step.config.clone();

    if step.tool_name.contains("synth") && !ctx.prior_results.is_empty() {
        config
            .entry("query".to_string())
            .or_insert_with(|| json!(ctx.plan_query));
        if !config.contains_key("context") {
            let context = gather_context(ctx.prior_results);
            if !context.is_empty() {
                config.insert("context".to_string(), json!(context));
            }
        }
        config
            .entry("system_prompt".to_string())
            .or_insert_with(|| json!(DEFAULT_SYNTH_SYSTEM_PROMPT));
        config.entry("prompt".to_string()).or_insert_with(|| {
            json!(format!(
                "Synthesize a comprehensive answer to: {}",
                ctx.plan_query
            ))
        });
        return config;
    }

    if config.is_empty() {
        match step.tool_name.as_str() {
            "tavily_search" | "web_search" => {
                config.insert("query".to_string(), json!(ctx.plan_query));
                config.insert("max_results".to_string(), json!(5));
            }
            "web_fetch" => {
                if let Some(url) = first_prior_url(ctx.prior_results) {
                    config.insert("url".to_string(), json!(url));
                }
            }
            _ => {}
        }
    }

    config
}

/// Concatenate prior structured search results (pretty-printed JSON) and
/// fetched text blocks, separated by `---`.
fn gather_context(prior_results: &[StepResult]) -> String {
    let mut blocks: Vec<String> = Vec::new();
    for result in prior_results {
        match &result.output {
            Some(StepOutput::SearchResults(records)) if !records.is_empty() => {
                if let Ok(block) = serde_json::to_string_pretty(records) {
                    blocks.push(block);
                }
            }
            Some(StepOutput::Text(text)) if !text.is_empty() && !result.tool_name.contains("synth") => {
                blocks.push(text.clone());
            }
            _ => {}
        }
    }
    blocks.join("\n---\n")
}

fn first_prior_url(prior_results: &[StepResult]) -> Option<String> {
    prior_results.iter().find_map(|result| {
        result
            .output
            .as_ref()
            .and_then(|o| o.as_search_results())
            .and_then(|records| records.first())
            .map(|record| record.url.clone())
    })
}
