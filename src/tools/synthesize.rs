//! Synthesis tool executor backed by the configured chat provider.
//!
//! Handles the `synthesize` / `llm` / `text_synthesis` step tools: one chat
//! turn over the step's prompt and gathered context, returning the assistant
//! text as the step output.

use super::{ToolExecutor, ToolOutput};
use crate::errors::{LlmError, ToolError};
use crate::llm::{ChatMessage, LlmClient};
use crate::plan::Step;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a research assistant. Synthesize the gathered \
     information into a clear, well-structured answer. Cite the sources you draw on.";

pub struct SynthesizeExecutor {
    llm: Arc<dyn LlmClient>,
    model: Option<String>,
}

impl SynthesizeExecutor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm, model: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl ToolExecutor for SynthesizeExecutor {
    async fn execute(
        &self,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        let config_str = |key: &str| {
            step.config
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
        };

        let system = config_str("system_prompt").unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let prompt = config_str("prompt").ok_or_else(|| ToolError::Failed {
            tool: step.tool_name.clone(),
            message: "missing 'prompt' in step config".to_string(),
        })?;

        let mut user = prompt.to_string();
        if let Some(context) = config_str("context") {
            user.push_str("\n\nGathered context:\n");
            user.push_str(context);
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let response = self
            .llm
            .chat(&messages, None, self.model.as_deref(), cancel)
            .await
            .map_err(|err| match err {
                LlmError::Cancelled => ToolError::Cancelled,
                other => ToolError::Failed {
                    tool: step.tool_name.clone(),
                    message: other.to_string(),
                },
            })?;

        let usage = response.usage();
        Ok(ToolOutput::text(response.message.text()).with_tokens(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, ScriptedLlm};
    use crate::plan::{JsonMap, StepType};
    use serde_json::json;

    fn synth_step(config: JsonMap) -> Step {
        Step::new("phase-1", StepType::Llm, "synthesize", config, vec![], 0)
    }

    #[tokio::test]
    async fn synthesizes_from_prompt_and_context() {
        let llm = Arc::new(ScriptedLlm::with_responses(vec![ChatResponse::text(
            "Quantum computing uses qubits.",
        )]));
        let executor = SynthesizeExecutor::new(llm.clone());

        let mut config = JsonMap::new();
        config.insert("prompt".into(), json!("Answer: what is quantum computing?"));
        config.insert("context".into(), json!("qubits superpose"));

        let output = executor
            .execute(&synth_step(config), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            output.output.as_text(),
            Some("Quantum computing uses qubits.")
        );

        let transcript = llm.last_request().unwrap();
        assert!(transcript[1].text().contains("Gathered context"));
        assert!(transcript[1].text().contains("qubits superpose"));
    }

    #[tokio::test]
    async fn missing_prompt_fails() {
        let llm = Arc::new(ScriptedLlm::new());
        let executor = SynthesizeExecutor::new(llm);

        let result = executor
            .execute(&synth_step(JsonMap::new()), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ToolError::Failed { .. })));
    }

    #[tokio::test]
    async fn cancellation_maps_to_cancelled_error() {
        let llm = Arc::new(ScriptedLlm::new());
        let executor = SynthesizeExecutor::new(llm);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut config = JsonMap::new();
        config.insert("prompt".into(), json!("p"));
        let result = executor.execute(&synth_step(config), &cancel).await;
        assert!(matches!(result, Err(ToolError::Cancelled)));
    }
}
