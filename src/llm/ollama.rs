//! Ollama chat adapter (`POST /api/chat`, non-streaming).
//!
//! The wire format is message-shaped like the OpenAI chat API, with two
//! differences the adapter normalizes away: tool calls may arrive without ids
//! (ids are synthesized so tool-result messages can reference them), and
//! token counts come back as `prompt_eval_count` / `eval_count`.

use super::{ChatMessage, ChatResponse, FunctionCall, LlmClient, Role, Tool, ToolCall};
use crate::config::EngineConfig;
use crate::errors::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.ollama_base_url.clone(),
            config.model.clone().unwrap_or_else(|| "llama3.1".to_string()),
            config.llm_timeout,
        )
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        model: Option<&str>,
    ) -> Result<ChatResponse, LlmError> {
        let request = WireRequest {
            model: model.unwrap_or(&self.model),
            messages,
            tools,
            stream: false,
        };

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        debug!(url = %url, model = request.model, "sending chat request");

        let response = self.http.post(&url).json(&request).send().await?;
        let response = response.error_for_status()?;
        let wire: WireResponse = response.json().await?;
        Ok(wire.into_response())
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Tool]>,
        model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        let seconds = self.timeout.as_secs();
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.send(messages, tools, model)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Timeout { seconds }),
                }
            }
        }
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Tool]>,
    stream: bool,
}

#[derive(Deserialize)]
struct WireResponse {
    message: WireMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    total_duration: Option<u64>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl WireResponse {
    fn into_response(self) -> ChatResponse {
        let tool_calls = self.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call
                        .id
                        .unwrap_or_else(|| format!("call-{}", Uuid::new_v4())),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: call.function.name,
                        arguments: normalize_arguments(call.function.arguments),
                    },
                })
                .collect::<Vec<_>>()
        });

        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: self.message.content,
                tool_calls,
                tool_call_id: None,
            },
            prompt_eval_count: self.prompt_eval_count,
            eval_count: self.eval_count,
            total_duration: self.total_duration,
        }
    }
}

/// Providers occasionally encode arguments as a JSON string; decode it so the
/// rest of the kernel always sees an object.
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}
