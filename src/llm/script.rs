//! Deterministic scripted chat client for the test suites.
//!
//! Responses are queued up front and played back one per `chat` call. The
//! full request history is recorded so tests can assert on transcripts.

use super::{ChatMessage, ChatResponse, LlmClient, Tool};
use crate::errors::LlmError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses in playback order.
    pub fn with_responses(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: ChatResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Number of `chat` calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Transcript snapshot of the nth request.
    pub fn request(&self, n: usize) -> Option<Vec<ChatMessage>> {
        self.requests.lock().unwrap().get(n).cloned()
    }

    pub fn last_request(&self) -> Option<Vec<ChatMessage>> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[Tool]>,
        _model: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.requests.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plays_responses_in_order_and_records_requests() {
        let llm = ScriptedLlm::with_responses(vec![
            ChatResponse::text("first"),
            ChatResponse::text("second"),
        ]);
        let cancel = CancellationToken::new();

        let first = llm
            .chat(&[ChatMessage::user("hello")], None, None, &cancel)
            .await
            .unwrap();
        assert_eq!(first.message.text(), "first");

        let second = llm.chat(&[], None, None, &cancel).await.unwrap();
        assert_eq!(second.message.text(), "second");
        assert_eq!(llm.call_count(), 2);

        let exhausted = llm.chat(&[], None, None, &cancel).await;
        assert!(matches!(exhausted, Err(LlmError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let llm = ScriptedLlm::with_responses(vec![ChatResponse::text("unused")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = llm.chat(&[], None, None, &cancel).await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(llm.call_count(), 0);
    }
}
