//! Scripted LLM client for integration tests.

use anyhow::{Result, anyhow};
use scribe_core::{ChatRequest, LlmResponse, LlmToolCall, StreamCallback, StreamChunk};
use scribe_llm::LlmClient;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays a fixed sequence of responses, recording every request it
/// receives. Streaming responses are delivered as a single content delta
/// followed by `Done`.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A plain text response with no tool calls.
    pub fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            finish_reason: "stop".to_string(),
            tool_calls: vec![],
        }
    }

    /// A response consisting of a single tool call.
    pub fn tool_call_response(name: &str, arguments: &str) -> LlmResponse {
        LlmResponse {
            text: String::new(),
            finish_reason: "tool_calls".to_string(),
            tool_calls: vec![LlmToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }

    /// Every request seen so far, for assertions.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn next_response(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.requests.lock().expect("requests lock").push(req.clone());
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted responses exhausted"))
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.next_response(req)
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let response = self.next_response(req)?;
        if !response.text.is_empty() {
            cb(StreamChunk::ContentDelta(response.text.clone()));
        }
        cb(StreamChunk::Done);
        Ok(response)
    }
}
