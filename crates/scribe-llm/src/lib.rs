//! Blocking chat-completions client for OpenAI-compatible backends.
//!
//! Supports plain and SSE-streaming completions with tool definitions.
//! Streaming responses are re-assembled into a full `LlmResponse` while
//! each content delta is forwarded through the stream callback.

use anyhow::{Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use scribe_core::{
    ChatMessage, ChatRequest, LlmConfig, LlmResponse, LlmToolCall, StreamCallback, StreamChunk,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries.
const NETWORK_RETRY_BASE_MS: u64 = 1000;

pub trait LlmClient {
    /// Chat completion with tool definitions (function calling).
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;

    /// Streaming variant that invokes `cb` for each chunk as it arrives.
    /// Returns the fully assembled `LlmResponse` once the stream ends.
    fn complete_chat_streaming(&self, req: &ChatRequest, cb: StreamCallback)
    -> Result<LlmResponse>;
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    cfg: LlmConfig,
    client: Client,
}

impl ChatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
            .ok_or_else(|| {
                anyhow!(
                    "no API key found: set {} or llm.api_key in scribe.toml",
                    self.cfg.api_key_env
                )
            })
    }

    fn build_chat_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| match m {
                ChatMessage::System { content } => json!({"role": "system", "content": content}),
                ChatMessage::User { content } => json!({"role": "user", "content": content}),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut msg = json!({"role": "assistant"});
                    if let Some(c) = content {
                        msg["content"] = json!(c);
                    }
                    if !tool_calls.is_empty() {
                        let tc: Vec<Value> = tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments
                                    }
                                })
                            })
                            .collect();
                        msg["tool_calls"] = json!(tc);
                    }
                    msg
                }
                ChatMessage::Tool {
                    tool_call_id,
                    content,
                } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
            })
            .collect();

        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream
        });
        if let Some(temp) = req.temperature {
            payload["temperature"] = json!(temp);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(json!([]));
            payload["tool_choice"] =
                serde_json::to_value(&req.tool_choice).unwrap_or(json!("auto"));
        }
        payload
    }

    fn complete_chat_inner(&self, req: &ChatRequest, api_key: &str) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, false);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_chat_payload(&body);
                    }
                    last_err = Some(format_api_error(status, &body));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("chat transport error: {e}"));
                    if e.is_timeout() && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed")))
    }

    /// Streaming variant: reads the SSE response line-by-line, invoking
    /// `cb` for each delta, then returns the assembled response.
    fn complete_chat_streaming_inner(
        &self,
        req: &ChatRequest,
        api_key: &str,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, true);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));

                    if status.is_success() {
                        let mut state = StreamState::default();
                        let reader = std::io::BufReader::new(resp);
                        for line_result in reader.lines() {
                            let line = match line_result {
                                Ok(l) => l,
                                Err(e) => {
                                    last_err = Some(anyhow!("stream read error: {e}"));
                                    break;
                                }
                            };
                            let trimmed = line.trim();
                            if !trimmed.starts_with("data:") {
                                continue;
                            }
                            let chunk = trimmed.trim_start_matches("data:").trim();
                            if chunk == "[DONE]" {
                                cb(StreamChunk::Done);
                                break;
                            }
                            let value: Value = match serde_json::from_str(chunk) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            state.absorb(&value, &cb);
                        }
                        if let Some(err) = last_err.take() {
                            return Err(err);
                        }
                        return Ok(state.finish());
                    }

                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(status, &body));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("chat transport error: {e}"));
                    if e.is_timeout() && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat streaming request failed")))
    }
}

impl LlmClient for ChatClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let key = self.resolve_api_key()?;
        self.complete_chat_inner(req, &key)
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let key = self.resolve_api_key()?;
        self.complete_chat_streaming_inner(req, &key, cb)
    }
}

// ── Stream assembly ────────────────────────────────────────────────────

/// Partial tool call assembled from streaming deltas, keyed by index.
#[derive(Debug, Default, Clone)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates streaming deltas into a complete response.
#[derive(Default)]
struct StreamState {
    content: String,
    finish_reason: Option<String>,
    tool_call_parts: BTreeMap<u64, StreamToolCall>,
}

impl StreamState {
    fn absorb(&mut self, value: &Value, cb: &StreamCallback) {
        // Backend-reported errors are forwarded, not fatal: the caller
        // decides what to do and the stream keeps going.
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("backend stream error")
                .to_string();
            cb(StreamChunk::StreamError(message));
            return;
        }
        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                self.content.push_str(content);
                cb(StreamChunk::ContentDelta(content.to_string()));
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                merge_stream_tool_calls(tool_calls, &mut self.tool_call_parts);
            }
        }
    }

    fn finish(self) -> LlmResponse {
        let tool_calls: Vec<LlmToolCall> = self
            .tool_call_parts
            .into_iter()
            .filter_map(|(index, value)| {
                if value.name.trim().is_empty() {
                    return None;
                }
                Some(LlmToolCall {
                    id: value
                        .id
                        .unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                    name: value.name,
                    arguments: value.arguments,
                })
            })
            .collect();
        LlmResponse {
            text: self.content,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            tool_calls,
        }
    }
}

fn merge_stream_tool_calls(deltas: &[Value], parts: &mut BTreeMap<u64, StreamToolCall>) {
    for delta in deltas {
        let index = delta.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let entry = parts.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(|v| v.as_str()) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = delta.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                entry.name.push_str(name);
            }
            if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(args);
            }
        }
    }
}

// ── Response and error helpers ─────────────────────────────────────────

fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| anyhow!("malformed chat response: {e}"))?;
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| anyhow!("chat response has no choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| anyhow!("chat response has no message"))?;
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let function = tc.get("function")?;
                    Some(LlmToolCall {
                        id: tc
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: function.get("name")?.as_str()?.to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        finish_reason,
        tool_calls,
    })
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after {
        return Duration::from_secs(seconds);
    }
    Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(6)))
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    header?.to_str().ok()?.trim().parse::<u64>().ok()
}

fn format_api_error(status: StatusCode, body: &str) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    anyhow!("chat API error {status}: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::ToolChoice;
    use std::sync::{Arc, Mutex};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "deepseek-chat".to_string(),
            messages: vec![
                ChatMessage::System {
                    content: "you edit documents".to_string(),
                },
                ChatMessage::User {
                    content: "fix the typo".to_string(),
                },
            ],
            tools: vec![],
            tool_choice: ToolChoice::auto(),
            max_tokens: 512,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn payload_includes_messages_and_temperature() {
        let client = ChatClient::new(LlmConfig::default()).expect("client");
        let payload = client.build_chat_payload(&sample_request(), false);
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["messages"].as_array().expect("messages").len(), 2);
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn parses_non_streaming_tool_call_response() {
        let body = r#"{
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "propose_edit", "arguments": "{\"old_string\":\"a\"}"}
                    }]
                }
            }]
        }"#;
        let resp = parse_chat_payload(body).expect("parse");
        assert_eq!(resp.finish_reason, "tool_calls");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "propose_edit");
    }

    #[test]
    fn stream_state_assembles_content_and_tool_calls() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: StreamCallback = Arc::new(move |chunk| {
            if let StreamChunk::ContentDelta(text) = chunk {
                seen_cb.lock().expect("lock").push(text);
            }
        });

        let mut state = StreamState::default();
        let chunks = [
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"prop"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"ose_edit","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for chunk in chunks {
            let value: Value = serde_json::from_str(chunk).expect("chunk");
            state.absorb(&value, &cb);
        }
        let resp = state.finish();
        assert_eq!(resp.text, "Hello");
        assert_eq!(resp.finish_reason, "tool_calls");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "propose_edit");
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(*seen.lock().expect("lock"), vec!["Hel", "lo"]);
    }

    #[test]
    fn stream_state_forwards_backend_errors_without_aborting() {
        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let errors_cb = errors.clone();
        let cb: StreamCallback = Arc::new(move |chunk| {
            if let StreamChunk::StreamError(message) = chunk {
                errors_cb.lock().expect("lock").push(message);
            }
        });

        let mut state = StreamState::default();
        let err: Value =
            serde_json::from_str(r#"{"error":{"message":"overloaded"}}"#).expect("chunk");
        state.absorb(&err, &cb);
        let more: Value =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"still here"}}]}"#)
                .expect("chunk");
        state.absorb(&more, &cb);

        let resp = state.finish();
        assert_eq!(resp.text, "still here");
        assert_eq!(*errors.lock().expect("lock"), vec!["overloaded"]);
    }

    #[test]
    fn retry_delay_prefers_retry_after() {
        assert_eq!(retry_delay_ms(500, 0, Some(7)), Duration::from_secs(7));
        assert_eq!(retry_delay_ms(500, 0, None), Duration::from_millis(500));
        assert_eq!(retry_delay_ms(500, 2, None), Duration::from_millis(2000));
    }
}
