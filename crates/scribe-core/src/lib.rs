use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".scribe")
}

// ── Inbound request ────────────────────────────────────────────────────

/// One element of the inbound `messages` array. Only the last element's
/// content is used as the instruction; earlier elements are accepted for
/// wire compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default)]
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRange {
    pub start_line_number: u32,
    pub end_line_number: u32,
}

/// Raw inbound JSON body from the HTTP layer. Fields that the contract
/// requires are still optional here so that malformed bodies deserialize
/// and can be rejected with a typed error instead of a serde failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    #[serde(default)]
    pub messages: Option<Vec<RequestMessage>>,
    #[serde(default)]
    pub file_content: Option<serde_json::Value>,
    #[serde(default)]
    pub text_from_editor: Option<String>,
    #[serde(default)]
    pub selection_range: Option<SelectionRange>,
    #[serde(default)]
    pub project_files: Option<Vec<ProjectFile>>,
    #[serde(default)]
    pub current_file_path: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Malformed-request rejections, surfaced by the HTTP layer as a 400
/// before any agent component runs.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is missing 'messages'")]
    MissingMessages,
    #[error("'fileContent' is required and must be a string")]
    InvalidFileContent,
}

// ── Project files ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub path: String,
    pub content: String,
}

/// Extensions dropped from the project file set before any component
/// sees it. Content snapshots for these would be garbage in a prompt.
const BINARY_EXTENSIONS: &[&str] = &[
    "pdf", "png", "jpg", "jpeg", "gif", "bmp", "webp", "tiff", "ico", "eps",
    "zip", "tar", "gz", "rar", "7z", "mp3", "mp4", "wav", "avi", "mov",
    "ttf", "otf", "woff", "woff2", "exe", "dll", "so", "dylib", "bin", "o",
];

pub fn is_binary_path(path: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    path.contains('.') && BINARY_EXTENSIONS.contains(&ext.as_str())
}

// ── Edit turn ──────────────────────────────────────────────────────────

/// The unit of work for one request. Immutable once built; owned by the
/// request handler for its lifetime.
#[derive(Debug, Clone)]
pub struct EditTurn {
    pub instruction: String,
    pub file_content: String,
    pub selection: Option<SelectionRange>,
    pub selection_text: Option<String>,
    pub project_files: Vec<ProjectFile>,
    pub current_file_path: Option<String>,
    pub session_id: Option<String>,
    /// Bearer credential from the inbound request, forwarded unchanged to
    /// the compile microservice.
    pub bearer_token: Option<String>,
}

impl EditTurn {
    /// Build a turn from the raw request, rejecting malformed bodies and
    /// filtering binary project files.
    pub fn from_request(
        req: EditRequest,
        bearer_token: Option<String>,
    ) -> std::result::Result<Self, RequestError> {
        let messages = req.messages.ok_or(RequestError::MissingMessages)?;
        let instruction = messages
            .last()
            .map(|m| m.content.clone())
            .ok_or(RequestError::MissingMessages)?;
        let file_content = match req.file_content {
            Some(serde_json::Value::String(s)) => s,
            _ => return Err(RequestError::InvalidFileContent),
        };
        let project_files = req
            .project_files
            .unwrap_or_default()
            .into_iter()
            .filter(|f| !is_binary_path(&f.path))
            .collect();
        Ok(Self {
            instruction,
            file_content,
            selection: req.selection_range,
            selection_text: req.text_from_editor,
            project_files,
            current_file_path: req.current_file_path,
            session_id: req.session_id,
            bearer_token,
        })
    }
}

// ── Proposed edits ─────────────────────────────────────────────────────

/// A find/replace edit proposed by the model. `old_string == ""` means
/// append at end of file; `new_string == ""` means deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEdit {
    pub file_path: String,
    pub old_string: String,
    pub new_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Replace => "replace",
        }
    }
}

impl ProposedEdit {
    /// The edit's kind is derived, never stored.
    pub fn kind(&self) -> EditKind {
        if self.old_string.is_empty() {
            EditKind::Insert
        } else if self.new_string.is_empty() {
            EditKind::Delete
        } else {
            EditKind::Replace
        }
    }
}

// ── Caller-facing stream events ────────────────────────────────────────

/// The fixed event vocabulary written to the caller's streaming
/// connection. Closed set; payload shape is fixed per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        state: String,
    },
    AssistantPartial {
        text: String,
    },
    Tool {
        name: String,
        detail: serde_json::Value,
    },
    Edits {
        edits: Vec<ProposedEdit>,
    },
    Error {
        message: String,
    },
    Done {
        text: String,
        edits: Vec<ProposedEdit>,
    },
}

/// Sink the HTTP layer hands to the agent; each event must be flushed to
/// the caller as it is produced.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Collapse all line-ending styles to `\n` before text is accumulated or
/// forwarded to the caller.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Chat-with-tools types ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "none", "auto", or "required"
    Mode(String),
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }
    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A single chunk emitted while a model response streams in.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta, exactly as the backend produced it.
    ContentDelta(String),
    /// A backend-reported error; the stream continues.
    StreamError(String),
    /// The backend signalled stream completion.
    Done,
}

pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Configuration ──────────────────────────────────────────────────────

fn default_llm_endpoint() -> String {
    "https://api.deepseek.com/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}
fn default_api_key_env() -> String {
    "SCRIBE_API_KEY".to_string()
}
fn default_max_retries() -> u8 {
    2
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_llm_timeout_seconds() -> u64 {
    90
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_compile_endpoint() -> String {
    "http://127.0.0.1:8085/compile".to_string()
}
fn default_compile_timeout_seconds() -> u64 {
    120
}
fn default_session_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    #[serde(default = "default_compile_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_compile_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Mirror turn milestones to stderr as well as the log file.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub compile: CompileConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty LlmConfig defaults")
    }
}
impl Default for CompileConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty CompileConfig defaults")
    }
}
impl Default for SessionConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty SessionConfig defaults")
    }
}
impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty AppConfig defaults")
    }
}

impl AppConfig {
    /// Load `scribe.toml` from the workspace root, falling back to
    /// defaults when the file is absent.
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = workspace.join("scribe.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> EditRequest {
        serde_json::from_value(body).expect("request body")
    }

    #[test]
    fn builds_turn_from_minimal_request() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "fix the intro"}],
            "fileContent": "Hello world",
        }));
        let turn = EditTurn::from_request(req, None).expect("turn");
        assert_eq!(turn.instruction, "fix the intro");
        assert_eq!(turn.file_content, "Hello world");
        assert!(turn.session_id.is_none());
    }

    #[test]
    fn instruction_is_last_message() {
        let req = request(json!({
            "messages": [
                {"role": "user", "content": "earlier"},
                {"role": "user", "content": "latest"}
            ],
            "fileContent": "x",
        }));
        let turn = EditTurn::from_request(req, None).expect("turn");
        assert_eq!(turn.instruction, "latest");
    }

    #[test]
    fn rejects_missing_messages() {
        let req = request(json!({"fileContent": "x"}));
        let err = EditTurn::from_request(req, None).unwrap_err();
        assert!(matches!(err, RequestError::MissingMessages));
    }

    #[test]
    fn rejects_non_string_file_content() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "fileContent": 42,
        }));
        let err = EditTurn::from_request(req, None).unwrap_err();
        assert!(matches!(err, RequestError::InvalidFileContent));
    }

    #[test]
    fn filters_binary_project_files() {
        let req = request(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "fileContent": "x",
            "projectFiles": [
                {"path": "main.tex", "content": "a"},
                {"path": "figures/plot.png", "content": ""},
                {"path": "refs.bib", "content": "b"}
            ],
        }));
        let turn = EditTurn::from_request(req, None).expect("turn");
        let paths: Vec<&str> = turn.project_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["main.tex", "refs.bib"]);
    }

    #[test]
    fn edit_kind_is_derived() {
        let insert = ProposedEdit {
            file_path: "f".into(),
            old_string: String::new(),
            new_string: "X".into(),
            explanation: None,
        };
        let delete = ProposedEdit {
            old_string: "X".into(),
            new_string: String::new(),
            ..insert.clone()
        };
        let replace = ProposedEdit {
            old_string: "X".into(),
            new_string: "Y".into(),
            ..insert.clone()
        };
        assert_eq!(insert.kind(), EditKind::Insert);
        assert_eq!(delete.kind(), EditKind::Delete);
        assert_eq!(replace.kind(), EditKind::Replace);
    }

    #[test]
    fn normalizes_line_endings() {
        assert_eq!(normalize_newlines("a\r\nb\rc\nd"), "a\nb\nc\nd");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AgentEvent::Done {
            text: "ok".into(),
            edits: vec![],
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "done");
        assert_eq!(value["text"], "ok");
        assert!(value["edits"].as_array().expect("edits").is_empty());
    }

    #[test]
    fn config_defaults_when_file_missing() {
        let cfg = AppConfig::default();
        assert!(!cfg.verbose);
        assert_eq!(cfg.compile.timeout_seconds, 120);
        assert_eq!(cfg.session.capacity, 256);
        assert_eq!(cfg.llm.max_retries, 2);
    }
}
