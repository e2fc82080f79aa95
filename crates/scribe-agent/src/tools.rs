//! The callable operations the model may invoke during a turn.
//!
//! Three tools: `fetch_context`, `propose_edit`, `compile`. Each applies
//! validation and side effects and emits a progress event through the
//! caller's sink. Tool results are strings written for the model so it
//! can self-correct on rejection instead of wasting the turn.
//!
//! Accepted edits are applied cumulatively to per-turn working copies:
//! each subsequent validation runs against post-edit content, matching
//! the compile step's replay-in-order semantics.

use crate::compile::CompileClient;
use crate::context::{ACTIVE_FILE_PLACEHOLDER, render_numbered};
use crate::intent::IntentResult;
use crate::validate::validate_edits;
use indexmap::IndexMap;
use scribe_core::{
    AgentEvent, EditTurn, EventSink, LlmToolCall, ProjectFile, ProposedEdit, ToolDefinition,
};
use serde_json::{Value, json};

pub struct ToolRuntime<'a> {
    turn: &'a EditTurn,
    intent: &'a IntentResult,
    sink: EventSink,
    compiler: &'a CompileClient,
    active_key: String,
    /// Unmodified snapshots, keyed by canonical path. Compile replays
    /// accepted edits against these, never against prior compile output.
    originals: IndexMap<String, String>,
    /// Cumulative post-edit content used for validation and fetches.
    working: IndexMap<String, String>,
    /// Append-only, order-preserving within the turn.
    accepted: Vec<ProposedEdit>,
}

impl<'a> ToolRuntime<'a> {
    pub fn new(
        turn: &'a EditTurn,
        intent: &'a IntentResult,
        sink: EventSink,
        compiler: &'a CompileClient,
    ) -> Self {
        let active_key = turn
            .current_file_path
            .clone()
            .unwrap_or_else(|| ACTIVE_FILE_PLACEHOLDER.to_string());
        let mut originals: IndexMap<String, String> = IndexMap::new();
        originals.insert(active_key.clone(), turn.file_content.clone());
        for file in &turn.project_files {
            originals
                .entry(file.path.clone())
                .or_insert_with(|| file.content.clone());
        }
        let working = originals.clone();
        Self {
            turn,
            intent,
            sink,
            compiler,
            active_key,
            originals,
            working,
            accepted: Vec::new(),
        }
    }

    /// Tool schemas bound into the chat request.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                "fetch_context",
                "Fetch the line-numbered content of a project file, or of the active file when no path is given. Request a file's content before editing it.",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Project file path; omit for the active file"},
                        "include_numbered": {"type": "boolean", "description": "Include the numbered rendering (default true)"},
                        "include_selection": {"type": "boolean", "description": "Include the user's current selection text"}
                    }
                }),
            ),
            ToolDefinition::function(
                "propose_edit",
                "Propose one precise text edit. old_string must match exactly one location in the target file; use \"\" to append at end of file. new_string \"\" deletes the matched text.",
                json!({
                    "type": "object",
                    "properties": {
                        "file_path": {"type": "string", "description": "Target file; omit or use \"current\" for the active file"},
                        "old_string": {"type": "string", "description": "Exact text to find (must be unique)"},
                        "new_string": {"type": "string", "description": "Replacement text"},
                        "explanation": {"type": "string", "description": "One-line reason for the edit"}
                    },
                    "required": ["old_string", "new_string"]
                }),
            ),
            ToolDefinition::function(
                "compile",
                "Apply all accepted edits and compile the document. Returns error details on failure.",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    }

    /// Execute one tool call, returning the tool-result string fed back
    /// to the model.
    pub fn dispatch(&mut self, call: &LlmToolCall) -> String {
        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(v) => v,
            Err(e) => return format!("invalid tool arguments: {e}"),
        };
        match call.name.as_str() {
            "fetch_context" => self.fetch_context(&args),
            "propose_edit" => self.propose_edit(&args),
            "compile" => self.compile(),
            other => format!("unknown tool: {other}"),
        }
    }

    pub fn accepted(&self) -> &[ProposedEdit] {
        &self.accepted
    }

    pub fn into_accepted(self) -> Vec<ProposedEdit> {
        self.accepted
    }

    fn is_active_path(&self, path: &str) -> bool {
        path.is_empty() || path == ACTIVE_FILE_PLACEHOLDER || path == self.active_key
    }

    /// Canonical key for a model-supplied path: exact match first, then
    /// suffix match.
    fn resolve(&self, path: &str) -> Option<String> {
        if self.is_active_path(path) {
            return Some(self.active_key.clone());
        }
        if self.working.contains_key(path) {
            return Some(path.to_string());
        }
        self.working
            .keys()
            .find(|key| key.ends_with(path))
            .cloned()
    }

    fn fetch_context(&self, args: &Value) -> String {
        let requested = args
            .get("file_path")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        let include_numbered = args
            .get("include_numbered")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let include_selection = args
            .get("include_selection")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let key = match requested {
            Some(path) => match self.resolve(path) {
                Some(key) => key,
                None => return format!("file not found: {path}"),
            },
            None => self.active_key.clone(),
        };
        let is_active = key == self.active_key;
        let content = &self.working[&key];
        let line_count = content.lines().count();

        let mut out = format!("{key}: {line_count} lines\n");
        if include_numbered {
            out.push_str(&render_numbered(content));
        }
        if include_selection
            && is_active
            && let Some(selection) = &self.turn.selection_text
        {
            out.push_str(&format!("selection:\n{selection}\n"));
        }
        if is_active {
            out.push_str("available files:\n");
            for (path, file_content) in &self.working {
                let flag = if path == &self.active_key {
                    " (current)"
                } else {
                    ""
                };
                out.push_str(&format!(
                    "- {path} ({} lines){flag}\n",
                    file_content.lines().count()
                ));
            }
        }

        (self.sink)(AgentEvent::Tool {
            name: "fetch_context".to_string(),
            detail: json!({"file_path": key, "lines": line_count}),
        });
        out
    }

    fn propose_edit(&mut self, args: &Value) -> String {
        let str_arg = |name: &str| {
            args.get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let mut edit = ProposedEdit {
            file_path: str_arg("file_path"),
            old_string: str_arg("old_string"),
            new_string: str_arg("new_string"),
            explanation: args
                .get("explanation")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let resolved = self.resolve(&edit.file_path);
        if let Some(key) = &resolved {
            // Normalize to the canonical path before validating.
            edit.file_path = key.clone();
        }

        // One-element batch; an unresolved path has no snapshot and
        // passes provisionally, to be re-validated at application time.
        let outcome = validate_edits(std::slice::from_ref(&edit), self.intent, |path| {
            self.working.get(path).cloned()
        });
        if let Some(violation) = outcome.violations.first() {
            return violation.clone();
        }

        let provisional = resolved.is_none();
        if let Some(key) = resolved {
            let updated = apply_edit(&self.working[&key], &edit);
            self.working.insert(key, updated);
        }

        self.accepted.push(edit.clone());
        (self.sink)(AgentEvent::Tool {
            name: "propose_edit".to_string(),
            detail: json!({
                "file_path": edit.file_path,
                "kind": edit.kind().as_str(),
                "provisional": provisional,
            }),
        });
        (self.sink)(AgentEvent::Edits {
            edits: self.accepted.clone(),
        });

        if provisional {
            format!(
                "edit accepted provisionally for {} (content not loaded; it will be re-validated when applied)",
                edit.file_path
            )
        } else {
            format!("edit accepted: {} in {}", edit.kind().as_str(), edit.file_path)
        }
    }

    fn compile(&mut self) -> String {
        let files = replay_edits(&self.originals, &self.accepted);
        let last_modified = self
            .accepted
            .last()
            .map(|edit| edit.file_path.clone())
            .unwrap_or_else(|| self.active_key.clone());
        let outcome = self.compiler.submit(
            &files,
            &last_modified,
            self.turn.bearer_token.as_deref(),
        );
        (self.sink)(AgentEvent::Tool {
            name: "compile".to_string(),
            detail: json!({
                "success": matches!(outcome, crate::compile::CompileOutcome::Success),
                "files": files.len(),
                "edits": self.accepted.len(),
            }),
        });
        outcome.message()
    }
}

/// Apply one edit to content: empty `old_string` appends, empty
/// `new_string` deletes, otherwise single-occurrence replacement.
pub(crate) fn apply_edit(content: &str, edit: &ProposedEdit) -> String {
    if edit.old_string.is_empty() {
        let mut out = content.to_string();
        out.push_str(&edit.new_string);
        return out;
    }
    content.replacen(&edit.old_string, &edit.new_string, 1)
}

/// Replay every accepted edit in order against the unmodified snapshots,
/// producing the file set submitted to the compile service. Edits whose
/// file is not in the snapshot set are skipped here; the storage layer
/// owns applying those.
pub(crate) fn replay_edits(
    originals: &IndexMap<String, String>,
    edits: &[ProposedEdit],
) -> Vec<ProjectFile> {
    let mut files: IndexMap<String, String> = originals.clone();
    for edit in edits {
        if let Some(content) = files.get(&edit.file_path) {
            let updated = apply_edit(content, edit);
            files.insert(edit.file_path.clone(), updated);
        }
    }
    files
        .into_iter()
        .map(|(path, content)| ProjectFile { path, content })
        .collect()
}
