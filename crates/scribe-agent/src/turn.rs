//! The per-turn loop: prompt construction, model invocation, tool
//! dispatch, and the caller-facing event stream.
//!
//! The backend's native stream is re-emitted as the fixed `AgentEvent`
//! vocabulary. Text deltas are newline-normalized before they are
//! accumulated or forwarded. A backend error becomes an `error` event
//! without aborting; the loop's own terminal event is the single `done`,
//! carrying the full accumulated text and the accepted-edits list.

use crate::Agent;
use crate::context::{ContextSelection, partition_project_files, render_numbered};
use crate::intent::{IntentResult, classify_intent};
use crate::session::SessionEntry;
use crate::tools::ToolRuntime;
use scribe_core::{
    AgentEvent, ChatMessage, ChatRequest, EditTurn, EventSink, ProposedEdit, Result,
    StreamCallback, StreamChunk, ToolChoice, normalize_newlines,
};
use std::sync::{Arc, Mutex};
use std::thread;
use uuid::Uuid;

/// Maximum model invocations per turn. A model that keeps calling tools
/// past this is cut off and the turn completes with what it has.
pub const MAX_MODEL_CALLS: usize = 16;

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    pub edits: Vec<ProposedEdit>,
}

impl Agent {
    /// Run one edit turn, streaming events through `sink`. Always emits
    /// exactly one `done` event; upstream failures degrade to `error`
    /// events first.
    pub fn run_turn(&self, turn: &EditTurn, sink: EventSink) -> Result<TurnOutcome> {
        let turn_id = Uuid::now_v7();
        sink(AgentEvent::Status {
            state: "started".to_string(),
        });

        let intent = classify_intent(&turn.instruction);
        let selection = partition_project_files(
            &turn.project_files,
            turn.current_file_path.as_deref(),
            &turn.file_content,
        );
        let session_entry = turn
            .session_id
            .as_deref()
            .and_then(|id| self.sessions.snapshot(id));
        let system_prompt = build_system_prompt(turn, &intent, &selection, session_entry.as_ref());

        let mut runtime = ToolRuntime::new(turn, &intent, sink.clone(), &self.compiler);
        let mut messages = vec![
            ChatMessage::System {
                content: system_prompt,
            },
            ChatMessage::User {
                content: turn.instruction.clone(),
            },
        ];

        let accumulated = Arc::new(Mutex::new(String::new()));
        let stream_cb: StreamCallback = {
            let sink = sink.clone();
            let accumulated = accumulated.clone();
            Arc::new(move |chunk| match chunk {
                StreamChunk::ContentDelta(delta) => {
                    let text = normalize_newlines(&delta);
                    if let Ok(mut acc) = accumulated.lock() {
                        acc.push_str(&text);
                    }
                    sink(AgentEvent::AssistantPartial { text });
                }
                StreamChunk::StreamError(message) => sink(AgentEvent::Error { message }),
                StreamChunk::Done => {}
            })
        };

        let mut calls = 0;
        while calls < MAX_MODEL_CALLS {
            calls += 1;
            let request = ChatRequest {
                model: self.cfg.llm.model.clone(),
                messages: messages.clone(),
                tools: ToolRuntime::definitions(),
                tool_choice: ToolChoice::auto(),
                max_tokens: self.cfg.llm.max_tokens,
                temperature: self.cfg.llm.temperature,
            };
            let response = match self.llm.complete_chat_streaming(&request, stream_cb.clone()) {
                Ok(response) => response,
                Err(e) => {
                    self.observer
                        .warn_log(&format!("turn {turn_id}: model call failed: {e}"));
                    sink(AgentEvent::Error {
                        message: e.to_string(),
                    });
                    break;
                }
            };

            messages.push(ChatMessage::Assistant {
                content: if response.text.is_empty() {
                    None
                } else {
                    Some(response.text.clone())
                },
                tool_calls: response.tool_calls.clone(),
            });

            if response.tool_calls.is_empty() {
                break;
            }
            for tool_call in &response.tool_calls {
                let result = runtime.dispatch(tool_call);
                messages.push(ChatMessage::Tool {
                    tool_call_id: tool_call.id.clone(),
                    content: result,
                });
            }
        }

        let text = accumulated
            .lock()
            .map(|acc| acc.clone())
            .unwrap_or_default();
        let edits = runtime.into_accepted();
        sink(AgentEvent::Done {
            text: text.clone(),
            edits: edits.clone(),
        });
        self.observer.info_log(&format!(
            "turn {turn_id} done: {calls} model calls, {} edits",
            edits.len()
        ));

        // Persist the turn, then refresh the summary out-of-band. The
        // refresh only affects future turns; the caller never waits on it.
        if let Some(session_id) = &turn.session_id {
            self.sessions
                .store_last_interaction(session_id, &turn.instruction, &text);
            let llm = self.llm.clone();
            let sessions = self.sessions.clone();
            let observer = self.observer.clone();
            let model = self.cfg.llm.model.clone();
            let session_id = session_id.clone();
            thread::spawn(move || {
                sessions.refresh_summary(llm.as_ref(), &model, &session_id, &observer);
            });
        }

        Ok(TurnOutcome { text, edits })
    }
}

fn build_system_prompt(
    turn: &EditTurn,
    intent: &IntentResult,
    selection: &ContextSelection,
    session: Option<&SessionEntry>,
) -> String {
    let mut out = String::from(
        "You are a document-editing assistant for LaTeX projects. Propose \
         precise edits with the propose_edit tool; old_string must match \
         exactly one location. Use fetch_context to load a file before \
         editing it, and compile to check the document builds.\n",
    );
    if intent.is_read_only {
        out.push_str(
            "This instruction is read-only: answer from the document, do not propose edits.\n",
        );
    }

    out.push_str("\nActive file");
    if let Some(path) = &turn.current_file_path {
        out.push_str(&format!(" ({path})"));
    }
    out.push_str(":\n");
    out.push_str(&render_numbered(&turn.file_content));

    if let Some(range) = &turn.selection {
        out.push_str(&format!(
            "\nThe user has selected lines {}-{}.\n",
            range.start_line_number, range.end_line_number
        ));
    }
    if let Some(selected) = &turn.selection_text {
        out.push_str(&format!("Selected text:\n{selected}\n"));
    }

    for file in &selection.full {
        out.push_str(&format!("\nProject file {}:\n{}\n", file.path, file.content));
    }
    if !selection.listed.is_empty() {
        out.push_str(
            "\nOther project files (fetch their content with fetch_context before editing):\n",
        );
        for path in &selection.listed {
            out.push_str(&format!("- {path}\n"));
        }
    }

    if let Some(entry) = session {
        if !entry.summary.is_empty() {
            out.push_str(&format!("\nSession summary so far:\n{}\n", entry.summary));
        }
        if let Some(interaction) = &entry.last_interaction {
            out.push_str(&format!(
                "\nPrevious exchange:\nuser: {}\nassistant: {}\n",
                interaction.user_request, interaction.assistant_response
            ));
        }
    }
    out
}
