//! Cross-turn session memory.
//!
//! A capacity-bounded LRU map injected into the handler — not a
//! process-wide singleton — so lifetime and memory bounds are an explicit
//! contract. `store_last_interaction` is synchronous; the rolling summary
//! is refreshed out-of-band after the turn's `done` event and may
//! therefore be one turn stale for a concurrently started turn. Stale is
//! fine; corrupted is not: each field update is a single replace-on-key.

use crate::observe::Observer;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use scribe_core::{ChatMessage, ChatRequest, ToolChoice};
use scribe_llm::LlmClient;
use std::sync::Mutex;

/// Word ceiling the summary rewriting prompt asks the model to respect.
const SUMMARY_WORD_LIMIT: usize = 200;

#[derive(Debug, Clone)]
pub struct Interaction {
    pub user_request: String,
    pub assistant_response: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub summary: String,
    pub last_interaction: Option<Interaction>,
    pub last_updated: DateTime<Utc>,
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self {
            summary: String::new(),
            last_interaction: None,
            last_updated: Utc::now(),
        }
    }
}

pub struct SessionStore {
    capacity: usize,
    inner: Mutex<IndexMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(IndexMap::new()),
        }
    }

    /// Read a session's current state, refreshing its LRU position.
    /// Unknown session ids return `None` without being an error.
    pub fn snapshot(&self, session_id: &str) -> Option<SessionEntry> {
        let Ok(mut map) = self.inner.lock() else {
            return None;
        };
        let entry = map.shift_remove(session_id)?;
        map.insert(session_id.to_string(), entry.clone());
        Some(entry)
    }

    /// Synchronously replace the last interaction, preserving any
    /// existing summary. Creates the session on first reference and
    /// evicts the least-recently-used entry past capacity.
    pub fn store_last_interaction(&self, session_id: &str, user: &str, assistant: &str) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        let mut entry = map.shift_remove(session_id).unwrap_or_default();
        entry.last_interaction = Some(Interaction {
            user_request: user.to_string(),
            assistant_response: assistant.to_string(),
            timestamp: Utc::now(),
        });
        entry.last_updated = Utc::now();
        map.insert(session_id.to_string(), entry);
        while map.len() > self.capacity {
            map.shift_remove_index(0);
        }
    }

    /// Replace only the summary, preserving the last interaction. A
    /// session evicted between refresh start and completion is dropped
    /// silently — its result only mattered for future turns.
    pub fn apply_summary(&self, session_id: &str, summary: String) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        if let Some(entry) = map.get_mut(session_id) {
            entry.summary = summary;
            entry.last_updated = Utc::now();
        }
    }

    /// Rewrite the session summary from the latest interaction. Invoked
    /// on a spawned thread after the turn's `done` event; failure is
    /// logged and leaves the session state untouched.
    pub fn refresh_summary(
        &self,
        llm: &(dyn LlmClient + Send + Sync),
        model: &str,
        session_id: &str,
        observer: &Observer,
    ) {
        let Some(entry) = self.snapshot(session_id) else {
            return;
        };
        let Some(interaction) = entry.last_interaction else {
            return;
        };
        let prompt = summary_prompt(
            &entry.summary,
            &interaction.user_request,
            &interaction.assistant_response,
        );
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::User { content: prompt }],
            tools: vec![],
            tool_choice: ToolChoice::none(),
            max_tokens: 1024,
            temperature: None,
        };
        match llm.complete_chat(&request) {
            Ok(response) => self.apply_summary(session_id, response.text.trim().to_string()),
            Err(e) => observer.warn_log(&format!("session {session_id} summary refresh: {e}")),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Fixed rewriting prompt: existing summary plus the latest turn, output
/// summary text only.
pub fn summary_prompt(existing: &str, user: &str, assistant: &str) -> String {
    format!(
        "You maintain a running summary of a document-editing session.\n\
         Rewrite the summary to fold in the latest exchange. Stay under \
         {SUMMARY_WORD_LIMIT} words. Output only the summary text.\n\n\
         Current summary:\n{existing}\n\n\
         Latest user request:\n{user}\n\n\
         Latest assistant response:\n{assistant}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_interaction_and_preserves_summary() {
        let store = SessionStore::new(8);
        store.store_last_interaction("s1", "fix intro", "done");
        store.apply_summary("s1", "discussed the intro".to_string());
        store.store_last_interaction("s1", "fix outro", "also done");

        let entry = store.snapshot("s1").expect("entry");
        assert_eq!(entry.summary, "discussed the intro");
        let interaction = entry.last_interaction.expect("interaction");
        assert_eq!(interaction.user_request, "fix outro");
    }

    #[test]
    fn summary_update_preserves_last_interaction() {
        let store = SessionStore::new(8);
        store.store_last_interaction("s1", "req", "resp");
        store.apply_summary("s1", "a summary".to_string());
        let entry = store.snapshot("s1").expect("entry");
        assert_eq!(entry.summary, "a summary");
        assert!(entry.last_interaction.is_some());
    }

    #[test]
    fn unknown_session_is_none_not_error() {
        let store = SessionStore::new(8);
        assert!(store.snapshot("missing").is_none());
    }

    #[test]
    fn apply_summary_on_evicted_session_is_dropped() {
        let store = SessionStore::new(8);
        store.apply_summary("gone", "late summary".to_string());
        assert!(store.snapshot("gone").is_none());
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let store = SessionStore::new(2);
        store.store_last_interaction("a", "1", "1");
        store.store_last_interaction("b", "2", "2");
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(store.snapshot("a").is_some());
        store.store_last_interaction("c", "3", "3");
        assert_eq!(store.len(), 2);
        assert!(store.snapshot("b").is_none());
        assert!(store.snapshot("a").is_some());
        assert!(store.snapshot("c").is_some());
    }

    #[test]
    fn stale_summary_stays_intact_for_concurrent_turn() {
        let store = SessionStore::new(8);
        store.store_last_interaction("s1", "turn one", "reply one");
        store.apply_summary("s1", "summary after turn one".to_string());

        // Turn two completes while its summary refresh is still pending.
        store.store_last_interaction("s1", "turn two", "reply two");
        let seen_by_turn_three = store.snapshot("s1").expect("entry");
        assert_eq!(seen_by_turn_three.summary, "summary after turn one");
        assert_eq!(
            seen_by_turn_three
                .last_interaction
                .expect("interaction")
                .user_request,
            "turn two"
        );

        // The pending refresh lands later and only replaces the summary.
        store.apply_summary("s1", "summary after turn two".to_string());
        let entry = store.snapshot("s1").expect("entry");
        assert_eq!(entry.summary, "summary after turn two");
    }

    #[test]
    fn summary_prompt_carries_all_three_parts() {
        let prompt = summary_prompt("old summary", "user ask", "assistant answer");
        assert!(prompt.contains("old summary"));
        assert!(prompt.contains("user ask"));
        assert!(prompt.contains("assistant answer"));
        assert!(prompt.contains("200 words"));
    }
}
