//! Pre-acceptance validation for proposed edits.
//!
//! An edit is only accepted when its `old_string` is unambiguous: it must
//! occur exactly once in the file snapshot it was validated against.
//! Error strings are written for the model so it can self-correct and
//! retry with a better-anchored edit.

use crate::intent::IntentResult;
use scribe_core::{EditKind, ProposedEdit};

/// Result of validating one batch of proposed edits.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub violations: Vec<String>,
    pub accepted_edits: Vec<ProposedEdit>,
}

/// Count occurrences by repeated forward search, advancing one character
/// past each match start so adjacent and overlapping occurrences are all
/// counted rather than skipped past.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let mut count = 0;
    let mut from = 0;
    while let Some(found) = haystack[from..].find(needle) {
        count += 1;
        let match_start = from + found;
        let step = haystack[match_start..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(1);
        from = match_start + step;
    }
    count
}

/// Validate a single edit against the snapshot of its target file.
/// Empty `old_string` denotes append and is always valid.
pub fn validate_edit(edit: &ProposedEdit, file_content: &str) -> Result<(), String> {
    if edit.old_string.is_empty() {
        return Ok(());
    }
    match count_occurrences(file_content, &edit.old_string) {
        0 => Err(format!(
            "old_string not found in {}: provide the exact text to replace",
            edit.file_path
        )),
        1 => Ok(()),
        n => Err(format!(
            "old_string matches {n} locations in {} (must be unique): include more surrounding text",
            edit.file_path
        )),
    }
}

fn kind_permitted(kind: EditKind, intent: &IntentResult) -> bool {
    match kind {
        EditKind::Insert => intent.allow_insert,
        EditKind::Delete => intent.allow_delete,
        EditKind::Replace => intent.allow_replace,
    }
}

/// Reject an edit whose inferred kind the instruction did not authorize,
/// independent of uniqueness.
pub fn check_authorization(edit: &ProposedEdit, intent: &IntentResult) -> Result<(), String> {
    let kind = edit.kind();
    if kind_permitted(kind, intent) {
        return Ok(());
    }
    Err(format!(
        "{} edits are not permitted for this instruction (it reads as a read-only request)",
        kind.as_str()
    ))
}

/// Validate a batch. `lookup` resolves a file path to its content
/// snapshot; when it returns `None` the uniqueness check is skipped and
/// the edit passes provisionally, to be re-validated at application time.
pub fn validate_edits(
    edits: &[ProposedEdit],
    intent: &IntentResult,
    lookup: impl Fn(&str) -> Option<String>,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    for edit in edits {
        if let Err(violation) = check_authorization(edit, intent) {
            outcome.violations.push(violation);
            continue;
        }
        match lookup(&edit.file_path) {
            Some(content) => match validate_edit(edit, &content) {
                Ok(()) => outcome.accepted_edits.push(edit.clone()),
                Err(violation) => outcome.violations.push(violation),
            },
            // Snapshot unavailable: accept provisionally.
            None => outcome.accepted_edits.push(edit.clone()),
        }
    }
    outcome.is_valid = outcome.violations.is_empty();
    outcome
}
