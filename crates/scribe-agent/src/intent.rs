//! Keyword-based intent classification for the raw user instruction.
//!
//! No model call happens here: permissions are derived once per turn from
//! keyword-set membership and consumed by the edit validator as an
//! authorization gate. Ambiguous text is treated as an edit request unless
//! it positively signals read-only intent.

/// Permissions and auxiliary flags derived from one instruction.
/// Read-only after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentResult {
    pub allow_insert: bool,
    pub allow_delete: bool,
    pub allow_replace: bool,
    pub wants_grammar: bool,
    pub wants_dedupe: bool,
    pub is_read_only: bool,
    pub multi_edit: bool,
    pub full_revamp: bool,
}

const INSERT_VERBS: &[&str] = &["add", "insert", "append", "introduce", "include"];

const DELETE_VERBS: &[&str] = &["delete", "remove", "drop", "erase", "eliminate", "cut"];

const REPLACE_VERBS: &[&str] = &[
    "replace", "change", "fix", "correct", "update", "modify", "rewrite", "revise", "improve",
    "adjust", "substitute", "edit",
];

/// Verbs that signal the user wants to look, not touch.
const READ_VERBS: &[&str] = &[
    "read", "view", "check", "look", "show", "list", "explain", "describe", "summarize",
    "review", "analyze", "inspect",
];

/// Generic write verbs not tied to one operation kind.
const WRITE_VERBS: &[&str] = &["write"];

/// Every verb that signals the user authorizes changes: the three
/// operation-kind sets plus the generic write verbs.
fn edit_verbs() -> impl Iterator<Item = &'static str> {
    INSERT_VERBS
        .iter()
        .chain(DELETE_VERBS)
        .chain(REPLACE_VERBS)
        .chain(WRITE_VERBS)
        .copied()
}

const GRAMMAR_KEYWORDS: &[&str] = &["grammar", "spelling", "typo", "proofread", "punctuation"];

const DEDUPE_KEYWORDS: &[&str] = &["duplicate", "duplicated", "dedupe", "redundant", "repeated"];

const MULTI_EDIT_KEYWORDS: &[&str] = &["all ", "every", "throughout", "everywhere", "each "];

const FULL_REVAMP_KEYWORDS: &[&str] = &[
    "revamp",
    "overhaul",
    "restructure",
    "rewrite the whole",
    "rewrite everything",
    "from scratch",
    "start over",
];

pub fn classify_intent(instruction: &str) -> IntentResult {
    let lower = instruction.to_lowercase();

    let read_only = has_explicit_restriction(&lower)
        || has_negative_restriction(&lower)
        || is_implicitly_read_only(&lower);
    let allow = !read_only;

    IntentResult {
        allow_insert: allow,
        allow_delete: allow,
        allow_replace: allow,
        wants_grammar: contains_any(&lower, GRAMMAR_KEYWORDS),
        wants_dedupe: contains_any(&lower, DEDUPE_KEYWORDS),
        is_read_only: read_only,
        multi_edit: contains_any(&lower, MULTI_EDIT_KEYWORDS),
        full_revamp: contains_any(&lower, FULL_REVAMP_KEYWORDS),
    }
}

fn contains_any(lower: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| lower.contains(needle))
}

/// "only <read verb>" / "just <read verb>" restricts the turn to reading.
fn has_explicit_restriction(lower: &str) -> bool {
    READ_VERBS.iter().any(|verb| {
        lower.contains(&format!("only {verb}")) || lower.contains(&format!("just {verb}"))
    })
}

/// "don't <edit verb>" / "do not <edit verb>" / "no <edit verb>" revokes
/// edit authorization outright.
fn has_negative_restriction(lower: &str) -> bool {
    edit_verbs().any(|verb| {
        lower.contains(&format!("don't {verb}"))
            || lower.contains(&format!("do not {verb}"))
            || lower.contains(&format!("no {verb}"))
    })
}

/// A read-type verb with no edit-type verb anywhere in the text.
fn is_implicitly_read_only(lower: &str) -> bool {
    contains_any(lower, READ_VERBS) && !edit_verbs().any(|verb| lower.contains(verb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_restriction_forces_read_only() {
        let intent = classify_intent("only check the document for errors");
        assert!(intent.is_read_only);
        assert!(!intent.allow_insert);
        assert!(!intent.allow_delete);
        assert!(!intent.allow_replace);
    }

    #[test]
    fn edit_verb_defaults_to_allow() {
        let intent = classify_intent("fix the broken equation");
        assert!(!intent.is_read_only);
        assert!(intent.allow_insert);
        assert!(intent.allow_delete);
        assert!(intent.allow_replace);
    }

    #[test]
    fn negative_restriction_forces_read_only() {
        let intent = classify_intent("review the abstract but do not change anything");
        assert!(intent.is_read_only);
        assert!(!intent.allow_replace);
    }

    #[test]
    fn implicit_read_only_needs_read_verb_without_edit_verb() {
        assert!(classify_intent("explain what this section does").is_read_only);
        // A read verb alongside an edit verb stays an edit request.
        assert!(!classify_intent("review and fix the abstract").is_read_only);
        // No verbs at all: conservative default-allow.
        assert!(!classify_intent("the conclusion").is_read_only);
    }

    #[test]
    fn auxiliary_flags_fire_on_keywords() {
        let intent = classify_intent("fix grammar and remove duplicated sentences throughout");
        assert!(intent.wants_grammar);
        assert!(intent.wants_dedupe);
        assert!(intent.multi_edit);
        assert!(!intent.full_revamp);

        assert!(classify_intent("rewrite the whole introduction").full_revamp);
    }

    #[test]
    fn kind_specific_verbs_count_as_edit_authorization() {
        // "cut" (delete set) and "introduce" (insert set) beat the
        // read verbs next to them.
        assert!(!classify_intent("look at section 2 and cut the second paragraph").is_read_only);
        assert!(!classify_intent("review the intro and introduce a thesis sentence").is_read_only);
        // They also participate in negative restrictions.
        assert!(classify_intent("review the figures, no cuts please").is_read_only);
    }
}
