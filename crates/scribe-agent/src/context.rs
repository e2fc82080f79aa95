//! Context windowing: decides what the model gets to see.
//!
//! Two-tier budget: a hard line cap on the active file's rendering, and a
//! soft running-total character cap on the other project files. The file
//! the user is looking at is never truncated away entirely; everything
//! that misses the budget is listed by name for on-demand retrieval.

use regex::Regex;
use scribe_core::ProjectFile;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Files up to this many lines are rendered in full.
pub const MAX_RENDERED_LINES: usize = 300;
/// Head/tail window sizes for longer files.
pub const HEAD_LINES: usize = 75;
pub const TAIL_LINES: usize = 75;
/// Running-total character budget for full-content project files.
pub const FULL_CONTENT_BUDGET: usize = 20_000;
/// Projects with at most this many other files skip priority selection.
pub const SMALL_PROJECT_MAX_FILES: usize = 3;

/// Placeholder path the editor sends when the active file is unsaved.
pub const ACTIVE_FILE_PLACEHOLDER: &str = "current";

/// Root files that conventionally anchor a document project.
const ROOT_FILE_NAMES: &[&str] = &["main.tex", "master.tex", "root.tex"];

static DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:input|include|includegraphics|bibliography|addbibresource)\{([^}]+)\}")
        .expect("directive regex")
});

/// Render file content with 1-based line numbers, bounded to
/// `MAX_RENDERED_LINES`. Longer files get the first and last windows with
/// an omission marker in between and a note that the active selection is
/// supplied separately.
pub fn render_numbered(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let total = lines.len();
    let mut out = String::new();

    if total <= MAX_RENDERED_LINES {
        for (i, line) in lines.iter().enumerate() {
            out.push_str(&format!("{:>4}: {}\n", i + 1, line));
        }
        return out;
    }

    for (i, line) in lines.iter().take(HEAD_LINES).enumerate() {
        out.push_str(&format!("{:>4}: {}\n", i + 1, line));
    }
    out.push_str(&format!("... {} lines omitted ...\n", total - HEAD_LINES));
    let tail_start = total - TAIL_LINES;
    for (i, line) in lines.iter().skip(tail_start).enumerate() {
        out.push_str(&format!("{:>4}: {}\n", tail_start + i + 1, line));
    }
    out.push_str("(note: the active selection, if any, is supplied separately)\n");
    out
}

/// Which project files go into the prompt in full versus name-only.
#[derive(Debug, Clone, Default)]
pub struct ContextSelection {
    pub full: Vec<ProjectFile>,
    pub listed: Vec<String>,
}

/// Partition the other project files into full-content inclusions and a
/// name-only listing, honoring the character budget and priority order:
/// active-path file, conventional root files, files referenced by
/// directives in the active content, then bibliography files.
pub fn partition_project_files(
    files: &[ProjectFile],
    active_path: Option<&str>,
    active_content: &str,
) -> ContextSelection {
    let combined: usize = files.iter().map(|f| f.content.len()).sum();
    if files.len() <= SMALL_PROJECT_MAX_FILES && combined <= FULL_CONTENT_BUDGET {
        return ContextSelection {
            full: files.to_vec(),
            listed: Vec::new(),
        };
    }

    let mut picked: BTreeSet<usize> = BTreeSet::new();
    let mut order: Vec<usize> = Vec::new();
    let mut used = 0usize;
    let mut add = |idx: usize, picked: &mut BTreeSet<usize>, order: &mut Vec<usize>| {
        if picked.contains(&idx) || used >= FULL_CONTENT_BUDGET {
            return;
        }
        used += files[idx].content.len();
        picked.insert(idx);
        order.push(idx);
    };

    // (a) the active file's own project entry
    if let Some(active) = active_path
        && active != ACTIVE_FILE_PLACEHOLDER
        && let Some(idx) = resolve_reference(files, active)
    {
        add(idx, &mut picked, &mut order);
    }

    // (b) conventionally-named root files
    for name in ROOT_FILE_NAMES {
        if let Some(idx) = files
            .iter()
            .position(|f| f.path == *name || f.path.ends_with(&format!("/{name}")))
        {
            add(idx, &mut picked, &mut order);
        }
    }

    // (c) files referenced by directives in the active content
    for target in scan_references(active_content) {
        if let Some(idx) = resolve_reference(files, &target) {
            add(idx, &mut picked, &mut order);
        }
    }

    // (d) bibliography files
    for (idx, file) in files.iter().enumerate() {
        if file.path.ends_with(".bib") {
            add(idx, &mut picked, &mut order);
        }
    }

    let full: Vec<ProjectFile> = order.iter().map(|&idx| files[idx].clone()).collect();
    let listed: Vec<String> = files
        .iter()
        .enumerate()
        .filter(|(idx, _)| !picked.contains(idx))
        .map(|(_, f)| f.path.clone())
        .collect();

    ContextSelection { full, listed }
}

/// Targets named by inclusion/bibliography/graphics directives, in
/// appearance order. `\bibliography{a,b}` names several at once.
pub fn scan_references(active_content: &str) -> Vec<String> {
    let mut targets = Vec::new();
    for caps in DIRECTIVE_RE.captures_iter(active_content) {
        for target in caps[1].split(',') {
            let trimmed = target.trim();
            if !trimmed.is_empty() {
                targets.push(trimmed.to_string());
            }
        }
    }
    targets
}

/// Resolve a directive target or path against the project set: exact
/// path, suffix match, then with the conventional extensions appended.
pub fn resolve_reference(files: &[ProjectFile], target: &str) -> Option<usize> {
    if let Some(idx) = files.iter().position(|f| f.path == target) {
        return Some(idx);
    }
    for candidate in [
        target.to_string(),
        format!("{target}.tex"),
        format!("{target}.bib"),
    ] {
        if let Some(idx) = files
            .iter()
            .position(|f| f.path.ends_with(&candidate))
        {
            return Some(idx);
        }
    }
    None
}
