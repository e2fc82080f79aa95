//! Client for the external compile microservice.
//!
//! Every failure path returns a structured `CompileOutcome` rather than a
//! transport error: the compile tool is expected to fail inside a turn,
//! and the model needs a message it can react to instead of a crash.

use regex::Regex;
use reqwest::blocking::Client;
use scribe_core::{CompileConfig, ProjectFile, Result};
use serde_json::{Value, json};
use std::sync::LazyLock;
use std::time::Duration;

/// Error-signal lines extracted from a failed compile log.
const MAX_ERROR_LINES: usize = 30;
const LOG_TAIL_CHARS: usize = 3000;
const STDERR_TAIL_CHARS: usize = 1000;

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^(?:! .*|.*\b(?:error|fatal|undefined control sequence|emergency stop|missing \$|no output pdf)\b.*)$",
    )
    .expect("error line regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Success,
    Failure { message: String },
}

impl CompileOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Success => "compile succeeded".to_string(),
            Self::Failure { message } => format!("compile failed:\n{message}"),
        }
    }
}

pub struct CompileClient {
    endpoint: String,
    client: Client,
}

impl CompileClient {
    pub fn new(cfg: &CompileConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            endpoint: cfg.endpoint.clone(),
            client,
        })
    }

    /// Submit the edited file set. The bearer credential from the inbound
    /// request, when present, is forwarded unchanged.
    pub fn submit(
        &self,
        files: &[ProjectFile],
        last_modified_file: &str,
        bearer: Option<&str>,
    ) -> CompileOutcome {
        let payload = json!({
            "files": files,
            "lastModifiedFile": last_modified_file,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send() {
            Ok(resp) if resp.status().is_success() => CompileOutcome::Success,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().unwrap_or_default();
                let value: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                let log = value.get("log").and_then(|v| v.as_str()).unwrap_or("");
                let stderr = value.get("stderr").and_then(|v| v.as_str()).unwrap_or("");
                let error = value.get("error").and_then(|v| v.as_str()).unwrap_or("");
                CompileOutcome::Failure {
                    message: summarize_failure(status.as_u16(), log, stderr, error),
                }
            }
            // Timeouts and transport errors degrade to a structured
            // failure the model can report, never a raw error.
            Err(e) => CompileOutcome::Failure {
                message: format!("compile service unreachable: {e}"),
            },
        }
    }
}

/// Keep the failure small enough for the model's context: the first
/// `MAX_ERROR_LINES` error-signal lines plus bounded tails of the raw
/// log and stderr.
pub fn summarize_failure(status: u16, log: &str, stderr: &str, error: &str) -> String {
    let mut out = format!("compile service returned status {status}");
    if !error.is_empty() {
        out.push_str(&format!("\nerror: {error}"));
    }

    let error_lines: Vec<&str> = ERROR_LINE_RE
        .find_iter(log)
        .map(|m| m.as_str())
        .take(MAX_ERROR_LINES)
        .collect();
    if !error_lines.is_empty() {
        out.push_str("\nerror lines:\n");
        out.push_str(&error_lines.join("\n"));
    }
    if !log.is_empty() {
        out.push_str("\nlog tail:\n");
        out.push_str(tail_chars(log, LOG_TAIL_CHARS));
    }
    if !stderr.is_empty() {
        out.push_str("\nstderr tail:\n");
        out.push_str(tail_chars(stderr, STDERR_TAIL_CHARS));
    }
    out
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut idx = text.len() - max_chars;
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    &text[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_error_signal_lines() {
        let log = "This is pdfTeX\n! Undefined control sequence.\nl.12 \\badmacro\nOutput written\nLaTeX Error: something broke\n";
        let summary = summarize_failure(422, log, "", "");
        assert!(summary.contains("status 422"));
        assert!(summary.contains("! Undefined control sequence."));
        assert!(summary.contains("LaTeX Error: something broke"));
        assert!(summary.contains("log tail:"));
    }

    #[test]
    fn caps_error_lines_at_thirty() {
        let log: String = (0..50).map(|i| format!("Error on line {i}\n")).collect();
        let summary = summarize_failure(500, &log, "", "");
        assert!(summary.contains("Error on line 29"));
        let section = summary
            .split("error lines:\n")
            .nth(1)
            .and_then(|rest| rest.split("\nlog tail:").next())
            .expect("error lines section");
        assert_eq!(section.lines().count(), 30);
    }

    #[test]
    fn tails_are_bounded() {
        let log = "x".repeat(10_000);
        let summary = summarize_failure(500, &log, &log, "");
        let log_tail = summary
            .split("log tail:\n")
            .nth(1)
            .and_then(|rest| rest.split("\nstderr tail:").next())
            .expect("log tail");
        assert_eq!(log_tail.len(), LOG_TAIL_CHARS);
        let stderr_tail = summary.split("stderr tail:\n").nth(1).expect("stderr tail");
        assert_eq!(stderr_tail.len(), STDERR_TAIL_CHARS);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = format!("{}é", "a".repeat(10));
        // A cut landing inside the two-byte char moves forward.
        assert_eq!(tail_chars(&text, 3), "aé");
        assert_eq!(tail_chars(&text, 2), "é");
        assert_eq!(tail_chars(&text, 1), "");
    }

    #[test]
    fn unreachable_service_is_a_structured_failure() {
        let client = CompileClient::new(&CompileConfig {
            endpoint: "http://127.0.0.1:9/compile".to_string(),
            timeout_seconds: 2,
        })
        .expect("client");
        let outcome = client.submit(
            &[ProjectFile {
                path: "main.tex".to_string(),
                content: String::new(),
            }],
            "main.tex",
            None,
        );
        match outcome {
            CompileOutcome::Failure { message } => {
                assert!(message.contains("unreachable"), "{message}");
            }
            CompileOutcome::Success => panic!("expected failure"),
        }
    }
}
