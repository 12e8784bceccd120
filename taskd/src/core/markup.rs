//! Inline markers shared with the front-end collaborator.
//!
//! Payload markers (`<answer>`, `<confirm>`) come from engine replies;
//! entry markers (`--- USER DECISION ---`, ...) are appended by collaborators.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

pub const ANSWER_OPEN: &str = "<answer>";
pub const ANSWER_CLOSE: &str = "</answer>";
pub const CONFIRM_OPEN: &str = "<confirm>";
pub const DECISION_MARKER: &str = "--- USER DECISION ---";
pub const RESULT_PREFIX: &str = "--- RESULT";
pub const STEP_FAILED_NOTE: &str = "[step failed: no response from engine]";

static ANSWER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<answer>(.*?)</answer>").expect("answer pattern"));
static CONFIRM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<confirm>(.*?)</confirm>").expect("confirm pattern"));
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ansi pattern")
});

/// First `<answer>` payload in `text`, trimmed. An empty payload still counts.
pub fn extract_answer(text: &str) -> Option<String> {
    ANSWER_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Wrap a finalization reply in answer markers unless it already carries them.
pub fn wrap_answer(reply: &str) -> String {
    if ANSWER_RE.is_match(reply) {
        return reply.trim().to_string();
    }
    format!("{ANSWER_OPEN}\n{}\n{ANSWER_CLOSE}", reply.trim())
}

/// True when the last `<confirm>` in `text` has no decision entry after it.
pub fn confirmation_pending(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    let Some(idx) = lowered.rfind(CONFIRM_OPEN) else {
        return false;
    };
    !text[idx..].contains(DECISION_MARKER)
}

/// Question carried by the last confirmation request in `text`.
pub fn confirmation_question(text: &str) -> Option<String> {
    CONFIRM_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
}

/// Body of the most recent `--- USER DECISION ---` entry.
pub fn latest_decision(text: &str) -> Option<String> {
    let (_, tail) = text.rsplit_once(DECISION_MARKER)?;
    let body: Vec<&str> = tail
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .take_while(|line| !is_entry_heading(line))
        .collect();
    let decision = body.join("\n").trim().to_string();
    (!decision.is_empty()).then_some(decision)
}

/// Lines that open a new History entry (`## step`, `--- USER REPLY ---`, ...).
pub fn is_entry_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("## ") || (trimmed.starts_with("--- ") && trimmed.trim_end().ends_with("---"))
}

pub fn step_entry(title: &str, body: &str) -> String {
    format!("## {title}\n{}", body.trim())
}

pub fn failed_step_entry(title: &str) -> String {
    step_entry(title, STEP_FAILED_NOTE)
}

/// Append an entry, keeping one blank line between entries.
pub fn append_entry(history: &mut String, entry: &str) {
    let trimmed = history.trim_end().len();
    history.truncate(trimmed);
    if !history.trim().is_empty() {
        history.push_str("\n\n");
    } else {
        history.clear();
    }
    history.push_str(entry.trim_end());
}

pub fn result_heading(now: DateTime<Utc>) -> String {
    format!("{RESULT_PREFIX} ({}) ---", now.format("%H:%M"))
}

pub fn is_result_heading(line: &str) -> bool {
    line.trim_start().starts_with(RESULT_PREFIX)
}

/// Remove terminal control sequences and carriage returns from engine output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").replace('\r', "")
}
