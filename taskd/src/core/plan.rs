//! Plan selection and state transitions.
//!
//! Steps run strictly in plan order: the first `Pending` step is always next.

use std::sync::LazyLock;

use regex::Regex;

use crate::record::{Step, StepState};

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s+\[(.)\]\s*(.*)$").expect("checkbox pattern"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+(.+)$").expect("bullet pattern"));

/// Parse a Plan section line (`- [x] text`). Returns `None` for anything else.
pub fn parse_step_line(line: &str) -> Option<Step> {
    let caps = CHECKBOX_RE.captures(line.trim())?;
    let glyph = caps.get(1)?.as_str().chars().next()?;
    let state = StepState::from_glyph(glyph)?;
    let text = caps.get(2)?.as_str().trim();
    if text.is_empty() {
        return None;
    }
    Some(Step {
        text: text.to_string(),
        state,
    })
}

pub fn render_step_line(step: &Step) -> String {
    format!("- [{}] {}", step.state.glyph(), step.text)
}

/// Turn a planning reply into Pending steps.
///
/// Checkbox lines, bullets and numbered items count; prose, headings and fenced
/// blocks are ignored. Any state the engine wrote on a checkbox is discarded.
pub fn plan_from_reply(reply: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut in_fence = false;
    for line in reply.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || trimmed.is_empty() {
            continue;
        }
        if CHECKBOX_RE.is_match(trimmed) {
            if let Some(step) = parse_step_line(trimmed) {
                steps.push(Step::pending(step.text));
            }
            continue;
        }
        if let Some(text) = BULLET_RE
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|t| !t.is_empty())
        {
            steps.push(Step::pending(text));
        }
    }
    steps
}

/// Index of the first `Pending` step.
pub fn first_pending(plan: &[Step]) -> Option<usize> {
    plan.iter().position(|s| s.state == StepState::Pending)
}

/// Indices of every `InProgress` step, in plan order.
pub fn in_progress(plan: &[Step]) -> Vec<usize> {
    plan.iter()
        .enumerate()
        .filter(|(_, s)| s.state == StepState::InProgress)
        .map(|(i, _)| i)
        .collect()
}

/// Reset interrupted steps to `Pending`. Returns the indices that were reset.
pub fn recover(plan: &mut [Step]) -> Vec<usize> {
    let reset = in_progress(plan);
    for &idx in &reset {
        plan[idx].state = StepState::Pending;
    }
    reset
}

/// Plan rendered as checkbox lines, for prompts and the Plan section.
pub fn render_plan(plan: &[Step]) -> String {
    plan.iter()
        .map(render_step_line)
        .collect::<Vec<_>>()
        .join("\n")
}
