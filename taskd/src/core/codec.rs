//! Text encoding of task records.
//!
//! ```text
//! ---
//! <yaml metadata>
//! ---
//! # Request
//! # Plan
//! # History
//! --- RESULT (HH:MM) ---   (optional, trailing)
//! ```
//!
//! Parsing fails closed: a record that does not match this shape is reported as
//! [`MalformedRecord`] and left untouched on disk. The only other accepted shape is
//! a body with no `# Request` heading, which is read as a bare request.
//!
//! Request and history lines that would read as a section or result heading are
//! written with a leading backslash, which parsing strips again.

use std::fmt;

use crate::core::markup::is_result_heading;
use crate::core::plan::{parse_step_line, render_step_line};
use crate::record::{Record, RecordMeta, ResultBlock};

const REQUEST_HEADING: &str = "# Request";
const PLAN_HEADING: &str = "# Plan";
const HISTORY_HEADING: &str = "# History";

/// A record that does not follow the record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub id: String,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed record {}: {}", self.id, self.reason)
    }
}

impl std::error::Error for MalformedRecord {}

fn malformed(id: &str, reason: impl Into<String>) -> MalformedRecord {
    MalformedRecord {
        id: id.to_string(),
        reason: reason.into(),
    }
}

pub fn parse_record(id: &str, content: &str) -> Result<Record, MalformedRecord> {
    let lines: Vec<&str> = content.lines().collect();
    let (meta_lines, body) = split_frontmatter(id, &lines)?;
    let meta = parse_meta(id, &meta_lines.join("\n"))?;

    let history_at = body.iter().position(|l| l.trim_end() == HISTORY_HEADING);
    let result_at = body
        .iter()
        .enumerate()
        .skip(history_at.unwrap_or(0))
        .find(|(_, l)| is_result_heading(l))
        .map(|(i, _)| i);
    let (sections, result_lines) = match result_at {
        Some(idx) => (&body[..idx], Some(&body[idx..])),
        None => (body, None),
    };

    let result = result_lines.map(|lines| ResultBlock {
        heading: lines[0].trim().to_string(),
        body: join_trimmed(&lines[1..]),
    });

    let Some(request_at) = find_heading(sections, REQUEST_HEADING, 0) else {
        if result.is_some() {
            return Err(malformed(id, "result block without sections"));
        }
        return Ok(Record {
            id: id.to_string(),
            meta,
            request: join_text(sections),
            plan: Vec::new(),
            history: String::new(),
            result: None,
        });
    };
    let plan_at = find_heading(sections, PLAN_HEADING, request_at + 1)
        .ok_or_else(|| malformed(id, "missing # Plan section after # Request"))?;
    let history_at = find_heading(sections, HISTORY_HEADING, plan_at + 1)
        .ok_or_else(|| malformed(id, "missing # History section after # Plan"))?;
    if sections[..request_at].iter().any(|l| !l.trim().is_empty()) {
        return Err(malformed(id, "text before # Request section"));
    }

    let mut plan = Vec::new();
    for line in &sections[plan_at + 1..history_at] {
        if line.trim().is_empty() {
            continue;
        }
        let step = parse_step_line(line)
            .ok_or_else(|| malformed(id, format!("unrecognised plan line '{}'", line.trim())))?;
        plan.push(step);
    }

    Ok(Record {
        id: id.to_string(),
        meta,
        request: join_text(&sections[request_at + 1..plan_at]),
        plan,
        history: join_text(&sections[history_at + 1..]),
        result,
    })
}

/// Render a record in canonical form. `parse_record(render_record(r))` yields `r`.
pub fn render_record(record: &Record) -> Result<String, serde_yaml::Error> {
    let mut out = String::from("---\n");
    if !record.meta.is_empty() {
        out.push_str(&serde_yaml::to_string(&record.meta)?);
    }
    out.push_str("---\n");

    out.push_str(REQUEST_HEADING);
    out.push('\n');
    push_block(&mut out, &escape_text(&record.request));

    out.push('\n');
    out.push_str(PLAN_HEADING);
    out.push('\n');
    for step in &record.plan {
        out.push_str(&render_step_line(step));
        out.push('\n');
    }

    out.push('\n');
    out.push_str(HISTORY_HEADING);
    out.push('\n');
    push_block(&mut out, &escape_text(&record.history));

    if let Some(result) = &record.result {
        out.push('\n');
        out.push_str(&result.heading);
        out.push('\n');
        push_block(&mut out, &result.body);
    }
    Ok(out)
}

fn split_frontmatter<'a, 'b>(
    id: &str,
    lines: &'b [&'a str],
) -> Result<(&'b [&'a str], &'b [&'a str]), MalformedRecord> {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .ok_or_else(|| malformed(id, "empty record"))?;
    if lines[start].trim() != "---" {
        return Err(malformed(id, "missing metadata block"));
    }
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim() == "---")
        .map(|offset| start + 1 + offset)
        .ok_or_else(|| malformed(id, "unterminated metadata block"))?;
    Ok((&lines[start + 1..end], &lines[end + 1..]))
}

fn parse_meta(id: &str, yaml: &str) -> Result<RecordMeta, MalformedRecord> {
    if yaml.trim().is_empty() {
        return Ok(RecordMeta::default());
    }
    serde_yaml::from_str(yaml).map_err(|err| malformed(id, format!("metadata: {err}")))
}

fn find_heading(lines: &[&str], heading: &str, from: usize) -> Option<usize> {
    lines
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, l)| l.trim_end() == heading)
        .map(|(i, _)| i)
}

fn join_trimmed(lines: &[&str]) -> String {
    lines.join("\n").trim().to_string()
}

/// A free-text line that would be read as structure, with or without escapes.
fn is_structural(line: &str) -> bool {
    let bare = line.trim_start_matches('\\');
    matches!(bare.trim_end(), REQUEST_HEADING | PLAN_HEADING | HISTORY_HEADING)
        || is_result_heading(bare)
}

fn escape_text(text: &str) -> String {
    text.lines()
        .map(|line| {
            if is_structural(line) {
                format!("\\{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Free-text section body with escaped structural lines restored.
fn join_text(lines: &[&str]) -> String {
    let restored: Vec<&str> = lines
        .iter()
        .map(|&line| match line.strip_prefix('\\') {
            Some(rest) if is_structural(rest) => rest,
            _ => line,
        })
        .collect();
    join_trimmed(&restored)
}

fn push_block(out: &mut String, text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        out.push_str(text);
        out.push('\n');
    }
}
