//! `taskd inspect`: parse one record file and report how the worker sees it.

use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};

use crate::core::codec::parse_record;
use crate::core::phase::{Phase, classify};
use crate::core::plan::render_step_line;
use crate::record::Record;

/// Parse the record at `path` and render a short human-readable summary.
pub fn inspect_file(path: &Path, now: DateTime<Utc>) -> Result<String> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let id = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let record = parse_record(id, &contents)?;
    summarize(&record, now).context("format summary")
}

pub fn summarize(record: &Record, now: DateTime<Utc>) -> Result<String, fmt::Error> {
    let mut out = String::new();
    writeln!(out, "task: {}", record.id)?;
    match classify(record, now) {
        Phase::Blocked(reason) => writeln!(out, "phase: blocked ({reason:?})")?,
        other => writeln!(out, "phase: {}", other.name())?,
    }
    if let Some(recipient) = record.recipient() {
        writeln!(out, "recipient: {recipient}")?;
    }
    if !record.meta.status_flags.is_empty() {
        let flags: Vec<String> = record
            .meta
            .status_flags
            .iter()
            .map(|f| format!("{f:?}"))
            .collect();
        writeln!(out, "flags: {}", flags.join(", "))?;
    }
    if let Some(at) = record.meta.run_after {
        writeln!(out, "run_after: {at}")?;
    }
    if record.meta.finalize_attempts > 0 {
        writeln!(out, "finalize_attempts: {}", record.meta.finalize_attempts)?;
    }
    writeln!(out, "steps: {}", record.plan.len())?;
    for step in &record.plan {
        writeln!(out, "  {}", render_step_line(step))?;
    }
    let answered = if record.answer().is_some() { "yes" } else { "no" };
    writeln!(out, "answer: {answered}")?;
    Ok(out)
}
