//! Classification of raw engine output.
//!
//! Quota exhaustion is recognised on the error channel and always wins over other
//! signals: a variant that hit its quota is never reported as a plain failure.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::core::markup::strip_ansi;
use crate::core::types::{EngineOutcome, RawReply, VariantVerdict};

static QUOTA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)resource_exhausted|quota exceeded|exceeded your current quota|exhausted your capacity|rate limit|429 too many requests",
    )
    .expect("quota pattern")
});

static WAIT_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:retry\s+in|retry\s+after|reset\s+after|retry-after:|"retryDelay"\s*:\s*")"#)
        .expect("wait prefix pattern")
});

static WAIT_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(\d+(?:\.\d+)?)\s*(milliseconds?|ms|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)?",
    )
    .expect("wait component pattern")
});

/// True when `text` carries a known quota-exhaustion signature.
pub fn is_quota_signature(text: &str) -> bool {
    QUOTA_RE.is_match(text)
}

/// Wait advertised in an engine error, rounded up to whole seconds (at least 1 s).
///
/// Understands `retry in 56.2s`, `retry after 2m`, `"retryDelay": "56s"` and
/// `reset after 1h2m3s`. A number without a unit is read as seconds.
pub fn parse_wait(text: &str) -> Option<Duration> {
    WAIT_PREFIX_RE
        .find_iter(text)
        .find_map(|m| parse_duration_prefix(&text[m.end()..]))
        .map(|secs| Duration::from_secs(secs.ceil().max(1.0) as u64))
}

fn parse_duration_prefix(text: &str) -> Option<f64> {
    let mut rest = text;
    let mut total = 0.0;
    let mut matched = false;
    while let Some(caps) = WAIT_COMPONENT_RE.captures(rest) {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2).map(|u| u.as_str().to_ascii_lowercase());
        total += value * unit_seconds(unit.as_deref());
        matched = true;
        rest = &rest[caps.get(0)?.end()..];
        if unit.is_none() {
            break;
        }
    }
    matched.then_some(total)
}

fn unit_seconds(unit: Option<&str>) -> f64 {
    match unit {
        Some(u) if u.starts_with("ms") || u.starts_with("milli") => 0.001,
        Some(u) if u.starts_with('h') => 3600.0,
        Some(u) if u.starts_with('m') => 60.0,
        _ => 1.0,
    }
}

/// Classify one variant attempt.
pub fn classify_variant(raw: &RawReply, fallback_wait: Duration) -> VariantVerdict {
    if is_quota_signature(&raw.stderr) {
        return VariantVerdict::QuotaExhausted(parse_wait(&raw.stderr).unwrap_or(fallback_wait));
    }
    if raw.timed_out {
        return VariantVerdict::Timeout;
    }
    let text = strip_ansi(&raw.stdout).trim().to_string();
    if text.is_empty() {
        VariantVerdict::Empty
    } else {
        VariantVerdict::Success(text)
    }
}

/// Fold per-variant verdicts (in attempt order) into one outcome.
///
/// The first success wins. Without one, any quota report makes the outcome
/// `QuotaExhausted` with the shortest advertised wait; otherwise it is `Empty`.
pub fn fold_verdicts(verdicts: &[VariantVerdict]) -> EngineOutcome {
    if let Some(text) = verdicts.iter().find_map(|v| match v {
        VariantVerdict::Success(text) => Some(text.clone()),
        _ => None,
    }) {
        return EngineOutcome::Success(text);
    }
    let shortest_wait = verdicts
        .iter()
        .filter_map(|v| match v {
            VariantVerdict::QuotaExhausted(wait) => Some(*wait),
            _ => None,
        })
        .min();
    match shortest_wait {
        Some(wait) => EngineOutcome::QuotaExhausted(wait),
        None => EngineOutcome::Empty,
    }
}
