//! Shared deterministic types for worker core logic.
//!
//! These types define the contracts between the engine client, the task state
//! machine and the deferral sink. They carry no I/O.

use std::time::Duration;

/// Classified result of one engine invocation across every configured variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Non-empty reply text from the first variant that produced one.
    Success(String),
    /// Every variant failed for a reason other than quota (timeout, empty output,
    /// launch failure), or failures were mixed.
    Empty,
    /// Every variant reported quota exhaustion. Carries the shortest advertised wait.
    QuotaExhausted(Duration),
}

/// Outcome of a single variant attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantVerdict {
    Success(String),
    Timeout,
    Empty,
    QuotaExhausted(Duration),
}

/// Captured output of a single variant attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReply {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}
