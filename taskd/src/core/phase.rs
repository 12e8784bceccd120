//! Phase classification for a single record.
//!
//! The phase is derived entirely from record content; nothing else is consulted.

use chrono::{DateTime, Utc};

use crate::core::markup;
use crate::core::plan;
use crate::record::{Record, StatusFlag};

/// Why a record cannot advance right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// A `<confirm>` request has no decision entry after it.
    AwaitingConfirmation,
    /// An explicit `blocked` or `needs_user_input` flag is set.
    Flagged(StatusFlag),
    /// `run_after` lies in the future.
    NotBefore(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Blocked(BlockReason),
    Planning,
    /// At least one step was left in progress by an interrupted run.
    Recovery,
    Executing,
    Finalizing,
    Archived,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::Planning => "planning",
            Self::Recovery => "recovery",
            Self::Executing => "executing",
            Self::Finalizing => "finalizing",
            Self::Archived => "archived",
        }
    }
}

/// First reason that keeps `record` from advancing at `now`, if any.
///
/// `deferred_quota` does not block on its own: a deferred record is held back by
/// its `run_after`, and the flag is cleared on the next write once that elapses.
pub fn block_reason(record: &Record, now: DateTime<Utc>) -> Option<BlockReason> {
    if markup::confirmation_pending(&record.appendable_text()) {
        return Some(BlockReason::AwaitingConfirmation);
    }
    for flag in [StatusFlag::Blocked, StatusFlag::NeedsUserInput] {
        if record.meta.has_flag(flag) {
            return Some(BlockReason::Flagged(flag));
        }
    }
    match record.meta.run_after {
        Some(at) if now < at => Some(BlockReason::NotBefore(at)),
        _ => None,
    }
}

pub fn classify(record: &Record, now: DateTime<Utc>) -> Phase {
    if let Some(reason) = block_reason(record, now) {
        return Phase::Blocked(reason);
    }
    if record.plan.is_empty() {
        return Phase::Planning;
    }
    if !plan::in_progress(&record.plan).is_empty() {
        return Phase::Recovery;
    }
    if plan::first_pending(&record.plan).is_some() {
        return Phase::Executing;
    }
    if record.answer().is_none() {
        return Phase::Finalizing;
    }
    Phase::Archived
}
