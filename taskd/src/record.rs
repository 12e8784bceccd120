//! Task record data model.
//!
//! A record is one task's full state: metadata written by collaborators plus the
//! engine-owned Plan and History sections. The text encoding lives in
//! [`crate::core::codec`]; this module only holds the in-memory shape.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::markup;

/// Owner identity as written by collaborators (numeric chat ids or plain strings).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Ident {
    Number(i64),
    Text(String),
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Explicit reasons a record must not be advanced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFlag {
    Blocked,
    NeedsUserInput,
    DeferredQuota,
}

/// Metadata block at the top of a record.
///
/// Keys the worker does not own are kept in `extra` and written back untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Ident>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<Ident>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, rename = "status", skip_serializing_if = "Vec::is_empty")]
    pub status_flags: Vec<StatusFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_after: Option<DateTime<Utc>>,
    /// Empty finalization replies seen so far.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub finalize_attempts: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl RecordMeta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn has_flag(&self, flag: StatusFlag) -> bool {
        self.status_flags.contains(&flag)
    }

    pub fn set_flag(&mut self, flag: StatusFlag) {
        if !self.has_flag(flag) {
            self.status_flags.push(flag);
        }
    }

    pub fn clear_flag(&mut self, flag: StatusFlag) {
        self.status_flags.retain(|f| *f != flag);
    }
}

/// Lifecycle state of one plan step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StepState {
    /// Checkbox glyph used in the Plan section (`- [x]`).
    pub fn glyph(self) -> char {
        match self {
            Self::Pending => ' ',
            Self::InProgress => '/',
            Self::Done => 'x',
            Self::Failed => '!',
        }
    }

    pub fn from_glyph(glyph: char) -> Option<Self> {
        match glyph {
            ' ' => Some(Self::Pending),
            '/' => Some(Self::InProgress),
            'x' | 'X' => Some(Self::Done),
            '!' => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub text: String,
    pub state: StepState,
}

impl Step {
    pub fn pending(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            state: StepState::Pending,
        }
    }
}

/// Trailing `--- RESULT (HH:MM) ---` block appended at finalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultBlock {
    /// Heading line, kept verbatim.
    pub heading: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// File name within the user's namespace.
    pub id: String,
    pub meta: RecordMeta,
    pub request: String,
    pub plan: Vec<Step>,
    pub history: String,
    pub result: Option<ResultBlock>,
}

impl Record {
    /// Fresh record with an empty plan, as a collaborator would create it.
    pub fn new(id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta: RecordMeta::default(),
            request: request.into(),
            plan: Vec::new(),
            history: String::new(),
            result: None,
        }
    }

    /// Final answer payload, if the record carries one.
    ///
    /// The Result block wins; a payload leaked into History by a step reply also counts.
    pub fn answer(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| markup::extract_answer(&r.body))
            .or_else(|| markup::extract_answer(&self.history))
    }

    /// Text that collaborators may append entries to (History, then Result).
    pub fn appendable_text(&self) -> String {
        match &self.result {
            Some(result) => format!("{}\n{}", self.history, result.body),
            None => self.history.clone(),
        }
    }

    /// Where replies, reactions and decisions are addressed.
    pub fn recipient(&self) -> Option<String> {
        self.meta
            .chat_id
            .as_ref()
            .or(self.meta.user_id.as_ref())
            .map(ToString::to_string)
    }
}
