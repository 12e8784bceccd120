//! `current_task.json`: which record the worker is processing right now.
//!
//! Observability only; nothing reads it back. Failures are logged and ignored.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::atomic::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTask {
    pub task: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusBoard {
    path: PathBuf,
}

impl StatusBoard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Publish `task` as current. The file is removed when the guard drops,
    /// whichever way processing ends.
    pub fn begin(&self, task: &str, user_id: &str, now: DateTime<Utc>) -> StatusGuard<'_> {
        let current = CurrentTask {
            task: task.to_string(),
            user_id: user_id.to_string(),
            started_at: now,
        };
        let written = serde_json::to_string(&current)
            .map_err(anyhow::Error::from)
            .and_then(|json| write_atomic(&self.path, &json));
        if let Err(err) = written {
            warn!(path = %self.path.display(), err = %format!("{err:#}"), "write current task");
        }
        StatusGuard { board: self }
    }

    fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), err = %err, "clear current task"),
        }
    }
}

/// Clears `current_task.json` on drop.
#[must_use = "the current task is cleared when the guard drops"]
pub struct StatusGuard<'a> {
    board: &'a StatusBoard,
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.board.clear();
    }
}
