//! Fire-and-forget sync trigger, invoked after a record is archived.
//!
//! Publishing never blocks the scheduler and never fails the owning task: work
//! runs on a background thread and errors are only logged.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::io::config::WorkerConfig;
use crate::io::git::Git;
use crate::io::record_store::UserSpace;

pub trait Publisher {
    fn publish(&self, user_id: &str, description: &str);
}

/// Commits the user's directory with git.
#[derive(Debug, Clone)]
pub struct GitPublisher {
    users_root: PathBuf,
}

impl GitPublisher {
    pub fn new(users_root: impl Into<PathBuf>) -> Self {
        Self {
            users_root: users_root.into(),
        }
    }

    /// Stage and commit everything in the user's directory. Returns whether a commit
    /// was made; a directory that is not a repository is skipped.
    pub fn commit(&self, user_id: &str, description: &str) -> Result<bool> {
        let space = UserSpace::under(&self.users_root, user_id);
        let git = Git::new(&space.root);
        if !git.is_repo_root() {
            debug!(user = user_id, "user directory is not a git repository, skipping sync");
            return Ok(false);
        }
        git.add_all()?;
        git.commit_staged(description)
    }
}

impl Publisher for GitPublisher {
    fn publish(&self, user_id: &str, description: &str) {
        let publisher = self.clone();
        let user_id = user_id.to_string();
        let description = description.to_string();
        thread::spawn(move || match publisher.commit(&user_id, &description) {
            Ok(true) => info!(user = %user_id, "user directory committed"),
            Ok(false) => {}
            Err(err) => warn!(user = %user_id, err = %format!("{err:#}"), "sync commit failed"),
        });
    }
}

/// Runs an external command with `user_id` and the description appended.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    command: Vec<String>,
}

impl CommandPublisher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn spawn(&self, user_id: &str, description: &str) -> Result<std::process::Child> {
        let (program, args) = self
            .command
            .split_first()
            .context("sync command is empty")?;
        Command::new(program)
            .args(args)
            .arg(user_id)
            .arg(description)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn sync command {program}"))
    }
}

impl Publisher for CommandPublisher {
    fn publish(&self, user_id: &str, description: &str) {
        match self.spawn(user_id, description) {
            Ok(mut child) => {
                let user_id = user_id.to_string();
                // Reap in the background so the child does not linger as a zombie.
                thread::spawn(move || match child.wait() {
                    Ok(status) if !status.success() => {
                        warn!(user = %user_id, exit_code = ?status.code(), "sync command failed");
                    }
                    Ok(_) => debug!(user = %user_id, "sync command finished"),
                    Err(err) => warn!(user = %user_id, err = %err, "wait for sync command"),
                });
            }
            Err(err) => warn!(user = user_id, err = %format!("{err:#}"), "sync trigger failed"),
        }
    }
}

/// Sync publisher selected by `[sync]` config.
#[derive(Debug, Clone)]
pub enum SyncPublisher {
    Git(GitPublisher),
    Command(CommandPublisher),
    Disabled,
}

impl SyncPublisher {
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        if !cfg.sync.enabled {
            return Self::Disabled;
        }
        if cfg.sync.command.is_empty() {
            Self::Git(GitPublisher::new(&cfg.users_root))
        } else {
            Self::Command(CommandPublisher::new(cfg.sync.command.clone()))
        }
    }
}

impl Publisher for SyncPublisher {
    fn publish(&self, user_id: &str, description: &str) {
        match self {
            Self::Git(publisher) => publisher.publish(user_id, description),
            Self::Command(publisher) => publisher.publish(user_id, description),
            Self::Disabled => debug!(user = user_id, "sync disabled"),
        }
    }
}
