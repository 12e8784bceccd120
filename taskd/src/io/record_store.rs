//! Per-user record storage.
//!
//! ```text
//! <users_root>/user_<id>/tasks/           active
//! <users_root>/user_<id>/tasks/deferred/  deferred (quota)
//! <users_root>/user_<id>/tasks/archive/   archived
//! ```
//!
//! Only `*.md` files directly inside a namespace directory are records. Other
//! subdirectories (`recurrent/` templates, for example) belong to collaborators.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::codec::{parse_record, render_record};
use crate::io::atomic::write_atomic;
use crate::record::Record;

const USER_DIR_PREFIX: &str = "user_";
const RECORD_EXT: &str = "md";

/// Lifecycle partition of a user's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Active,
    Deferred,
    Archived,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deferred => "deferred",
            Self::Archived => "archived",
        }
    }

    fn subdir(self) -> Option<&'static str> {
        match self {
            Self::Active => None,
            Self::Deferred => Some("deferred"),
            Self::Archived => Some("archive"),
        }
    }
}

/// One user's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSpace {
    pub user_id: String,
    pub root: PathBuf,
}

impl UserSpace {
    pub fn new(user_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            user_id: user_id.into(),
            root: root.into(),
        }
    }

    /// Space for `user_id` under `users_root`, whether or not it exists yet.
    pub fn under(users_root: &Path, user_id: &str) -> Self {
        Self::new(user_id, users_root.join(format!("{USER_DIR_PREFIX}{user_id}")))
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn dir(&self, ns: Namespace) -> PathBuf {
        let tasks = self.tasks_dir();
        match ns.subdir() {
            Some(sub) => tasks.join(sub),
            None => tasks,
        }
    }

    pub fn path(&self, ns: Namespace, id: &str) -> PathBuf {
        self.dir(ns).join(id)
    }

    pub fn contains(&self, ns: Namespace, id: &str) -> bool {
        self.path(ns, id).is_file()
    }

    /// Record ids in `ns`, sorted by file name.
    pub fn list(&self, ns: Namespace) -> Result<Vec<String>> {
        let dir = self.dir(ns);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != RECORD_EXT) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn read_raw(&self, ns: Namespace, id: &str) -> Result<String> {
        let path = self.path(ns, id);
        fs::read_to_string(&path).with_context(|| format!("read record {}", path.display()))
    }

    /// Load and parse a record. A schema violation surfaces as
    /// [`crate::core::codec::MalformedRecord`] (recoverable with `downcast_ref`).
    pub fn load(&self, ns: Namespace, id: &str) -> Result<Record> {
        let contents = self.read_raw(ns, id)?;
        Ok(parse_record(id, &contents)?)
    }

    /// Atomically write `record` into `ns`.
    pub fn save(&self, ns: Namespace, record: &Record) -> Result<()> {
        let path = self.path(ns, &record.id);
        debug!(user = %self.user_id, task = %record.id, namespace = ns.as_str(), "writing record");
        let contents = render_record(record)
            .with_context(|| format!("render record {}", record.id))?;
        write_atomic(&path, &contents)
    }

    /// Move a record between namespaces. Refuses to overwrite an existing record.
    pub fn relocate(&self, id: &str, from: Namespace, to: Namespace) -> Result<()> {
        let src = self.path(from, id);
        let dst = self.path(to, id);
        if dst.exists() {
            return Err(anyhow!(
                "cannot move {id} to {}: {} already exists",
                to.as_str(),
                dst.display()
            ));
        }
        let dir = self.dir(to);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        fs::rename(&src, &dst)
            .with_context(|| format!("move {} to {}", src.display(), dst.display()))?;
        debug!(user = %self.user_id, task = id, from = from.as_str(), to = to.as_str(), "record moved");
        Ok(())
    }
}

/// Every `user_<id>` directory under `users_root`, sorted by directory name.
pub fn list_users(users_root: &Path) -> Result<Vec<UserSpace>> {
    if !users_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut users = Vec::new();
    for entry in fs::read_dir(users_root)
        .with_context(|| format!("read users root {}", users_root.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", users_root.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(user_id) = name.strip_prefix(USER_DIR_PREFIX)
            && !user_id.is_empty()
        {
            users.push(UserSpace::new(user_id, &path));
        }
    }
    users.sort_by(|a, b| a.root.cmp(&b.root));
    Ok(users)
}
