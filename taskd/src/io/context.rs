//! Prompt context gathered from disk: shared instructions, the user's own
//! instructions, memories and skills, and the parent task summary.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::io::record_store::{Namespace, UserSpace};

/// One context file, rendered into prompts as `FILE <name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFile {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserContext {
    pub core: Vec<ContextFile>,
    pub instructions: Vec<ContextFile>,
    pub memories: Vec<ContextFile>,
    pub skills: Option<String>,
}

/// Request and answer of the task a record follows up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentSummary {
    pub request: String,
    pub answer: Option<String>,
}

/// Load context for one user. Missing directories contribute nothing.
pub fn load_user_context(core_dir: Option<&Path>, space: &UserSpace) -> Result<UserContext> {
    let ctx = UserContext {
        core: match core_dir {
            Some(dir) => read_markdown_dir(dir)?,
            None => Vec::new(),
        },
        instructions: read_markdown_dir(&space.root.join("instructions"))?,
        memories: read_markdown_dir(&space.root.join("memories"))?,
        skills: read_optional(&space.root.join("skills").join("skills.md"))?,
    };
    debug!(
        user = %space.user_id,
        core = ctx.core.len(),
        instructions = ctx.instructions.len(),
        memories = ctx.memories.len(),
        skills = ctx.skills.is_some(),
        "user context loaded"
    );
    Ok(ctx)
}

/// Summary of `parent_id`, looked up in the active then the archived namespace.
///
/// A missing or unreadable parent yields `None`: it is only context, never a reason
/// to hold the child back.
pub fn load_parent_summary(space: &UserSpace, parent_id: &str) -> Option<ParentSummary> {
    for ns in [Namespace::Active, Namespace::Archived] {
        if !space.contains(ns, parent_id) {
            continue;
        }
        return match space.load(ns, parent_id) {
            Ok(parent) => Some(ParentSummary {
                answer: parent.answer(),
                request: parent.request,
            }),
            Err(err) => {
                warn!(user = %space.user_id, parent = parent_id, err = %format!("{err:#}"), "parent record unreadable");
                None
            }
        };
    }
    debug!(user = %space.user_id, parent = parent_id, "parent record not found");
    None
}

fn read_markdown_dir(dir: &Path) -> Result<Vec<ContextFile>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "md") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let body = fs::read_to_string(&path)
            .with_context(|| format!("read context file {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push(ContextFile { name, body });
    }
    Ok(files)
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read context file {}", path.display()))?;
    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, ResultBlock};

    /// Verifies every context source is read in file-name order and non-markdown
    /// files are ignored.
    #[test]
    fn loads_all_sources_in_name_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let core = temp.path().join("core");
        let space = UserSpace::under(temp.path(), "1");
        fs::create_dir_all(&core).expect("mkdir");
        fs::create_dir_all(space.root.join("instructions")).expect("mkdir");
        fs::create_dir_all(space.root.join("skills")).expect("mkdir");
        fs::write(core.join("b.md"), "core b").expect("write");
        fs::write(core.join("a.md"), "core a").expect("write");
        fs::write(core.join("readme.txt"), "skip").expect("write");
        fs::write(space.root.join("instructions").join("tone.md"), "be brief").expect("write");
        fs::write(space.root.join("skills").join("skills.md"), "search").expect("write");

        let ctx = load_user_context(Some(&core), &space).expect("context");
        let core_names: Vec<&str> = ctx.core.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(core_names, vec!["a.md", "b.md"]);
        assert_eq!(ctx.instructions[0].body, "be brief");
        assert!(ctx.memories.is_empty());
        assert_eq!(ctx.skills.as_deref(), Some("search"));
    }

    /// Verifies parent lookup falls through from active to archived records.
    #[test]
    fn parent_summary_checks_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let space = UserSpace::under(temp.path(), "1");
        let mut parent = Record::new("parent.md", "book a table");
        parent.result = Some(ResultBlock {
            heading: "--- RESULT (10:00) ---".to_string(),
            body: "<answer>Booked for 8pm</answer>".to_string(),
        });
        space.save(Namespace::Archived, &parent).expect("save");

        let summary = load_parent_summary(&space, "parent.md").expect("summary");
        assert_eq!(summary.request, "book a table");
        assert_eq!(summary.answer.as_deref(), Some("Booked for 8pm"));
        assert!(load_parent_summary(&space, "missing.md").is_none());
    }
}
