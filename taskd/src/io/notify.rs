//! User notifications, delivered through a file outbox the front-end drains.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_atomic;

/// A `{recipient, text}` request for the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub text: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

pub trait Notifier {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes one JSON file per notification into `dir`.
///
/// File names sort in creation order (`<millis>-<seq>.json`).
#[derive(Debug)]
pub struct OutboxNotifier {
    dir: PathBuf,
    seq: AtomicU64,
}

impl OutboxNotifier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{:013}-{seq:06}.json",
            notification.created_at.timestamp_millis()
        );
        let path = self.dir.join(name);
        let mut buf =
            serde_json::to_string_pretty(notification).context("serialize notification")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(recipient = %notification.recipient, task = %notification.task_id, path = %path.display(), "notification queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    #[test]
    fn writes_one_file_per_notification_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outbox = OutboxNotifier::new(temp.path().join("outbox"));
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        for text in ["first", "second"] {
            outbox
                .notify(&Notification {
                    recipient: "100".to_string(),
                    text: text.to_string(),
                    task_id: "t.md".to_string(),
                    created_at: at,
                })
                .expect("notify");
        }

        let mut names: Vec<_> = fs::read_dir(temp.path().join("outbox"))
            .expect("read outbox")
            .map(|e| e.expect("entry").path())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        let first: Notification =
            serde_json::from_str(&fs::read_to_string(&names[0]).expect("read")).expect("json");
        assert_eq!(first.text, "first");
        assert_eq!(first.recipient, "100");
    }
}
