//! Quota deferral: park a record until the engine has capacity again, and bring
//! it back once its resume time passes.
//!
//! Both directions write the record before moving it, so an interrupted move
//! leaves a record whose metadata already matches its destination.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use tracing::{info, warn};

use crate::core::codec::MalformedRecord;
use crate::core::plan;
use crate::io::notify::{Notification, Notifier};
use crate::io::record_store::{Namespace, UserSpace};
use crate::record::{Record, StatusFlag};

/// Longest deferral honoured, whatever the engine advertises.
const MAX_DEFERRAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Earliest resume time for a wait starting at `now`.
///
/// Whole seconds, strictly after `now`.
pub fn resume_time(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    let secs = wait.min(MAX_DEFERRAL).as_secs().max(1);
    let delta = TimeDelta::try_seconds(secs as i64).unwrap_or(TimeDelta::days(7));
    now.trunc_subsecs(0) + delta
}

pub fn deferral_notice(resume_at: DateTime<Utc>) -> String {
    format!(
        "The reasoning engine is out of quota. Your task is paused and will resume around {} UTC.",
        resume_at.format("%H:%M")
    )
}

/// Move an active record to the deferred namespace and notify its owner.
///
/// Interrupted steps go back to `Pending` so the deferred record is at rest.
/// Returns the resume time.
pub fn defer<N: Notifier>(
    space: &UserSpace,
    mut record: Record,
    wait: Duration,
    now: DateTime<Utc>,
    notifier: &N,
) -> Result<DateTime<Utc>> {
    plan::recover(&mut record.plan);
    let resume_at = resume_time(now, wait);
    record.meta.run_after = Some(resume_at);
    record.meta.set_flag(StatusFlag::DeferredQuota);

    space.save(Namespace::Active, &record)?;
    space.relocate(&record.id, Namespace::Active, Namespace::Deferred)?;
    info!(user = %space.user_id, task = %record.id, resume_at = %resume_at, "record deferred");

    let notification = Notification {
        recipient: record
            .recipient()
            .unwrap_or_else(|| space.user_id.clone()),
        text: deferral_notice(resume_at),
        task_id: record.id.clone(),
        created_at: now,
    };
    if let Err(err) = notifier.notify(&notification) {
        warn!(user = %space.user_id, task = %record.id, err = %format!("{err:#}"), "deferral notification failed");
    }
    Ok(resume_at)
}

/// Result of reconciling one user's deferred namespace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub resumed: Vec<String>,
    pub malformed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Move every deferred record whose resume time has passed back to active.
pub fn reconcile(space: &UserSpace, now: DateTime<Utc>) -> Result<Reconciled> {
    let mut out = Reconciled::default();
    for id in space.list(Namespace::Deferred)? {
        match resume_one(space, &id, now) {
            Ok(true) => out.resumed.push(id),
            Ok(false) => {}
            Err(err) if err.downcast_ref::<MalformedRecord>().is_some() => {
                warn!(user = %space.user_id, task = %id, err = %err, "skipping malformed deferred record");
                out.malformed.push(id);
            }
            Err(err) => {
                warn!(user = %space.user_id, task = %id, err = %format!("{err:#}"), "resume failed");
                out.errors.push((id, format!("{err:#}")));
            }
        }
    }
    Ok(out)
}

fn resume_one(space: &UserSpace, id: &str, now: DateTime<Utc>) -> Result<bool> {
    let mut record = space.load(Namespace::Deferred, id)?;
    if record.meta.run_after.is_some_and(|at| now < at) {
        return Ok(false);
    }
    record.meta.clear_flag(StatusFlag::DeferredQuota);
    record.meta.run_after = None;
    space.save(Namespace::Deferred, &record)?;
    space.relocate(id, Namespace::Deferred, Namespace::Active)?;
    info!(user = %space.user_id, task = id, "deferred record resumed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Ident, Step, StepState};
    use crate::test_support::RecordingNotifier;
    use chrono::TimeZone;
    use std::fs;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn resume_time_is_whole_seconds_and_strictly_later() {
        let at = now() + TimeDelta::milliseconds(700);
        let resume = resume_time(at, Duration::from_millis(10));
        assert!(resume > at);
        assert_eq!(resume, now() + TimeDelta::seconds(1));
        assert_eq!(
            resume_time(now(), Duration::from_secs(120)),
            now() + TimeDelta::seconds(120)
        );
        assert_eq!(
            resume_time(now(), Duration::from_secs(u64::MAX)),
            now() + TimeDelta::days(7)
        );
    }

    #[test]
    fn defer_resets_steps_moves_record_and_notifies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let space = UserSpace::under(temp.path(), "42");
        let mut record = Record::new("t.md", "report");
        record.meta.chat_id = Some(Ident::Number(100));
        record.plan = vec![
            Step {
                text: "fetch data".to_string(),
                state: StepState::Done,
            },
            Step {
                text: "summarize".to_string(),
                state: StepState::InProgress,
            },
        ];
        space.save(Namespace::Active, &record).expect("save");
        let notifier = RecordingNotifier::default();

        let resume_at = defer(&space, record, Duration::from_secs(120), now(), &notifier)
            .expect("defer");

        assert_eq!(resume_at, now() + TimeDelta::seconds(120));
        assert!(!space.contains(Namespace::Active, "t.md"));
        let deferred = space.load(Namespace::Deferred, "t.md").expect("load");
        assert_eq!(deferred.plan[1].state, StepState::Pending);
        assert!(deferred.meta.has_flag(StatusFlag::DeferredQuota));
        assert_eq!(deferred.meta.run_after, Some(resume_at));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "100");
        assert!(sent[0].text.contains("12:02 UTC"));
    }

    #[test]
    fn reconcile_resumes_only_elapsed_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let space = UserSpace::under(temp.path(), "42");
        for (id, offset) in [("due.md", -5), ("later.md", 60)] {
            let mut record = Record::new(id, "x");
            record.meta.set_flag(StatusFlag::DeferredQuota);
            record.meta.run_after = Some(now() + TimeDelta::seconds(offset));
            space.save(Namespace::Deferred, &record).expect("save");
        }
        fs::write(space.path(Namespace::Deferred, "broken.md"), "garbage").expect("write");

        let out = reconcile(&space, now()).expect("reconcile");
        assert_eq!(out.resumed, vec!["due.md"]);
        assert_eq!(out.malformed, vec!["broken.md"]);
        assert!(out.errors.is_empty());

        let resumed = space.load(Namespace::Active, "due.md").expect("load");
        assert!(resumed.meta.status_flags.is_empty());
        assert_eq!(resumed.meta.run_after, None);
        assert!(space.contains(Namespace::Deferred, "later.md"));
        assert!(space.contains(Namespace::Deferred, "broken.md"));
    }
}
