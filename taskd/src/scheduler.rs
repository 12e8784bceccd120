//! Polling scheduler: one tick gives every user at most one phase transition.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::codec::MalformedRecord;
use crate::core::phase::block_reason;
use crate::deferral;
use crate::io::config::WorkerConfig;
use crate::io::engine::{CliRunner, Engine, FallbackEngine};
use crate::io::notify::{Notifier, OutboxNotifier};
use crate::io::prompt::PromptBuilder;
use crate::io::publish::{Publisher, SyncPublisher};
use crate::io::record_store::{Namespace, UserSpace, list_users};
use crate::io::status::StatusBoard;
use crate::machine::{MachineSettings, TaskMachine, Transition};

/// Which record a tick touched, and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advanced {
    pub user_id: String,
    pub task: String,
    pub transition: Transition,
}

/// Summary of a single tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub advanced: Vec<Advanced>,
    /// `(user, task)` moved back from the deferred namespace.
    pub resumed: Vec<(String, String)>,
    /// `(user, task)` skipped because they do not parse.
    pub malformed: Vec<(String, String)>,
    /// `(user, task or "-", error)` isolated so the tick could go on.
    pub errors: Vec<(String, String, String)>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.advanced.is_empty() && self.resumed.is_empty()
    }
}

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// The configured tick limit was reached.
    MaxTicks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ticks: u64,
    pub transitions: usize,
    pub stop: RunStop,
}

pub struct Scheduler<E, N, P> {
    users_root: PathBuf,
    machine: TaskMachine<E, N, P>,
    status: StatusBoard,
}

/// The production wiring: CLI engine variants, file outbox, configured sync.
pub type WorkerScheduler = Scheduler<FallbackEngine<CliRunner>, OutboxNotifier, SyncPublisher>;

impl WorkerScheduler {
    pub fn from_config(cfg: &WorkerConfig) -> Result<Self> {
        let machine = TaskMachine::new(
            FallbackEngine::from_config(&cfg.engine),
            OutboxNotifier::new(cfg.outbox_dir()),
            SyncPublisher::from_config(cfg),
            PromptBuilder::new(cfg.prompt_budget_bytes)?,
            MachineSettings::from_config(cfg),
        );
        Ok(Self::new(
            cfg.users_root.clone(),
            machine,
            StatusBoard::new(cfg.current_task_path()),
        ))
    }
}

impl<E: Engine, N: Notifier, P: Publisher> Scheduler<E, N, P> {
    pub fn new(users_root: impl Into<PathBuf>, machine: TaskMachine<E, N, P>, status: StatusBoard) -> Self {
        Self {
            users_root: users_root.into(),
            machine,
            status,
        }
    }

    pub fn machine(&self) -> &TaskMachine<E, N, P> {
        &self.machine
    }

    /// Reconcile deferred records, then advance the first eligible record of each user.
    ///
    /// Only a failure to enumerate users fails the tick; everything per user or per
    /// record is logged, reported and skipped.
    #[instrument(skip_all)]
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let users = list_users(&self.users_root)
            .with_context(|| format!("list users under {}", self.users_root.display()))?;
        let mut report = TickReport::default();

        for space in &users {
            match deferral::reconcile(space, now) {
                Ok(out) => {
                    report
                        .resumed
                        .extend(out.resumed.into_iter().map(|id| (space.user_id.clone(), id)));
                    report
                        .malformed
                        .extend(out.malformed.into_iter().map(|id| (space.user_id.clone(), id)));
                    report.errors.extend(
                        out.errors
                            .into_iter()
                            .map(|(id, err)| (space.user_id.clone(), id, err)),
                    );
                }
                Err(err) => {
                    warn!(user = %space.user_id, err = %format!("{err:#}"), "reconcile failed");
                    report
                        .errors
                        .push((space.user_id.clone(), "-".to_string(), format!("{err:#}")));
                }
            }
        }

        for space in &users {
            self.tick_user(space, now, &mut report);
        }

        if report.is_idle() {
            debug!("tick idle");
        } else {
            info!(
                advanced = report.advanced.len(),
                resumed = report.resumed.len(),
                malformed = report.malformed.len(),
                errors = report.errors.len(),
                "tick finished"
            );
        }
        Ok(report)
    }

    fn tick_user(&self, space: &UserSpace, tick_at: DateTime<Utc>, report: &mut TickReport) {
        // Earlier users' engine calls may have taken minutes.
        let now = self.machine.now_at_least(tick_at);
        let ids = match space.list(Namespace::Active) {
            Ok(ids) => ids,
            Err(err) => {
                warn!(user = %space.user_id, err = %format!("{err:#}"), "list active records");
                report
                    .errors
                    .push((space.user_id.clone(), "-".to_string(), format!("{err:#}")));
                return;
            }
        };

        for id in ids {
            let record = match space.load(Namespace::Active, &id) {
                Ok(record) => record,
                Err(err) => {
                    if err.downcast_ref::<MalformedRecord>().is_some() {
                        warn!(user = %space.user_id, task = %id, err = %err, "skipping malformed record");
                        report.malformed.push((space.user_id.clone(), id));
                    } else {
                        warn!(user = %space.user_id, task = %id, err = %format!("{err:#}"), "load record");
                        report
                            .errors
                            .push((space.user_id.clone(), id, format!("{err:#}")));
                    }
                    continue;
                }
            };
            if let Some(reason) = block_reason(&record, now) {
                debug!(user = %space.user_id, task = %id, ?reason, "record not eligible");
                continue;
            }

            let _current = self.status.begin(&id, &space.user_id, now);
            match self.machine.advance(space, record, now) {
                Ok(transition) => {
                    info!(user = %space.user_id, task = %id, %transition, "record advanced");
                    report.advanced.push(Advanced {
                        user_id: space.user_id.clone(),
                        task: id,
                        transition,
                    });
                }
                Err(err) => {
                    error!(user = %space.user_id, task = %id, err = %format!("{err:#}"), "advance failed");
                    report
                        .errors
                        .push((space.user_id.clone(), id, format!("{err:#}")));
                }
            }
            return;
        }
    }

    /// Tick forever, or `max_ticks` times, sleeping `interval` between ticks.
    pub fn run(&self, interval: Duration, max_ticks: Option<u64>) -> Result<RunOutcome> {
        let mut ticks = 0u64;
        let mut transitions = 0usize;
        info!(users_root = %self.users_root.display(), ?interval, "scheduler started");
        loop {
            match self.tick(self.machine.now()) {
                Ok(report) => transitions += report.advanced.len(),
                Err(err) => error!(err = %format!("{err:#}"), "tick failed"),
            }
            ticks += 1;
            if max_ticks.is_some_and(|max| ticks >= max) {
                return Ok(RunOutcome {
                    ticks,
                    transitions,
                    stop: RunStop::MaxTicks,
                });
            }
            thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EngineOutcome;
    use crate::record::{Record, Step, StepState};
    use crate::test_support::{
        ManualClock, RecordingNotifier, RecordingPublisher, ScriptedEngine, SlowEngine, TestUsers,
    };
    use chrono::{TimeDelta, TimeZone};
    use std::fs;

    type TestScheduler = Scheduler<ScriptedEngine, RecordingNotifier, RecordingPublisher>;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn scheduler(users: &TestUsers, outcomes: Vec<EngineOutcome>) -> TestScheduler {
        let machine = TaskMachine::new(
            ScriptedEngine::new(outcomes),
            RecordingNotifier::default(),
            RecordingPublisher::default(),
            PromptBuilder::new(100_000).expect("prompts"),
            MachineSettings::default(),
        )
        .with_clock(now);
        Scheduler::new(
            users.root(),
            machine,
            StatusBoard::new(users.root().join("current_task.json")),
        )
    }

    fn pending(id: &str, steps: &[&str]) -> Record {
        let mut record = Record::new(id, "do things");
        record.plan = steps.iter().map(|s| Step::pending(*s)).collect();
        record
    }

    #[test]
    fn one_transition_per_user_per_tick() {
        let users = TestUsers::new().expect("users");
        let alice = users.user("1").expect("user");
        let bob = users.user("2").expect("user");
        alice.save(Namespace::Active, &pending("a.md", &["one"])).expect("save");
        alice.save(Namespace::Active, &pending("b.md", &["two"])).expect("save");
        bob.save(Namespace::Active, &pending("c.md", &["three"])).expect("save");
        let s = scheduler(
            &users,
            vec![
                EngineOutcome::Success("r1".to_string()),
                EngineOutcome::Success("r3".to_string()),
            ],
        );

        let report = s.tick(now()).expect("tick");
        let touched: Vec<(&str, &str)> = report
            .advanced
            .iter()
            .map(|a| (a.user_id.as_str(), a.task.as_str()))
            .collect();
        assert_eq!(touched, vec![("1", "a.md"), ("2", "c.md")]);
        let untouched = alice.load(Namespace::Active, "b.md").expect("load");
        assert_eq!(untouched.plan[0].state, StepState::Pending);
        assert!(!users.root().join("current_task.json").exists());
    }

    #[test]
    fn malformed_and_blocked_records_are_skipped() {
        let users = TestUsers::new().expect("users");
        let space = users
            .write_task("1", "a.md", "no metadata here\n# Plan\n")
            .expect("write");
        let mut blocked = pending("b.md", &["one"]);
        blocked.meta.set_flag(crate::record::StatusFlag::Blocked);
        space.save(Namespace::Active, &blocked).expect("save");
        space.save(Namespace::Active, &pending("c.md", &["two"])).expect("save");
        let s = scheduler(&users, vec![EngineOutcome::Success("done".to_string())]);

        let report = s.tick(now()).expect("tick");
        assert_eq!(report.malformed, vec![("1".to_string(), "a.md".to_string())]);
        assert_eq!(report.advanced.len(), 1);
        assert_eq!(report.advanced[0].task, "c.md");
        assert_eq!(
            fs::read_to_string(space.path(Namespace::Active, "a.md")).expect("read"),
            "no metadata here\n# Plan\n"
        );
    }

    #[test]
    fn advance_error_does_not_stop_other_users() {
        let users = TestUsers::new().expect("users");
        let alice = users.user("1").expect("user");
        let bob = users.user("2").expect("user");
        let mut answered = pending("a.md", &[]);
        answered.plan = vec![Step {
            text: "one".to_string(),
            state: StepState::Done,
        }];
        answered.history = "<answer>x</answer>".to_string();
        alice.save(Namespace::Active, &answered).expect("save");
        // An archived copy makes the archive move fail.
        alice.save(Namespace::Archived, &answered).expect("save");
        bob.save(Namespace::Active, &pending("b.md", &["two"])).expect("save");
        let s = scheduler(&users, vec![EngineOutcome::Success("ok".to_string())]);

        let report = s.tick(now()).expect("tick");
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "1");
        assert_eq!(report.advanced.len(), 1);
        assert_eq!(report.advanced[0].user_id, "2");
    }

    #[test]
    fn run_stops_after_max_ticks() {
        let users = TestUsers::new().expect("users");
        let s = scheduler(&users, Vec::new());
        let outcome = s.run(Duration::from_millis(1), Some(2)).expect("run");
        assert_eq!(
            outcome,
            RunOutcome {
                ticks: 2,
                transitions: 0,
                stop: RunStop::MaxTicks
            }
        );
    }

    #[test]
    fn later_users_see_time_spent_on_earlier_users() {
        let users = TestUsers::new().expect("users");
        let alice = users.user("1").expect("user");
        let bob = users.user("2").expect("user");
        alice.save(Namespace::Active, &pending("a.md", &["one"])).expect("save");
        bob.save(Namespace::Active, &pending("b.md", &["two"])).expect("save");
        let clock = ManualClock::new(now());
        let machine = TaskMachine::new(
            SlowEngine::new(
                clock.clone(),
                vec![
                    (TimeDelta::seconds(300), EngineOutcome::Success("done".to_string())),
                    (TimeDelta::zero(), EngineOutcome::QuotaExhausted(Duration::from_secs(1))),
                ],
            ),
            RecordingNotifier::default(),
            RecordingPublisher::default(),
            PromptBuilder::new(100_000).expect("prompts"),
            MachineSettings::default(),
        )
        .with_clock(clock.reader());
        let s = Scheduler::new(
            users.root(),
            machine,
            StatusBoard::new(users.root().join("current_task.json")),
        );

        let report = s.tick(now()).expect("tick");
        assert_eq!(report.advanced.len(), 2);
        let deferred = bob.load(Namespace::Deferred, "b.md").expect("load");
        let resume_at = deferred.meta.run_after.expect("run_after");
        assert_eq!(resume_at, now() + TimeDelta::seconds(301));
        assert!(resume_at > clock.now());
        let sent = s.machine().notifier().sent();
        assert!(sent[0].created_at < resume_at);

        // Not resumed until the wait has passed on the clock that wrote it.
        let report = s.tick(now() + TimeDelta::seconds(10)).expect("tick");
        assert!(report.resumed.is_empty());
        assert!(bob.contains(Namespace::Deferred, "b.md"));
    }
}
