//! Task state machine: one phase transition per invocation.
//!
//! Writes are ordered so that a crash between any two of them leaves a record the
//! next invocation can finish: a step is persisted as in progress before the
//! engine is called, and its result and state are persisted together.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::markup;
use crate::core::phase::{BlockReason, Phase, classify};
use crate::core::plan;
use crate::core::types::EngineOutcome;
use crate::deferral;
use crate::io::config::WorkerConfig;
use crate::io::context::{UserContext, load_parent_summary, load_user_context};
use crate::io::engine::{Engine, EngineRequest, UserEnv};
use crate::io::notify::{Notification, Notifier};
use crate::io::prompt::{ExecutionInput, FinalizationInput, PlanningInput, PromptBuilder};
use crate::io::publish::Publisher;
use crate::io::record_store::{Namespace, UserSpace};
use crate::record::{Record, ResultBlock, StatusFlag, StepState};

/// Tunables for the state machine, taken from [`WorkerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    pub core_instructions_dir: Option<PathBuf>,
    pub engine_timeout: Duration,
    pub planning_retry: Duration,
    pub finalize_retry: Duration,
    pub max_finalize_attempts: u32,
}

impl MachineSettings {
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self {
            core_instructions_dir: cfg.core_instructions_dir.clone(),
            engine_timeout: cfg.engine.timeout(),
            planning_retry: Duration::from_secs(cfg.planning_retry_secs),
            finalize_retry: Duration::from_secs(cfg.finalize_retry_secs),
            max_finalize_attempts: cfg.max_finalize_attempts,
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

/// What one invocation did to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Blocked(BlockReason),
    Planned { steps: usize },
    /// No usable plan; the record is untouched apart from an optional backoff.
    PlanningFailed,
    StepDone { step: String, recovered: usize },
    /// The engine gave nothing; the step is marked failed and never retried.
    StepFailed { step: String, recovered: usize },
    /// The step reply asked the user to confirm; the record waits for a decision.
    ConfirmationRequested { step: String },
    FinalizeRetry { attempts: u32 },
    /// Result appended and record archived. `synthesized` when the engine never
    /// produced a final answer and one was assembled from the plan.
    Finalized { synthesized: bool },
    Archived,
    Deferred { phase: &'static str, resume_at: DateTime<Utc> },
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(reason) => write!(f, "blocked ({reason:?})"),
            Self::Planned { steps } => write!(f, "planned {steps} steps"),
            Self::PlanningFailed => f.write_str("planning failed"),
            Self::StepDone { step, recovered } => {
                write!(f, "step done: {step}")?;
                if *recovered > 0 {
                    write!(f, " (recovered {recovered})")?;
                }
                Ok(())
            }
            Self::StepFailed { step, recovered } => {
                write!(f, "step failed: {step}")?;
                if *recovered > 0 {
                    write!(f, " (recovered {recovered})")?;
                }
                Ok(())
            }
            Self::ConfirmationRequested { step } => write!(f, "awaiting confirmation after: {step}"),
            Self::FinalizeRetry { attempts } => write!(f, "finalization retry ({attempts})"),
            Self::Finalized { synthesized: false } => f.write_str("finalized and archived"),
            Self::Finalized { synthesized: true } => {
                f.write_str("finalized from plan and archived")
            }
            Self::Archived => f.write_str("archived"),
            Self::Deferred { phase, resume_at } => {
                write!(f, "deferred during {phase} until {resume_at}")
            }
        }
    }
}

/// Source of the current time. Read again whenever an engine call returns.
pub type Clock = Box<dyn Fn() -> DateTime<Utc>>;

/// Drives one record through its lifecycle.
pub struct TaskMachine<E, N, P> {
    engine: E,
    notifier: N,
    publisher: P,
    prompts: PromptBuilder,
    settings: MachineSettings,
    clock: Clock,
}

impl<E: Engine, N: Notifier, P: Publisher> TaskMachine<E, N, P> {
    pub fn new(
        engine: E,
        notifier: N,
        publisher: P,
        prompts: PromptBuilder,
        settings: MachineSettings,
    ) -> Self {
        Self {
            engine,
            notifier,
            publisher,
            prompts,
            settings,
            clock: Box::new(Utc::now),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// The current time, never earlier than `floor`.
    pub fn now_at_least(&self, floor: DateTime<Utc>) -> DateTime<Utc> {
        self.now().max(floor)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Advance an active record by exactly one phase.
    #[instrument(skip_all, fields(user = %space.user_id, task = %record.id))]
    pub fn advance(
        &self,
        space: &UserSpace,
        record: Record,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let phase = classify(&record, now);
        debug!(phase = phase.name(), "advancing record");
        match phase {
            Phase::Blocked(reason) => Ok(Transition::Blocked(reason)),
            Phase::Planning => self.plan(space, record, now),
            Phase::Recovery | Phase::Executing => self.execute(space, record, now),
            Phase::Finalizing => self.finalize(space, record, now),
            Phase::Archived => {
                self.archive(space, &record.id)?;
                Ok(Transition::Archived)
            }
        }
    }

    fn plan(&self, space: &UserSpace, mut record: Record, now: DateTime<Utc>) -> Result<Transition> {
        let ctx = self.user_context(space)?;
        let parent = record
            .meta
            .parent_task_id
            .as_deref()
            .and_then(|id| load_parent_summary(space, id));
        let prompt = self.prompts.planning(&PlanningInput {
            context: &ctx,
            request: &record.request,
            parent: parent.as_ref(),
        })?;

        let outcome = self.engine.invoke(&self.request(space, prompt));
        let now = self.now_at_least(now);
        match outcome {
            EngineOutcome::Success(reply) => {
                let steps = plan::plan_from_reply(&reply);
                if steps.is_empty() {
                    warn!("planning reply had no plan items");
                    return self.planning_failed(space, record, now);
                }
                let count = steps.len();
                record.plan = steps;
                self.persist(space, &mut record, now)?;
                info!(steps = count, "plan created");
                Ok(Transition::Planned { steps: count })
            }
            EngineOutcome::Empty => self.planning_failed(space, record, now),
            EngineOutcome::QuotaExhausted(wait) => self.defer(space, record, wait, now, "planning"),
        }
    }

    fn planning_failed(
        &self,
        space: &UserSpace,
        mut record: Record,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        if !self.settings.planning_retry.is_zero() {
            record.meta.run_after = Some(after(now, self.settings.planning_retry));
            self.persist(space, &mut record, now)?;
        }
        warn!("planning failed, will retry");
        Ok(Transition::PlanningFailed)
    }

    fn execute(&self, space: &UserSpace, mut record: Record, now: DateTime<Utc>) -> Result<Transition> {
        let recovered = plan::recover(&mut record.plan).len();
        if recovered > 0 {
            info!(recovered, "reset interrupted steps");
        }
        let Some(idx) = plan::first_pending(&record.plan) else {
            bail!("{} has no pending step", record.id);
        };
        record.plan[idx].state = StepState::InProgress;
        self.persist(space, &mut record, now)?;

        let step = record.plan[idx].text.clone();
        let ctx = self.user_context(space)?;
        let decision = markup::latest_decision(&record.appendable_text());
        let prompt = self.prompts.execution(&ExecutionInput {
            context: &ctx,
            request: &record.request,
            plan: &record.plan,
            step: &step,
            history: &record.history,
            decision: decision.as_deref(),
        })?;
        info!(step = %step, "executing step");

        let outcome = self.engine.invoke(&self.request(space, prompt));
        let now = self.now_at_least(now);
        match outcome {
            EngineOutcome::Success(reply) => {
                record.plan[idx].state = StepState::Done;
                markup::append_entry(&mut record.history, &markup::step_entry(&step, &reply));
                self.persist(space, &mut record, now)?;
                if markup::confirmation_pending(&reply) {
                    self.request_confirmation(space, &record, &reply, now);
                    return Ok(Transition::ConfirmationRequested { step });
                }
                Ok(Transition::StepDone { step, recovered })
            }
            EngineOutcome::Empty => {
                record.plan[idx].state = StepState::Failed;
                markup::append_entry(&mut record.history, &markup::failed_step_entry(&step));
                self.persist(space, &mut record, now)?;
                warn!(step = %step, "step failed");
                Ok(Transition::StepFailed { step, recovered })
            }
            EngineOutcome::QuotaExhausted(wait) => self.defer(space, record, wait, now, "executing"),
        }
    }

    fn request_confirmation(&self, space: &UserSpace, record: &Record, reply: &str, now: DateTime<Utc>) {
        let text = markup::confirmation_question(reply)
            .unwrap_or_else(|| "The task needs your confirmation to continue.".to_string());
        let notification = Notification {
            recipient: record.recipient().unwrap_or_else(|| space.user_id.clone()),
            text,
            task_id: record.id.clone(),
            created_at: now,
        };
        if let Err(err) = self.notifier.notify(&notification) {
            warn!(err = %format!("{err:#}"), "confirmation notification failed");
        }
        info!("waiting for user decision");
    }

    fn finalize(&self, space: &UserSpace, mut record: Record, now: DateTime<Utc>) -> Result<Transition> {
        let ctx = self.user_context(space)?;
        let prompt = self.prompts.finalization(&FinalizationInput {
            context: &ctx,
            request: &record.request,
            history: &record.history,
        })?;

        let outcome = self.engine.invoke(&self.request(space, prompt));
        let now = self.now_at_least(now);
        let (body, synthesized) = match outcome {
            EngineOutcome::Success(reply) => (markup::wrap_answer(&reply), false),
            EngineOutcome::Empty => {
                record.meta.finalize_attempts += 1;
                let attempts = record.meta.finalize_attempts;
                if attempts < self.settings.max_finalize_attempts {
                    record.meta.run_after = Some(after(now, self.settings.finalize_retry));
                    self.persist(space, &mut record, now)?;
                    warn!(attempts, "empty finalization reply, will retry");
                    return Ok(Transition::FinalizeRetry { attempts });
                }
                warn!(attempts, "no final answer from engine, using step results");
                (markup::wrap_answer(&synthesize_answer(&record)), true)
            }
            EngineOutcome::QuotaExhausted(wait) => {
                return self.defer(space, record, wait, now, "finalizing");
            }
        };

        record.meta.finalize_attempts = 0;
        append_result(&mut record, markup::result_heading(now), body);
        self.persist(space, &mut record, now)?;
        self.archive(space, &record.id)?;
        Ok(Transition::Finalized { synthesized })
    }

    fn archive(&self, space: &UserSpace, id: &str) -> Result<()> {
        space.relocate(id, Namespace::Active, Namespace::Archived)?;
        info!("record archived");
        self.publisher
            .publish(&space.user_id, &format!("Task {id} completed"));
        Ok(())
    }

    fn defer(
        &self,
        space: &UserSpace,
        record: Record,
        wait: Duration,
        now: DateTime<Utc>,
        phase: &'static str,
    ) -> Result<Transition> {
        let resume_at = deferral::defer(space, record, wait, now, &self.notifier)?;
        Ok(Transition::Deferred { phase, resume_at })
    }

    /// Write an active record, dropping scheduling metadata that has expired.
    fn persist(&self, space: &UserSpace, record: &mut Record, now: DateTime<Utc>) -> Result<()> {
        if record.meta.run_after.is_some_and(|at| at <= now) {
            record.meta.run_after = None;
        }
        if record.meta.run_after.is_none() {
            record.meta.clear_flag(StatusFlag::DeferredQuota);
        }
        space
            .save(Namespace::Active, record)
            .with_context(|| format!("persist {}", record.id))
    }

    fn user_context(&self, space: &UserSpace) -> Result<UserContext> {
        load_user_context(self.settings.core_instructions_dir.as_deref(), space)
    }

    fn request(&self, space: &UserSpace, prompt: String) -> EngineRequest {
        EngineRequest {
            prompt,
            env: UserEnv {
                user_id: space.user_id.clone(),
                home: space.root.clone(),
            },
            timeout: self.settings.engine_timeout,
        }
    }
}

fn after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    deferral::resume_time(now, wait)
}

/// Best-effort answer assembled from step results when the engine never produced one.
fn synthesize_answer(record: &Record) -> String {
    let mut out = String::from("I could not prepare a final summary. Here is what was done:\n");
    for step in &record.plan {
        let mark = match step.state {
            StepState::Done => "done",
            StepState::Failed => "failed",
            StepState::Pending | StepState::InProgress => "not run",
        };
        out.push_str(&format!("\n- {} ({mark})", step.text));
    }
    out
}

fn append_result(record: &mut Record, heading: String, body: String) {
    match record.result.as_mut() {
        // A result block without an answer (written by hand, say) is kept above the new one.
        Some(existing) => {
            existing.body = format!("{}\n\n{heading}\n{body}", existing.body.trim_end());
        }
        None => record.result = Some(ResultBlock { heading, body }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Step;
    use crate::test_support::{
        ManualClock, RecordingNotifier, RecordingPublisher, ScriptedEngine, SlowEngine,
    };
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn machine(
        outcomes: Vec<EngineOutcome>,
        settings: MachineSettings,
    ) -> TaskMachine<ScriptedEngine, RecordingNotifier, RecordingPublisher> {
        TaskMachine::new(
            ScriptedEngine::new(outcomes),
            RecordingNotifier::default(),
            RecordingPublisher::default(),
            PromptBuilder::new(100_000).expect("prompts"),
            settings,
        )
        .with_clock(now)
    }

    /// Machine whose engine calls take the given time on `clock`.
    fn slow_machine(
        clock: &ManualClock,
        calls: Vec<(TimeDelta, EngineOutcome)>,
        settings: MachineSettings,
    ) -> TaskMachine<SlowEngine, RecordingNotifier, RecordingPublisher> {
        TaskMachine::new(
            SlowEngine::new(clock.clone(), calls),
            RecordingNotifier::default(),
            RecordingPublisher::default(),
            PromptBuilder::new(100_000).expect("prompts"),
            settings,
        )
        .with_clock(clock.reader())
    }

    fn setup(record: &Record) -> (tempfile::TempDir, UserSpace) {
        let temp = tempfile::tempdir().expect("tempdir");
        let space = UserSpace::under(temp.path(), "42");
        space.save(Namespace::Active, record).expect("save");
        (temp, space)
    }

    fn with_plan(states: &[(&str, StepState)]) -> Record {
        let mut record = Record::new("t.md", "report on sales");
        record.plan = states
            .iter()
            .map(|(text, state)| Step {
                text: (*text).to_string(),
                state: *state,
            })
            .collect();
        record
    }

    #[test]
    fn planning_only_touches_plan() {
        let mut record = Record::new("t.md", "report on sales");
        record.history = "--- USER REPLY ---\nuse Q3".to_string();
        let (_temp, space) = setup(&record);
        let m = machine(
            vec![EngineOutcome::Success("Plan:\n- [ ] fetch data\n- [ ] summarize".to_string())],
            MachineSettings::default(),
        );

        let t = m.advance(&space, record.clone(), now()).expect("advance");
        assert_eq!(t, Transition::Planned { steps: 2 });
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(saved.request, record.request);
        assert_eq!(saved.history, record.history);
        assert_eq!(saved.plan.len(), 2);
    }

    #[test]
    fn planning_failure_without_backoff_leaves_record_alone() {
        let record = Record::new("t.md", "x");
        let (_temp, space) = setup(&record);
        let before = space.read_raw(Namespace::Active, "t.md").expect("read");
        let m = machine(
            vec![EngineOutcome::Success("I am not sure.".to_string())],
            MachineSettings::default(),
        );

        assert_eq!(
            m.advance(&space, record, now()).expect("advance"),
            Transition::PlanningFailed
        );
        assert_eq!(space.read_raw(Namespace::Active, "t.md").expect("read"), before);
    }

    #[test]
    fn planning_failure_with_backoff_sets_run_after() {
        let record = Record::new("t.md", "x");
        let (_temp, space) = setup(&record);
        let settings = MachineSettings {
            planning_retry: Duration::from_secs(30),
            ..MachineSettings::default()
        };
        let m = machine(vec![EngineOutcome::Empty], settings);

        m.advance(&space, record, now()).expect("advance");
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(saved.meta.run_after, Some(now() + TimeDelta::seconds(30)));
        assert!(saved.plan.is_empty());
    }

    #[test]
    fn empty_step_reply_marks_failed_and_moves_on() {
        let record = with_plan(&[("fetch data", StepState::Pending), ("summarize", StepState::Pending)]);
        let (_temp, space) = setup(&record);
        let m = machine(vec![EngineOutcome::Empty], MachineSettings::default());

        let t = m.advance(&space, record, now()).expect("advance");
        assert_eq!(
            t,
            Transition::StepFailed {
                step: "fetch data".to_string(),
                recovered: 0
            }
        );
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(saved.plan[0].state, StepState::Failed);
        assert_eq!(saved.plan[1].state, StepState::Pending);
        assert!(saved.history.contains(markup::STEP_FAILED_NOTE));
    }

    #[test]
    fn confirmation_reply_blocks_and_notifies() {
        let mut record = with_plan(&[("delete files", StepState::Pending), ("report", StepState::Pending)]);
        record.meta.user_id = Some(crate::record::Ident::Number(42));
        let (_temp, space) = setup(&record);
        let m = machine(
            vec![EngineOutcome::Success(
                "Found 3 files.\n<confirm>Delete 3 files?</confirm>".to_string(),
            )],
            MachineSettings::default(),
        );

        let t = m.advance(&space, record, now()).expect("advance");
        assert_eq!(
            t,
            Transition::ConfirmationRequested {
                step: "delete files".to_string()
            }
        );
        let sent = m.notifier().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "Delete 3 files?");
        assert_eq!(sent[0].recipient, "42");

        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(
            classify(&saved, now()),
            Phase::Blocked(BlockReason::AwaitingConfirmation)
        );
    }

    #[test]
    fn decision_reaches_next_step_prompt() {
        let mut record = with_plan(&[("delete files", StepState::Done), ("report", StepState::Pending)]);
        record.history =
            "## delete files\n<confirm>Delete?</confirm>\n\n--- USER DECISION ---\nyes, go ahead".to_string();
        let (_temp, space) = setup(&record);
        let m = machine(
            vec![EngineOutcome::Success("deleted".to_string())],
            MachineSettings::default(),
        );

        m.advance(&space, record, now()).expect("advance");
        let prompts = m.engine().prompts();
        assert!(prompts[0].contains("User decision on the previous confirmation: yes, go ahead"));
    }

    #[test]
    fn empty_finalization_retries_then_synthesizes() {
        let record = with_plan(&[("fetch data", StepState::Done)]);
        let (_temp, space) = setup(&record);
        let settings = MachineSettings {
            finalize_retry: Duration::from_secs(60),
            max_finalize_attempts: 2,
            ..MachineSettings::default()
        };
        let m = machine(vec![EngineOutcome::Empty, EngineOutcome::Empty], settings);

        let t = m.advance(&space, record, now()).expect("advance");
        assert_eq!(t, Transition::FinalizeRetry { attempts: 1 });
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(saved.meta.finalize_attempts, 1);
        assert_eq!(saved.meta.run_after, Some(now() + TimeDelta::seconds(60)));

        let later = now() + TimeDelta::seconds(61);
        let t = m.advance(&space, saved, later).expect("advance");
        assert_eq!(t, Transition::Finalized { synthesized: true });
        let archived = space.load(Namespace::Archived, "t.md").expect("load");
        let answer = archived.answer().expect("answer");
        assert!(answer.contains("fetch data (done)"));
        assert_eq!(archived.meta.finalize_attempts, 0);
        assert_eq!(archived.meta.run_after, None);
        assert_eq!(m.publisher().published().len(), 1);
    }

    #[test]
    fn answered_record_is_archived_without_engine_call() {
        let mut record = with_plan(&[("fetch data", StepState::Done)]);
        record.history = "## fetch data\n<answer>leaked</answer>".to_string();
        let (_temp, space) = setup(&record);
        let m = machine(Vec::new(), MachineSettings::default());

        assert_eq!(
            m.advance(&space, record, now()).expect("advance"),
            Transition::Archived
        );
        assert!(space.contains(Namespace::Archived, "t.md"));
        assert!(m.engine().prompts().is_empty());
        assert_eq!(
            m.publisher().published(),
            vec![("42".to_string(), "Task t.md completed".to_string())]
        );
    }

    #[test]
    fn stale_deferral_flag_is_cleared_on_write() {
        let mut record = with_plan(&[("fetch data", StepState::Pending)]);
        record.meta.set_flag(StatusFlag::DeferredQuota);
        record.meta.run_after = Some(now() - TimeDelta::seconds(5));
        let (_temp, space) = setup(&record);
        let m = machine(
            vec![EngineOutcome::Success("rows".to_string())],
            MachineSettings::default(),
        );

        m.advance(&space, record, now()).expect("advance");
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert!(saved.meta.status_flags.is_empty());
        assert_eq!(saved.meta.run_after, None);
    }

    #[test]
    fn quota_during_finalization_defers() {
        let record = with_plan(&[("fetch data", StepState::Done)]);
        let (_temp, space) = setup(&record);
        let m = machine(
            vec![EngineOutcome::QuotaExhausted(Duration::from_secs(90))],
            MachineSettings::default(),
        );

        let t = m.advance(&space, record, now()).expect("advance");
        assert_eq!(
            t,
            Transition::Deferred {
                phase: "finalizing",
                resume_at: now() + TimeDelta::seconds(90)
            }
        );
        assert!(space.contains(Namespace::Deferred, "t.md"));
        assert_eq!(m.notifier().sent().len(), 1);
    }

    #[test]
    fn deferral_counts_from_when_a_slow_call_returns() {
        let record = with_plan(&[("fetch data", StepState::Pending)]);
        let (_temp, space) = setup(&record);
        let clock = ManualClock::new(now());
        let m = slow_machine(
            &clock,
            vec![(
                TimeDelta::seconds(300),
                EngineOutcome::QuotaExhausted(Duration::from_secs(56)),
            )],
            MachineSettings::default(),
        );

        let t = m.advance(&space, record, now()).expect("advance");
        let resume_at = now() + TimeDelta::seconds(356);
        assert_eq!(
            t,
            Transition::Deferred {
                phase: "executing",
                resume_at
            }
        );
        assert!(resume_at > clock.now());
        let deferred = space.load(Namespace::Deferred, "t.md").expect("load");
        assert_eq!(deferred.meta.run_after, Some(resume_at));
        let sent = m.notifier().sent();
        assert_eq!(sent[0].created_at, clock.now());
        assert!(sent[0].text.contains("12:05"));
    }

    #[test]
    fn backoffs_count_from_when_a_slow_call_returns() {
        let clock = ManualClock::new(now());
        let settings = MachineSettings {
            planning_retry: Duration::from_secs(30),
            finalize_retry: Duration::from_secs(60),
            max_finalize_attempts: 3,
            ..MachineSettings::default()
        };
        let m = slow_machine(
            &clock,
            vec![
                (TimeDelta::seconds(120), EngineOutcome::Empty),
                (TimeDelta::seconds(120), EngineOutcome::Empty),
            ],
            settings,
        );

        let planning = Record::new("p.md", "x");
        let (_temp, space) = setup(&planning);
        m.advance(&space, planning, now()).expect("plan");
        let saved = space.load(Namespace::Active, "p.md").expect("load");
        assert_eq!(saved.meta.run_after, Some(now() + TimeDelta::seconds(150)));

        let finalizing = with_plan(&[("fetch data", StepState::Done)]);
        space.save(Namespace::Active, &finalizing).expect("save");
        let t = m.advance(&space, finalizing, now()).expect("finalize");
        assert_eq!(t, Transition::FinalizeRetry { attempts: 1 });
        let saved = space.load(Namespace::Active, "t.md").expect("load");
        assert_eq!(saved.meta.run_after, Some(now() + TimeDelta::seconds(300)));
        assert!(saved.meta.run_after > Some(clock.now()));
    }
}
