//! Test-only fakes for the engine, notifier and publisher, plus user fixtures.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tempfile::TempDir;

use crate::core::types::EngineOutcome;
use crate::io::engine::{Engine, EngineRequest};
use crate::io::notify::{Notification, Notifier};
use crate::io::publish::Publisher;
use crate::io::record_store::UserSpace;

/// Engine that replays a fixed queue of outcomes and records every prompt.
///
/// Once the queue is empty every call returns [`EngineOutcome::Empty`].
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    outcomes: RefCell<VecDeque<EngineOutcome>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new(outcomes: Vec<EngineOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Engine for ScriptedEngine {
    fn invoke(&self, request: &EngineRequest) -> EngineOutcome {
        self.prompts.borrow_mut().push(request.prompt.clone());
        self.outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or(EngineOutcome::Empty)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    pub fn advance(&self, by: TimeDelta) {
        self.now.set(self.now.get() + by);
    }

    /// Closure for `TaskMachine::with_clock`.
    pub fn reader(&self) -> impl Fn() -> DateTime<Utc> + 'static {
        let now = Rc::clone(&self.now);
        move || now.get()
    }
}

/// Scripted engine whose calls take time on a [`ManualClock`].
///
/// Each call advances the clock by the next queued duration (zero once the queue
/// runs out) before returning the scripted outcome.
#[derive(Debug)]
pub struct SlowEngine {
    inner: ScriptedEngine,
    clock: ManualClock,
    durations: RefCell<VecDeque<TimeDelta>>,
}

impl SlowEngine {
    pub fn new(clock: ManualClock, calls: Vec<(TimeDelta, EngineOutcome)>) -> Self {
        let (durations, outcomes): (VecDeque<_>, Vec<_>) = calls.into_iter().unzip();
        Self {
            inner: ScriptedEngine::new(outcomes),
            clock,
            durations: RefCell::new(durations),
        }
    }
}

impl Engine for SlowEngine {
    fn invoke(&self, request: &EngineRequest) -> EngineOutcome {
        let took = self
            .durations
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(TimeDelta::zero);
        self.clock.advance(took);
        self.inner.invoke(request)
    }
}

/// Notifier that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RefCell<Vec<Notification>>,
    fail: bool,
}

impl RecordingNotifier {
    /// A notifier whose deliveries always fail (after being recorded).
    pub fn failing() -> Self {
        Self {
            sent: RefCell::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.borrow().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) -> Result<()> {
        self.sent.borrow_mut().push(notification.clone());
        if self.fail {
            return Err(anyhow!("outbox unavailable"));
        }
        Ok(())
    }
}

/// Publisher that records `(user_id, description)` pairs.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: RefCell<Vec<(String, String)>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.borrow().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, user_id: &str, description: &str) {
        self.published
            .borrow_mut()
            .push((user_id.to_string(), description.to_string()));
    }
}

/// Temporary users root with helpers for writing raw record files.
pub struct TestUsers {
    temp: TempDir,
}

impl TestUsers {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Space for `user_id`, with its active task directory created.
    pub fn user(&self, user_id: &str) -> Result<UserSpace> {
        let space = UserSpace::under(self.root(), user_id);
        fs::create_dir_all(space.tasks_dir())?;
        Ok(space)
    }

    /// Write `contents` verbatim as active record `id` of `user_id`.
    pub fn write_task(&self, user_id: &str, id: &str, contents: &str) -> Result<UserSpace> {
        let space = self.user(user_id)?;
        fs::write(space.tasks_dir().join(id), contents)?;
        Ok(space)
    }
}
