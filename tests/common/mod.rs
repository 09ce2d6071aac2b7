//! Shared test helpers for integration tests.
//!
//! [`ScriptedCoordinator`] is an in-memory [`Coordinator`] that replays a
//! fetch script and records every submission, so pool and worker scenarios
//! run without sockets or timing-sensitive servers.

#![allow(dead_code)]

use mersenne_client::coordinator::Coordinator;
use mersenne_client::error::TransportError;
use mersenne_client::shared::SharedProgress;
use mersenne_client::task::{Capabilities, Task, TaskResult};
use mersenne_client::worker::WorkerSettings;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum FetchStep {
    Task(Task),
    Empty,
    Fail(TransportError),
}

pub struct ScriptedCoordinator {
    script: Mutex<VecDeque<FetchStep>>,
    exhausted: FetchStep,
    submit_failures: Mutex<VecDeque<TransportError>>,
    fail_all_submits: Option<TransportError>,
    submissions: Mutex<Vec<TaskResult>>,
    fetch_users: Mutex<Vec<String>>,
    fetch_calls: AtomicUsize,
    submit_calls: AtomicUsize,
    wait_for_arm: bool,
    failing_thread: Option<String>,
    stop_on_handout: OnceLock<Arc<SharedProgress>>,
    ping: Mutex<Result<(), TransportError>>,
}

impl Default for ScriptedCoordinator {
    fn default() -> Self {
        ScriptedCoordinator {
            script: Mutex::new(VecDeque::new()),
            exhausted: FetchStep::Empty,
            submit_failures: Mutex::new(VecDeque::new()),
            fail_all_submits: None,
            submissions: Mutex::new(Vec::new()),
            fetch_users: Mutex::new(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
            wait_for_arm: false,
            failing_thread: None,
            stop_on_handout: OnceLock::new(),
            ping: Mutex::new(Ok(())),
        }
    }
}

impl ScriptedCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one task per `(task_id, exponent)`.
    pub fn with_tasks(self, tasks: &[(u64, u64)]) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            for &(id, p) in tasks {
                script.push_back(FetchStep::Task(Task::new(id, p)));
            }
        }
        self
    }

    pub fn then(self, step: FetchStep) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    /// What fetch returns once the script is used up (default: empty).
    pub fn when_exhausted(mut self, step: FetchStep) -> Self {
        self.exhausted = step;
        self
    }

    /// Fail the next `n` submissions with `err`.
    pub fn fail_submits(self, n: usize, err: TransportError) -> Self {
        {
            let mut failures = self.submit_failures.lock().unwrap();
            for _ in 0..n {
                failures.push_back(err.clone());
            }
        }
        self
    }

    pub fn fail_every_submit(mut self, err: TransportError) -> Self {
        self.fail_all_submits = Some(err);
        self
    }

    /// Every fetch made from the thread named `name` fails with a
    /// connection error, leaving the script to the other slots.
    pub fn failing_thread(mut self, name: &str) -> Self {
        self.failing_thread = Some(name.to_string());
        self
    }

    /// Report "no work" until [`ScriptedCoordinator::arm`] is called.
    pub fn wait_for_arm(mut self) -> Self {
        self.wait_for_arm = true;
        self
    }

    /// Start handing out the script; the run flag of `shared` is lowered
    /// the moment the next task leaves the coordinator.
    pub fn arm(&self, shared: Arc<SharedProgress>) {
        let _ = self.stop_on_handout.set(shared);
    }

    pub fn set_ping(&self, result: Result<(), TransportError>) {
        *self.ping.lock().unwrap() = result;
    }

    pub fn submissions(&self) -> Vec<TaskResult> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn fetch_users(&self) -> Vec<String> {
        self.fetch_users.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

impl Coordinator for ScriptedCoordinator {
    fn fetch(&self, user_id: &str, _caps: Capabilities) -> Result<Option<Task>, TransportError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_users.lock().unwrap().push(user_id.to_string());

        if let Some(name) = &self.failing_thread {
            if std::thread::current().name() == Some(name.as_str()) {
                return Err(TransportError::Connection("connection refused".into()));
            }
        }
        let armed = self.stop_on_handout.get();
        if self.wait_for_arm && armed.is_none() {
            return Ok(None);
        }
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.exhausted.clone());
        match step {
            FetchStep::Task(task) => {
                if let Some(shared) = armed {
                    shared.stop();
                }
                Ok(Some(task))
            }
            FetchStep::Empty => Ok(None),
            FetchStep::Fail(e) => Err(e),
        }
    }

    fn submit(&self, result: &TaskResult) -> Result<(), TransportError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_all_submits {
            return Err(err.clone());
        }
        if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.submissions.lock().unwrap().push(result.clone());
        Ok(())
    }

    fn ping(&self) -> Result<(), TransportError> {
        self.ping.lock().unwrap().clone()
    }
}

/// Worker settings with millisecond back-off so failure scenarios finish fast.
pub fn fast_settings(user_id: &str) -> WorkerSettings {
    WorkerSettings {
        backoff_base: Duration::from_millis(1),
        idle_wait: Duration::from_millis(2),
        handoff_timeout: Duration::from_secs(60),
        ..WorkerSettings::new(user_id)
    }
}

/// Poll `cond` every few milliseconds; panic after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
