//! # Task Worker: Fetch, Test, Submit
//!
//! One [`TaskWorker`] drives one pool slot (independent mode) or every slot at
//! once (collaborative mode). Its loop alternates between two phases:
//!
//! ```text
//!            ┌──────────── empty: idle wait ────────────┐
//!            v                                           │
//!   ┌──> Fetch ──task──> oracle ──> LL / pipeline ──> Submit ──ok──┐
//!   │      │                                           │           │
//!   │      └── error: back off, retry fetch            └── error: back off, retry same result
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Accounting
//!
//! Every failed fetch or submit bumps a consecutive-failure counter and sleeps
//! `backoff_base × consecutive` before retrying the same phase. Reaching
//! `max_consecutive_errors` stops the worker with [`WorkerError::Fatal`]. Only
//! an accepted submission resets the counter.
//!
//! Contract violations from the test itself (e.g. p < 3) drop the task
//! without backing off and are recorded as [`WorkerError::Computation`] in the
//! shared progress; a pipeline timeout or broken link counts as an ordinary
//! failure.
//!
//! ## Shutdown
//!
//! The shared run flag is polled before each fetch, again when a fetch
//! returns, and during every sleep. A task that arrives after the flag
//! dropped is abandoned untested; the coordinator reassigns it once its own
//! lease expires. A test already running finishes, and its result gets one
//! more submission attempt; if that attempt fails the result is dropped and
//! the slot idles.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

use crate::coordinator::Coordinator;
use crate::error::{LlError, WorkerError};
use crate::lucas_lehmer::{checked_exponent, LucasLehmer, Verdict};
use crate::mersenne::PrimeValue;
use crate::pipeline::run_pipelined;
use crate::shared::SharedProgress;
use crate::task::{Capabilities, Task, TaskResult};
use crate::{is_probably_prime, mersenne_digits};

/// Longest single sleep between run-flag checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-worker tuneables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub user_id: String,
    pub capabilities: Capabilities,
    pub backoff_base: Duration,
    pub max_consecutive_errors: u32,
    /// Longest a pipeline stage waits with no upstream progress.
    pub handoff_timeout: Duration,
    /// Pause after the coordinator reports no work.
    pub idle_wait: Duration,
}

impl WorkerSettings {
    pub fn new(user_id: impl Into<String>) -> Self {
        WorkerSettings {
            user_id: user_id.into(),
            capabilities: Capabilities::default(),
            backoff_base: Duration::from_secs(10),
            max_consecutive_errors: 700,
            handoff_timeout: Duration::from_secs(10 * 60),
            idle_wait: Duration::from_secs(5),
        }
    }
}

/// How a worker turns an exponent into a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executor {
    Sequential,
    Pipelined { units: usize },
}

enum Phase {
    Fetch,
    Submit(TaskResult),
}

pub struct TaskWorker {
    slots: Vec<usize>,
    coordinator: Arc<dyn Coordinator>,
    shared: Arc<SharedProgress>,
    settings: WorkerSettings,
    executor: Executor,
}

impl TaskWorker {
    /// Worker owning a single slot, testing its own tasks sequentially.
    pub fn independent(
        slot: usize,
        coordinator: Arc<dyn Coordinator>,
        shared: Arc<SharedProgress>,
        settings: WorkerSettings,
    ) -> Self {
        TaskWorker {
            slots: vec![slot],
            coordinator,
            shared,
            settings,
            executor: Executor::Sequential,
        }
    }

    /// Worker owning every slot in `slots`, spreading one task over them.
    pub fn collaborative(
        slots: Vec<usize>,
        coordinator: Arc<dyn Coordinator>,
        shared: Arc<SharedProgress>,
        settings: WorkerSettings,
    ) -> Self {
        let units = slots.len().max(1);
        TaskWorker {
            slots,
            coordinator,
            shared,
            settings,
            executor: Executor::Pipelined { units },
        }
    }

    fn lead(&self) -> usize {
        self.slots.first().copied().unwrap_or(0)
    }

    /// Run until shutdown (`Ok`) or until the failure ceiling is hit.
    pub fn run(&self) -> Result<(), WorkerError> {
        let slot = self.lead();
        let mut consecutive: u32 = 0;
        let mut phase = Phase::Fetch;
        info!(slot, executor = ?self.executor, "worker started");

        loop {
            phase = match phase {
                Phase::Fetch => {
                    if !self.shared.is_running() {
                        break;
                    }
                    match self
                        .coordinator
                        .fetch(&self.settings.user_id, self.settings.capabilities)
                    {
                        Ok(None) => {
                            debug!(slot, "no task available");
                            self.pause(self.settings.idle_wait);
                            Phase::Fetch
                        }
                        Ok(Some(task)) if !self.shared.is_running() => {
                            info!(
                                slot,
                                task_id = %task.task_id,
                                exponent = task.exponent,
                                "shutdown requested, abandoning fetched task"
                            );
                            break;
                        }
                        Ok(Some(task)) => self.process(task, &mut consecutive)?,
                        Err(e) => {
                            self.on_failure(&mut consecutive, "fetch", &e)?;
                            Phase::Fetch
                        }
                    }
                }
                Phase::Submit(result) => {
                    let running = self.shared.is_running();
                    match self.coordinator.submit(&result) {
                        Ok(()) => {
                            consecutive = 0;
                            self.complete(&result);
                            Phase::Fetch
                        }
                        Err(e) if !running => {
                            warn!(
                                slot,
                                exponent = result.exponent(),
                                error = %e,
                                "dropping result after shutdown"
                            );
                            break;
                        }
                        Err(e) => {
                            self.on_failure(&mut consecutive, "submit", &e)?;
                            Phase::Submit(result)
                        }
                    }
                }
            };
        }

        self.release();
        info!(slot, "worker stopped");
        Ok(())
    }

    /// Claim the task in the slot table, test it, and move to submission.
    fn process(&self, task: Task, consecutive: &mut u32) -> Result<Phase, WorkerError> {
        let slot = self.lead();
        for &s in &self.slots {
            self.shared.set_current(s, Some(task.clone()));
        }
        let span = info_span!(
            "task",
            slot,
            exponent = task.exponent,
            digits = mersenne_digits(task.exponent)
        );
        match span.in_scope(|| self.execute(&task)) {
            Ok(result) => Ok(Phase::Submit(result)),
            Err(e) if e.is_contract_violation() => {
                error!(slot, task_id = %task.task_id, exponent = task.exponent, error = %e, "contract violation, task dropped");
                self.shared.record_computation_error(slot, e);
                for &s in &self.slots {
                    self.shared.record_error(s);
                }
                self.release();
                Ok(Phase::Fetch)
            }
            Err(e) => {
                self.release();
                self.on_failure(consecutive, "test", &e)?;
                Ok(Phase::Fetch)
            }
        }
    }

    /// Oracle gate, then the configured executor. Builds the result to submit.
    pub fn execute(&self, task: &Task) -> Result<TaskResult, LlError> {
        let p = task.exponent;
        if !is_probably_prime(p) {
            debug!(exponent = p, "exponent not prime, short-circuit composite");
            return Ok(TaskResult::composite(task, &self.settings.user_id));
        }

        let started = Instant::now();
        let verdict = match self.executor {
            Executor::Sequential => LucasLehmer::new(p)?.run(),
            Executor::Pipelined { units } => {
                run_pipelined(p, units, self.settings.handoff_timeout)?.verdict
            }
        };
        let elapsed = started.elapsed();

        match verdict {
            Verdict::Composite => {
                debug!(exponent = p, elapsed_ms = elapsed.as_millis() as u64, "composite");
                Ok(TaskResult::composite(task, &self.settings.user_id))
            }
            Verdict::Prime => {
                let value = PrimeValue::of_mersenne(checked_exponent(p)?);
                info!(
                    exponent = p,
                    digits = value.digit_count,
                    elapsed_secs = format_args!("{:.1}", elapsed.as_secs_f64()),
                    "*** MERSENNE PRIME FOUND: M{} ({} digits) ***",
                    p,
                    value.digit_count
                );
                Ok(TaskResult::prime(task, &self.settings.user_id, value))
            }
        }
    }

    fn complete(&self, result: &TaskResult) {
        let slot = self.lead();
        self.shared.complete_task(slot, result.is_prime());
        for &s in self.slots.iter().skip(1) {
            self.shared.set_current(s, None);
        }
        info!(
            slot,
            task_id = %result.task_id(),
            exponent = result.exponent(),
            prime = result.is_prime(),
            "result submitted"
        );
    }

    fn release(&self) {
        for &s in &self.slots {
            self.shared.set_current(s, None);
        }
    }

    fn on_failure(
        &self,
        consecutive: &mut u32,
        what: &str,
        err: &dyn std::fmt::Display,
    ) -> Result<(), WorkerError> {
        let slot = self.lead();
        *consecutive += 1;
        for &s in &self.slots {
            self.shared.record_error(s);
        }
        warn!(slot, consecutive = *consecutive, error = %err, "{} failed", what);

        if *consecutive >= self.settings.max_consecutive_errors.max(1) {
            error!(slot, consecutive = *consecutive, "too many errors, stopping worker");
            for &s in &self.slots {
                self.shared.mark_stopped(s);
            }
            return Err(WorkerError::Fatal {
                slot,
                consecutive: *consecutive,
            });
        }

        self.pause(self.settings.backoff_base.saturating_mul(*consecutive));
        Ok(())
    }

    /// Sleep up to `total`, waking early once the run flag drops.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.shared.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    //! Executor and loop behaviour against a canned coordinator. Pool-level
    //! scenarios (fault injection across slots, cancellation, collaborative
    //! mode) live in `tests/pool_tests.rs`.

    use super::*;
    use crate::error::TransportError;
    use crate::lock_or_recover;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Canned {
        tasks: Mutex<VecDeque<Task>>,
        submitted: Mutex<Vec<TaskResult>>,
        fail_submits: Mutex<u32>,
    }

    impl Coordinator for Canned {
        fn fetch(&self, _user: &str, _caps: Capabilities) -> Result<Option<Task>, TransportError> {
            Ok(lock_or_recover(&self.tasks).pop_front())
        }

        fn submit(&self, result: &TaskResult) -> Result<(), TransportError> {
            let mut remaining = lock_or_recover(&self.fail_submits);
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Status(503));
            }
            lock_or_recover(&self.submitted).push(result.clone());
            Ok(())
        }

        fn ping(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            backoff_base: Duration::from_millis(1),
            idle_wait: Duration::from_millis(5),
            ..WorkerSettings::new("tester")
        }
    }

    fn worker(coord: Arc<Canned>, shared: Arc<SharedProgress>) -> TaskWorker {
        TaskWorker::independent(0, coord, shared, fast_settings())
    }

    // ── Execute ────────────────────────────────────────────────────

    #[test]
    fn non_prime_exponent_short_circuits_to_composite() {
        let w = worker(Arc::new(Canned::default()), SharedProgress::new(1));
        let result = w.execute(&Task::new(1, 15)).unwrap();
        assert_eq!(result, TaskResult::composite(&Task::new(1, 15), "tester"));
    }

    #[test]
    fn prime_exponent_builds_value_fields() {
        let w = worker(Arc::new(Canned::default()), SharedProgress::new(1));
        match w.execute(&Task::new("a", 127)).unwrap() {
            TaskResult::PrimeFound {
                digit_count,
                value_chunks,
                value_digest,
                discovered_by,
                ..
            } => {
                assert_eq!(digit_count, 39);
                assert_eq!(value_chunks.len(), 1);
                assert_eq!(value_digest.len(), 64);
                assert_eq!(discovered_by, "tester");
            }
            other => panic!("expected prime, got {:?}", other),
        }
    }

    #[test]
    fn composite_mersenne_reported_composite() {
        let w = worker(Arc::new(Canned::default()), SharedProgress::new(1));
        assert!(!w.execute(&Task::new(2, 23)).unwrap().is_prime());
    }

    #[test]
    fn exponent_two_is_a_contract_violation() {
        let w = worker(Arc::new(Canned::default()), SharedProgress::new(1));
        assert_eq!(
            w.execute(&Task::new(3, 2)).unwrap_err(),
            LlError::ExponentTooSmall { exponent: 2 }
        );
    }

    #[test]
    fn collaborative_executor_agrees_with_sequential() {
        let shared = SharedProgress::new(3);
        let coord: Arc<dyn Coordinator> = Arc::new(Canned::default());
        let w = TaskWorker::collaborative(vec![0, 1, 2], coord, shared, fast_settings());
        assert_eq!(w.executor, Executor::Pipelined { units: 3 });
        assert!(w.execute(&Task::new(1, 61)).unwrap().is_prime());
        assert!(!w.execute(&Task::new(2, 29)).unwrap().is_prime());
    }

    // ── Loop ───────────────────────────────────────────────────────

    #[test]
    fn processes_queue_then_stops_on_shutdown() {
        let coord = Arc::new(Canned::default());
        lock_or_recover(&coord.tasks).extend([Task::new(1, 7), Task::new(2, 11), Task::new(3, 9)]);
        let shared = SharedProgress::new(1);
        let w = worker(Arc::clone(&coord), Arc::clone(&shared));

        let watcher = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while shared.tasks_completed() < 3 {
                    thread::sleep(Duration::from_millis(2));
                }
                shared.stop();
            })
        };
        assert_eq!(w.run(), Ok(()));
        watcher.join().unwrap();

        let submitted = lock_or_recover(&coord.submitted);
        assert_eq!(submitted.len(), 3);
        assert!(submitted[0].is_prime());
        assert!(!submitted[1].is_prime());
        assert!(!submitted[2].is_prime());
        assert_eq!(shared.primes_found(), 1);
        assert!(shared.current(0).is_none());
    }

    #[test]
    fn submit_retries_same_result_and_resets_counter() {
        let coord = Arc::new(Canned::default());
        lock_or_recover(&coord.tasks).push_back(Task::new(10, 13));
        *lock_or_recover(&coord.fail_submits) = 2;
        let shared = SharedProgress::new(1);
        let w = worker(Arc::clone(&coord), Arc::clone(&shared));

        let watcher = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while shared.tasks_completed() < 1 {
                    thread::sleep(Duration::from_millis(2));
                }
                shared.stop();
            })
        };
        assert_eq!(w.run(), Ok(()));
        watcher.join().unwrap();

        let submitted = lock_or_recover(&coord.submitted);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].task_id().to_string(), "10");
        assert_eq!(shared.slot_errors(0), 2);
    }

    #[test]
    fn computation_error_drops_task_without_submitting() {
        let coord = Arc::new(Canned::default());
        lock_or_recover(&coord.tasks).extend([Task::new(1, 2), Task::new(2, 5)]);
        let shared = SharedProgress::new(1);
        let w = worker(Arc::clone(&coord), Arc::clone(&shared));

        let watcher = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while shared.tasks_completed() < 1 {
                    thread::sleep(Duration::from_millis(2));
                }
                shared.stop();
            })
        };
        assert_eq!(w.run(), Ok(()));
        watcher.join().unwrap();

        let submitted = lock_or_recover(&coord.submitted);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].exponent(), 5);
        assert_eq!(shared.computation_errors(), 1);
        assert_eq!(shared.slot_errors(0), 1);
        assert_eq!(
            shared.take_computation_failures(),
            vec![WorkerError::Computation {
                slot: 0,
                source: LlError::ExponentTooSmall { exponent: 2 }
            }]
        );
    }

    #[test]
    fn pause_returns_early_after_stop() {
        let shared = SharedProgress::new(1);
        let w = worker(Arc::new(Canned::default()), Arc::clone(&shared));
        shared.stop();
        let started = Instant::now();
        w.pause(Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
