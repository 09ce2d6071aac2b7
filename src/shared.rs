//! # Shared Progress: Cross-Thread Run State
//!
//! One [`SharedProgress`] is created per pool run and shared (via `Arc`) by
//! every task worker, the progress reporter, the dashboard and the metrics
//! endpoint. Counters are lock-free atomics; per-slot task info sits behind a
//! small mutex per slot so a reader never blocks more than one worker.
//!
//! ## Consistency
//!
//! A snapshot is assembled field by field and is not atomic across slots.
//! Readers may observe a slot idle while the completion counter has not yet
//! advanced (or the reverse) for the duration of a single update. Counters
//! only grow and the slot count is fixed at construction.
//!
//! Contract violations are counted without limit, but only the first
//! [`MAX_RECORDED_FAILURES`] are kept as [`WorkerError::Computation`] values
//! for the pool summary, so a coordinator handing out bad exponents cannot
//! grow the log without bound.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{LlError, WorkerError};
use crate::lock_or_recover;
use crate::task::Task;

/// Contract violations kept verbatim per run.
pub const MAX_RECORDED_FAILURES: usize = 64;

#[derive(Debug, Default)]
struct SlotState {
    current: Mutex<Option<Task>>,
    errors: AtomicU64,
    stopped: AtomicBool,
}

#[derive(Debug)]
pub struct SharedProgress {
    running: AtomicBool,
    tasks_completed: AtomicU64,
    primes_found: AtomicU64,
    computation_errors: AtomicU64,
    computation_failures: Mutex<Vec<WorkerError>>,
    slots: Vec<SlotState>,
    started_at: Instant,
    last_update: Mutex<DateTime<Utc>>,
}

impl SharedProgress {
    /// Fresh state for `slots` slots, all idle, with the run flag raised.
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(SharedProgress {
            running: AtomicBool::new(true),
            tasks_completed: AtomicU64::new(0),
            primes_found: AtomicU64::new(0),
            computation_errors: AtomicU64::new(0),
            computation_failures: Mutex::new(Vec::new()),
            slots: (0..slots).map(|_| SlotState::default()).collect(),
            started_at: Instant::now(),
            last_update: Mutex::new(Utc::now()),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Lower the run flag. Workers finish their current step and exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.touch();
    }

    pub fn set_current(&self, slot: usize, task: Option<Task>) {
        if let Some(state) = self.slots.get(slot) {
            *lock_or_recover(&state.current) = task;
            self.touch();
        }
    }

    pub fn current(&self, slot: usize) -> Option<Task> {
        self.slots
            .get(slot)
            .and_then(|state| lock_or_recover(&state.current).clone())
    }

    /// Bump the slot's displayed error count and return the new value.
    pub fn record_error(&self, slot: usize) -> u64 {
        let n = self
            .slots
            .get(slot)
            .map(|state| state.errors.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or(0);
        self.touch();
        n
    }

    pub fn slot_errors(&self, slot: usize) -> u64 {
        self.slots
            .get(slot)
            .map(|state| state.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// A test on `slot` violated an arithmetic precondition.
    pub fn record_computation_error(&self, slot: usize, source: LlError) {
        self.computation_errors.fetch_add(1, Ordering::Relaxed);
        let mut failures = lock_or_recover(&self.computation_failures);
        if failures.len() < MAX_RECORDED_FAILURES {
            failures.push(WorkerError::Computation { slot, source });
        }
    }

    /// Drain the recorded contract violations, oldest first.
    pub fn take_computation_failures(&self) -> Vec<WorkerError> {
        std::mem::take(&mut *lock_or_recover(&self.computation_failures))
    }

    /// The slot hit its error ceiling and will not take more work.
    pub fn mark_stopped(&self, slot: usize) {
        if let Some(state) = self.slots.get(slot) {
            state.stopped.store(true, Ordering::Release);
            *lock_or_recover(&state.current) = None;
            self.touch();
        }
    }

    pub fn is_stopped(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .map(|state| state.stopped.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    /// A result was accepted by the coordinator: count it and idle the slot.
    pub fn complete_task(&self, slot: usize, prime: bool) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        if prime {
            self.primes_found.fetch_add(1, Ordering::Relaxed);
        }
        self.set_current(slot, None);
    }

    /// Idle every slot. Called once all workers have exited.
    pub fn clear_all(&self) {
        for state in &self.slots {
            *lock_or_recover(&state.current) = None;
        }
        self.touch();
    }

    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
    }

    pub fn primes_found(&self) -> u64 {
        self.primes_found.load(Ordering::Relaxed)
    }

    pub fn computation_errors(&self) -> u64 {
        self.computation_errors.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *lock_or_recover(&self.last_update) = Utc::now();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let tasks_completed = self.tasks_completed();
        let tasks_per_hour = if elapsed > 0.0 {
            tasks_completed as f64 / elapsed * 3600.0
        } else {
            0.0
        };
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(slot, state)| {
                let current = lock_or_recover(&state.current).clone();
                let status = if state.stopped.load(Ordering::Acquire) {
                    SlotStatus::Stopped
                } else if current.is_some() {
                    SlotStatus::Testing
                } else {
                    SlotStatus::Idle
                };
                SlotSnapshot {
                    slot,
                    status,
                    exponent: current.as_ref().map(|t| t.exponent),
                    label: current.as_ref().map(Task::label),
                    task_id: current.map(|t| t.task_id.to_string()),
                    errors: state.errors.load(Ordering::Relaxed),
                }
            })
            .collect();
        ProgressSnapshot {
            running: self.is_running(),
            tasks_completed,
            primes_found: self.primes_found(),
            computation_errors: self.computation_errors(),
            slots,
            elapsed_secs: elapsed as u64,
            tasks_per_hour,
            last_update: *lock_or_recover(&self.last_update),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Testing,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub status: SlotStatus,
    pub exponent: Option<u64>,
    /// `M<p>` while testing.
    pub label: Option<String>,
    pub task_id: Option<String>,
    pub errors: u64,
}

/// Point-in-time copy of [`SharedProgress`] for display and the stats API.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub running: bool,
    pub tasks_completed: u64,
    pub primes_found: u64,
    pub computation_errors: u64,
    pub slots: Vec<SlotSnapshot>,
    pub elapsed_secs: u64,
    pub tasks_per_hour: f64,
    pub last_update: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn active_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Testing)
            .count()
    }

    pub fn total_slot_errors(&self) -> u64 {
        self.slots.iter().map(|s| s.errors).sum()
    }
}
