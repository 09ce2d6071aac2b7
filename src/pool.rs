//! # Worker Pool: Slot Allocation and Lifecycle
//!
//! Owns the [`SharedProgress`] of one run and the OS threads driving its
//! slots.
//!
//! - **Independent**: one [`TaskWorker`] thread per slot, each fetching its
//!   own tasks and testing them sequentially.
//! - **Collaborative**: one driver thread owns every slot and runs each task
//!   through the range pipeline with one compute unit per slot, so at most one
//!   task is in flight for the whole pool.
//!
//! Shutdown is cooperative: [`WorkerPool::request_shutdown`] lowers the run
//! flag and [`WorkerPool::join`] waits for every worker to reach a safe point.
//! No fetch starts after the flag drops; a test in progress runs to the end
//! and its result gets one more submission attempt. A worker that stops on
//! its failure ceiling (or panics) never takes its siblings down.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::WorkerError;
use crate::shared::SharedProgress;
use crate::worker::{TaskWorker, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    #[default]
    Independent,
    Collaborative,
}

impl std::fmt::Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolMode::Independent => f.write_str("independent"),
            PoolMode::Collaborative => f.write_str("collaborative"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub slots: usize,
    pub mode: PoolMode,
    pub settings: WorkerSettings,
}

/// Totals reported once every worker has exited.
#[derive(Debug, Clone, Default)]
pub struct PoolSummary {
    pub tasks_completed: u64,
    pub primes_found: u64,
    pub computation_errors: u64,
    /// Workers that ended with an error, followed by the recorded contract
    /// violations.
    pub worker_errors: Vec<WorkerError>,
    pub panicked: usize,
}

struct Driver {
    slots: Vec<usize>,
    handle: JoinHandle<Result<(), WorkerError>>,
}

pub struct WorkerPool {
    mode: PoolMode,
    shared: Arc<SharedProgress>,
    drivers: Vec<Driver>,
}

impl WorkerPool {
    /// Allocate the slots, initialise shared progress and start every worker.
    pub fn start(config: PoolConfig, coordinator: Arc<dyn Coordinator>) -> anyhow::Result<Self> {
        if config.slots == 0 {
            anyhow::bail!("worker pool needs at least one slot");
        }
        let shared = SharedProgress::new(config.slots);
        let mut pool = WorkerPool {
            mode: config.mode,
            shared: Arc::clone(&shared),
            drivers: Vec::new(),
        };

        let plan: Vec<(String, TaskWorker)> = match config.mode {
            PoolMode::Independent => (0..config.slots)
                .map(|slot| {
                    let worker = TaskWorker::independent(
                        slot,
                        Arc::clone(&coordinator),
                        Arc::clone(&shared),
                        config.settings.clone(),
                    );
                    (format!("ll-slot-{}", slot), worker)
                })
                .collect(),
            PoolMode::Collaborative => vec![(
                "ll-collab".to_string(),
                TaskWorker::collaborative(
                    (0..config.slots).collect(),
                    Arc::clone(&coordinator),
                    Arc::clone(&shared),
                    config.settings.clone(),
                ),
            )],
        };

        for (i, (name, worker)) in plan.into_iter().enumerate() {
            let slots = match config.mode {
                PoolMode::Independent => vec![i],
                PoolMode::Collaborative => (0..config.slots).collect(),
            };
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())
                .with_context(|| format!("spawning worker thread {}", name));
            match spawned {
                Ok(handle) => pool.drivers.push(Driver { slots, handle }),
                Err(e) => {
                    // Unwind the workers already running before reporting.
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!(
            slots = config.slots,
            mode = %config.mode,
            user = %config.settings.user_id,
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn shared(&self) -> Arc<SharedProgress> {
        Arc::clone(&self.shared)
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn slots(&self) -> usize {
        self.shared.slot_count()
    }

    /// Lower the run flag. Workers observe it at their next check.
    pub fn request_shutdown(&self) {
        self.shared.stop();
    }

    /// `true` once every worker thread has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.drivers.iter().all(|d| d.handle.is_finished())
    }

    /// Wait for every worker to exit and collect the run totals.
    pub fn join(mut self) -> PoolSummary {
        let mut summary = PoolSummary::default();
        for driver in self.drivers.drain(..) {
            match driver.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "worker ended with error");
                    summary.worker_errors.push(e);
                }
                Err(_) => {
                    error!(slots = ?driver.slots, "worker thread panicked");
                    for slot in driver.slots {
                        self.shared.mark_stopped(slot);
                    }
                    summary.panicked += 1;
                }
            }
        }
        self.shared.stop();
        self.shared.clear_all();
        summary
            .worker_errors
            .extend(self.shared.take_computation_failures());
        summary.tasks_completed = self.shared.tasks_completed();
        summary.primes_found = self.shared.primes_found();
        summary.computation_errors = self.shared.computation_errors();
        info!(
            tasks_completed = summary.tasks_completed,
            primes_found = summary.primes_found,
            worker_errors = summary.worker_errors.len(),
            "worker pool stopped"
        );
        summary
    }

    /// Request shutdown and wait for it to complete.
    pub fn shutdown(self) -> PoolSummary {
        self.request_shutdown();
        self.join()
    }
}
