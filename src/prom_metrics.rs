//! # Prometheus Metrics: Pool Exposition
//!
//! Exposes the worker pool's [`ProgressSnapshot`] in the Prometheus text
//! exposition format.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `mersenne_tasks_completed` | Gauge | | Tasks accepted by the coordinator this run |
//! | `mersenne_primes_found` | Gauge | | Mersenne primes found this run |
//! | `mersenne_slots_active` | Gauge | | Slots currently testing an exponent |
//! | `mersenne_worker_errors` | Gauge | `slot` | Failures recorded per slot |
//! | `mersenne_computation_errors` | Gauge | | Tasks dropped on contract violations |
//! | `mersenne_pool_running` | Gauge | | 1 while a pool is running |
//!
//! Values are copied from a fresh snapshot on every scrape, so they reset
//! when a new pool starts.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::shared::ProgressSnapshot;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct SlotLabel {
    pub slot: String,
}

pub struct Metrics {
    pub registry: Registry,
    pub tasks_completed: Gauge,
    pub primes_found: Gauge,
    pub slots_active: Gauge,
    pub worker_errors: Family<SlotLabel, Gauge>,
    pub computation_errors: Gauge,
    pub pool_running: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let tasks_completed = Gauge::default();
        registry.register(
            "mersenne_tasks_completed",
            "Tasks accepted by the coordinator in the current run",
            tasks_completed.clone(),
        );

        let primes_found = Gauge::default();
        registry.register(
            "mersenne_primes_found",
            "Mersenne primes found in the current run",
            primes_found.clone(),
        );

        let slots_active = Gauge::default();
        registry.register(
            "mersenne_slots_active",
            "Slots currently testing an exponent",
            slots_active.clone(),
        );

        let worker_errors = Family::<SlotLabel, Gauge>::default();
        registry.register(
            "mersenne_worker_errors",
            "Failures recorded per worker slot",
            worker_errors.clone(),
        );

        let computation_errors = Gauge::default();
        registry.register(
            "mersenne_computation_errors",
            "Tasks dropped because the test rejected its input",
            computation_errors.clone(),
        );

        let pool_running = Gauge::default();
        registry.register(
            "mersenne_pool_running",
            "1 while a worker pool is running",
            pool_running.clone(),
        );

        Self {
            registry,
            tasks_completed,
            primes_found,
            slots_active,
            worker_errors,
            computation_errors,
            pool_running,
        }
    }

    /// Copy a snapshot into the gauges. `None` means no pool exists.
    pub fn observe(&self, snapshot: Option<&ProgressSnapshot>) {
        self.worker_errors.clear();
        let Some(snap) = snapshot else {
            self.tasks_completed.set(0);
            self.primes_found.set(0);
            self.slots_active.set(0);
            self.computation_errors.set(0);
            self.pool_running.set(0);
            return;
        };
        self.tasks_completed.set(snap.tasks_completed as i64);
        self.primes_found.set(snap.primes_found as i64);
        self.slots_active.set(snap.active_slots() as i64);
        self.computation_errors.set(snap.computation_errors as i64);
        self.pool_running.set(i64::from(snap.running));
        for slot in &snap.slots {
            self.worker_errors
                .get_or_create(&SlotLabel {
                    slot: slot.slot.to_string(),
                })
                .set(slot.errors as i64);
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            warn!(error = %e, "metrics encoding failed");
            buf.clear();
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
