pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod error;
pub mod lucas_lehmer;
pub mod mersenne;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod prom_metrics;
pub mod selftest;
pub mod shared;
pub mod task;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use coordinator::{Coordinator, HttpCoordinator};
pub use error::{LlError, TransportError, WorkerError};
pub use lucas_lehmer::{lucas_lehmer, LucasLehmer, Verdict};
pub use pipeline::run_pipelined;
pub use pool::{PoolConfig, PoolMode, WorkerPool};
pub use shared::SharedProgress;
pub use task::{Task, TaskResult};
pub use worker::{TaskWorker, WorkerSettings};

/// Deterministic trial division by 2, 3, then 6k ± 1 up to ⌊√n⌋.
///
/// Gate applied to every exponent before a Lucas–Lehmer run: 2^p − 1 can
/// only be prime when p is.
pub fn is_probably_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let mut i: u64 = 5;
    // i <= n / i avoids overflowing i * i near u64::MAX.
    while i <= n / i {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Decimal digits of 2^p − 1 without materialising it: ⌊p·log10 2⌋ + 1.
pub fn mersenne_digits(p: u64) -> u64 {
    if p == 0 {
        return 1;
    }
    (p as f64 * std::f64::consts::LOG10_2) as u64 + 1
}

/// Lock a mutex, recovering from poisoning.
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
