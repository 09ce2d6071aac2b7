//! # Progress: Periodic Pool Status Render
//!
//! A background thread snapshots [`SharedProgress`] on a fixed interval
//! (2 s by default) and renders it for a human: user id, slot count,
//! completed tasks, throughput in tasks/hour, running time and one line per
//! slot. The same numbers go out as a structured `tracing` event so headless
//! runs keep a record.
//!
//! The reporter only reads. Each render works from one snapshot, so a worker
//! updating its slot mid-render is never blocked for longer than a single
//! field copy.

use std::fmt::Write as _;
use std::io::{IsTerminal, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::shared::{ProgressSnapshot, SharedProgress, SlotStatus};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// `3725` → `1h 2m 5s`.
pub fn format_duration(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{}h {}m {}s", h, m, s)
}

/// Human-readable status block for one snapshot.
pub fn render(snapshot: &ProgressSnapshot, user_id: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Mersenne Prime Search ===");
    let _ = writeln!(out, "User ID: {}", user_id);
    let _ = writeln!(out, "Slots: {}", snapshot.slots.len());
    let _ = writeln!(out, "Tasks Completed: {}", snapshot.tasks_completed);
    let _ = writeln!(out, "Primes Found: {}", snapshot.primes_found);
    let _ = writeln!(out, "Tasks/Hour: {:.2}", snapshot.tasks_per_hour);
    let _ = writeln!(out, "Running Time: {}", format_duration(snapshot.elapsed_secs));
    let _ = writeln!(out);
    for slot in &snapshot.slots {
        let status = match (slot.status, &slot.label) {
            (SlotStatus::Testing, Some(label)) => format!("Testing {}", label),
            (SlotStatus::Stopped, _) => "Stopped".to_string(),
            _ => "Idle".to_string(),
        };
        let _ = writeln!(out, "Slot {}: {} (Errors: {})", slot.slot, status, slot.errors);
    }
    out
}

/// Handle to a running reporter thread.
pub struct ProgressReporter {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressReporter {
    /// Spawn the reporter. It exits on [`ProgressReporter::stop`] or once the
    /// pool's run flag drops.
    pub fn start(shared: Arc<SharedProgress>, user_id: String, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let clear = std::io::stderr().is_terminal();
            let mut next = Instant::now() + interval;
            loop {
                thread::sleep(Duration::from_millis(50));
                if flag.load(Ordering::Relaxed) || !shared.is_running() {
                    break;
                }
                if Instant::now() < next {
                    continue;
                }
                next += interval;
                report(&shared.snapshot(), &user_id, clear);
            }
        });
        ProgressReporter {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn report(snapshot: &ProgressSnapshot, user_id: &str, clear: bool) {
    let text = render(snapshot, user_id);
    let mut stderr = std::io::stderr().lock();
    if clear {
        let _ = stderr.write_all(CLEAR_SCREEN.as_bytes());
    }
    let _ = stderr.write_all(text.as_bytes());
    let _ = stderr.flush();

    info!(
        completed = snapshot.tasks_completed,
        primes = snapshot.primes_found,
        active = snapshot.active_slots(),
        errors = snapshot.total_slot_errors(),
        rate = format_args!("{:.2}/h", snapshot.tasks_per_hour),
        elapsed = %format_duration(snapshot.elapsed_secs),
        "pool progress"
    );
}
