//! # Pipeline: Range-Chunked Lucas–Lehmer Across Compute Units
//!
//! Splits the p − 2 Lucas–Lehmer iterations into N contiguous ranges, one per
//! compute unit, and chains the units with single-slot handoff channels:
//!
//! ```text
//!  seed(4) ──> [stage 0: 1..c] ──s──> [stage 1: c..2c] ──s──> ... ──s──> final residue
//!                   │                       │
//!                   └──── StageSignals ─────┘
//!                         early_exit (s == 0), cancel (stage failed), heartbeat
//! ```
//!
//! ## Performance Envelope
//!
//! This is a latency-hiding pipeline, not a throughput multiplier. Stage k
//! cannot start until stage k − 1 publishes its final residue, so exactly one
//! unit computes at any moment and a run costs one sequential test plus the
//! handoff latency. A real speed-up needs an algebraically different
//! formulation of the recurrence (e.g. a composable matrix/polynomial chain per
//! range), which this module does not attempt.
//!
//! ## Waiting
//!
//! Each stage blocks on its input channel with `recv_timeout`, never spinning.
//! Every finished iteration bumps a shared heartbeat, and a waiting stage
//! restarts its handoff timeout whenever the heartbeat moves. The timeout
//! therefore bounds a stall upstream, not the upstream work itself, and long
//! ranges on large exponents never trip it.
//!
//! A stage that fails raises `cancel`. Stages still computing stop at their
//! next iteration without handing off, and stages still waiting see their
//! input disconnect, so a failed run releases its units promptly. The worker
//! treats the failure like any other failed attempt.

use rug::Integer;
use std::ops::Range;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::LlError;
use crate::lucas_lehmer::{checked_exponent, iterate_range, RangeOutcome, StageSignals, Verdict};
use crate::mersenne::MersenneModulus;

/// Longest single wait before a stage re-reads the heartbeat.
const HEARTBEAT_CHECK: Duration = Duration::from_secs(1);

/// Split iterations `1..=iterations` into `units` contiguous half-open ranges
/// of `ceil(iterations / units)` indices; the last range absorbs the remainder
/// and trailing ranges may be empty.
pub fn partition(iterations: u64, units: usize) -> Vec<Range<u64>> {
    if units == 0 {
        return Vec::new();
    }
    let n = units as u64;
    let chunk = iterations.div_ceil(n);
    let end_all = iterations + 1;
    (0..n)
        .map(|k| {
            let start = (1 + k * chunk).min(end_all);
            let end = if k == n - 1 {
                end_all
            } else {
                (start + chunk).min(end_all)
            };
            start..end
        })
        .collect()
}

/// Outcome of one pipelined run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub verdict: Verdict,
    pub ranges: Vec<Range<u64>>,
    pub stages: Vec<RangeOutcome>,
    /// Iteration at which some stage saw the residue reach zero.
    pub early_exit_at: Option<u64>,
}

/// Run the Lucas–Lehmer test for 2^p − 1 across `units` chained stages.
pub fn run_pipelined(
    p: u64,
    units: usize,
    handoff_timeout: Duration,
) -> Result<PipelineReport, LlError> {
    let p32 = checked_exponent(p)?;
    if units == 0 {
        return Err(LlError::ZeroUnits);
    }
    let modulus = MersenneModulus::new(p32);
    let ranges = partition(p - 2, units);
    let signals = StageSignals::new();

    let (seed_tx, mut upstream) = mpsc::sync_channel::<Integer>(1);
    seed_tx
        .send(Integer::from(4u32))
        .map_err(|_| LlError::PipelineBroken { stage: 0 })?;
    let mut wiring = Vec::with_capacity(units);
    for range in &ranges {
        let (tx, rx) = mpsc::sync_channel::<Integer>(1);
        wiring.push((upstream, tx, range.clone()));
        upstream = rx;
    }
    let final_rx = upstream;

    let results: Vec<Result<RangeOutcome, LlError>> = thread::scope(|scope| {
        let handles: Vec<_> = wiring
            .into_iter()
            .enumerate()
            .map(|(stage, (input, output, range))| {
                let modulus = &modulus;
                let signals = &signals;
                scope.spawn(move || {
                    run_stage(stage, range, input, output, modulus, signals, handoff_timeout)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(stage, h)| {
                h.join().unwrap_or_else(|_| {
                    signals.cancel();
                    Err(LlError::PipelineBroken { stage })
                })
            })
            .collect()
    });

    let mut stages = Vec::with_capacity(units);
    for result in results {
        // Lowest failing stage is the root cause; later stages only saw a broken link.
        stages.push(result?);
    }

    let residue = final_rx
        .try_recv()
        .map_err(|_| LlError::PipelineBroken { stage: units })?;
    let early_exit_at = stages.iter().find_map(|o| match o {
        RangeOutcome::HitZero { at } => Some(*at),
        _ => None,
    });
    let verdict = if residue == 0u32 || signals.exited_early() {
        Verdict::Prime
    } else {
        Verdict::Composite
    };

    Ok(PipelineReport {
        verdict,
        ranges,
        stages,
        early_exit_at,
    })
}

/// Wait for the predecessor's residue, run this stage's range, hand off.
/// Any failure raises `cancel` so the other stages stop too.
fn run_stage(
    stage: usize,
    range: Range<u64>,
    input: Receiver<Integer>,
    output: SyncSender<Integer>,
    modulus: &MersenneModulus,
    signals: &StageSignals,
    timeout: Duration,
) -> Result<RangeOutcome, LlError> {
    let result = compute_stage(stage, range, input, output, modulus, signals, timeout);
    if let Err(e) = &result {
        if !signals.is_cancelled() {
            warn!(stage, error = %e, "pipeline stage failed, cancelling run");
        }
        signals.cancel();
    }
    result
}

fn compute_stage(
    stage: usize,
    range: Range<u64>,
    input: Receiver<Integer>,
    output: SyncSender<Integer>,
    modulus: &MersenneModulus,
    signals: &StageSignals,
    timeout: Duration,
) -> Result<RangeOutcome, LlError> {
    let mut s = await_residue(stage, &input, signals, timeout)?;
    debug!(stage, start = range.start, end = range.end, "pipeline stage started");
    let outcome = iterate_range(modulus, &mut s, range, signals);
    if outcome == RangeOutcome::Cancelled {
        debug!(stage, "pipeline stage cancelled");
        return Ok(outcome);
    }
    output
        .send(s)
        .map_err(|_| LlError::PipelineBroken { stage: stage + 1 })?;
    debug!(stage, ?outcome, "pipeline stage handed off");
    Ok(outcome)
}

/// Block until the predecessor hands off. Fails once `timeout` passes with
/// no heartbeat from any stage.
fn await_residue(
    stage: usize,
    input: &Receiver<Integer>,
    signals: &StageSignals,
    timeout: Duration,
) -> Result<Integer, LlError> {
    let mut seen = signals.heartbeat();
    let mut deadline = Instant::now() + timeout;
    loop {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(HEARTBEAT_CHECK);
        match input.recv_timeout(wait) {
            Ok(s) => return Ok(s),
            Err(RecvTimeoutError::Disconnected) => return Err(LlError::PipelineBroken { stage }),
            Err(RecvTimeoutError::Timeout) => {
                let beat = signals.heartbeat();
                if beat != seen {
                    seen = beat;
                    deadline = Instant::now() + timeout;
                } else if Instant::now() >= deadline {
                    return Err(LlError::HandoffTimeout {
                        stage,
                        waited: timeout,
                    });
                }
            }
        }
    }
}
