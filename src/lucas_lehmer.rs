//! # Lucas–Lehmer: Sequential Mersenne Primality Test
//!
//! For prime p, M = 2^p − 1 is prime iff s(p−2) ≡ 0 (mod M), where
//! s(0) = 4 and s(i) = s(i−1)² − 2. The recurrence is strictly sequential:
//! iteration i+1 needs the exact residue of iteration i.
//!
//! ## State Machine
//!
//! ```text
//! Init(p) ──validate p >= 3──> Iterating(s = 4, i = 1) ──i > p−2──> Done(verdict)
//!                                   │
//!                                   └── s == 0 before the last iteration ──> Done(Prime)
//! ```
//!
//! Each [`LucasLehmer::step`] performs one squaring and one subtraction with
//! the Mersenne fast reduction from [`crate::mersenne`].

use rug::Integer;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

use crate::error::LlError;
use crate::mersenne::MersenneModulus;

/// Iteration interval between debug progress lines on large exponents.
const LOG_INTERVAL: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Prime,
    Composite,
}

impl Verdict {
    pub fn is_prime(self) -> bool {
        self == Verdict::Prime
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlState {
    Iterating { s: Integer, i: u64 },
    Done(Verdict),
}

/// Validate an exponent and narrow it to GMP's bit-index width.
pub fn checked_exponent(p: u64) -> Result<u32, LlError> {
    if p < 3 {
        return Err(LlError::ExponentTooSmall { exponent: p });
    }
    u32::try_from(p).map_err(|_| LlError::ExponentTooLarge { exponent: p })
}

/// One Lucas–Lehmer run over 2^p − 1.
#[derive(Debug, Clone)]
pub struct LucasLehmer {
    modulus: MersenneModulus,
    last: u64,
    state: LlState,
}

impl LucasLehmer {
    /// `Init(p)`: fails fast on p < 3.
    pub fn new(p: u64) -> Result<Self, LlError> {
        let p32 = checked_exponent(p)?;
        Ok(LucasLehmer {
            modulus: MersenneModulus::new(p32),
            last: p - 2,
            state: LlState::Iterating {
                s: Integer::from(4u32),
                i: 1,
            },
        })
    }

    pub fn exponent(&self) -> u64 {
        self.modulus.exponent() as u64
    }

    pub fn state(&self) -> &LlState {
        &self.state
    }

    /// Total number of iterations a full run performs (p − 2).
    pub fn total_iterations(&self) -> u64 {
        self.last
    }

    /// Advance one iteration. Returns the verdict once the run is finished.
    pub fn step(&mut self) -> Option<Verdict> {
        let next = match &mut self.state {
            LlState::Done(verdict) => return Some(*verdict),
            LlState::Iterating { s, i } => {
                self.modulus.ll_step(s);
                if *s == 0u32 {
                    Some(LlState::Done(Verdict::Prime))
                } else if *i == self.last {
                    Some(LlState::Done(Verdict::Composite))
                } else {
                    *i += 1;
                    None
                }
            }
        };
        match next {
            Some(state) => {
                self.state = state;
                match self.state {
                    LlState::Done(verdict) => Some(verdict),
                    LlState::Iterating { .. } => None,
                }
            }
            None => None,
        }
    }

    /// Drive the recurrence to completion.
    pub fn run(mut self) -> Verdict {
        let p = self.exponent();
        loop {
            if let Some(verdict) = self.step() {
                return verdict;
            }
            if let LlState::Iterating { i, .. } = &self.state {
                if p > 50_000 && *i % LOG_INTERVAL == 0 {
                    debug!(
                        exponent = p,
                        iteration = *i,
                        total = self.last,
                        percent = format_args!("{:.1}", *i as f64 / self.last as f64 * 100.0),
                        "Lucas-Lehmer progress"
                    );
                }
            }
        }
    }
}

/// `true` iff 2^p − 1 is prime. Fails for p < 3.
pub fn lucas_lehmer(p: u64) -> Result<bool, LlError> {
    Ok(LucasLehmer::new(p)?.run().is_prime())
}

/// How a contiguous block of iterations ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    Completed,
    /// The residue reached zero after iteration `at`.
    HitZero { at: u64 },
    /// Another stage already reported an early exit.
    Aborted,
    /// Another stage failed; the residue is incomplete and must not be used.
    Cancelled,
}

/// Flags shared by every stage of one pipelined run.
#[derive(Debug, Default)]
pub struct StageSignals {
    /// Raised when some residue reaches zero.
    pub early_exit: AtomicBool,
    /// Raised when some stage fails.
    pub cancel: AtomicBool,
    /// Last iteration index completed by any stage.
    pub heartbeat: AtomicU64,
}

impl StageSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exited_early(&self) -> bool {
        self.early_exit.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat.load(Ordering::Relaxed)
    }
}

/// Run iterations `range` (1-based indices) on `s`, stopping early on zero
/// or when another stage raised `early_exit` or `cancel`. Raises
/// `early_exit` on zero and bumps the heartbeat after every iteration.
pub fn iterate_range(
    modulus: &MersenneModulus,
    s: &mut Integer,
    range: Range<u64>,
    signals: &StageSignals,
) -> RangeOutcome {
    for i in range {
        if signals.is_cancelled() {
            return RangeOutcome::Cancelled;
        }
        if signals.exited_early() {
            return RangeOutcome::Aborted;
        }
        modulus.ll_step(s);
        signals.heartbeat.store(i, Ordering::Relaxed);
        if *s == 0u32 {
            signals.early_exit.store(true, Ordering::Release);
            return RangeOutcome::HitZero { at: i };
        }
    }
    RangeOutcome::Completed
}

#[cfg(test)]
mod tests {
    //! Known-verdict table and state machine transitions.
    //!
    //! Mersenne prime exponents below 128: 3, 5, 7, 13, 17, 19, 31, 61, 89, 107, 127.
    //! Prime exponents giving composites: 11 (23·89), 23 (47·178481), 29, 37, 41, 43.

    use super::*;

    const PRIME_EXPONENTS: &[u64] = &[3, 5, 7, 13, 17, 19, 31, 61, 89, 107, 127];
    const COMPOSITE_EXPONENTS: &[u64] = &[11, 23, 29, 37, 41, 43, 47, 53, 59, 67, 71];

    // ── Known Verdicts ─────────────────────────────────────────────

    #[test]
    fn known_mersenne_primes_are_prime() {
        for &p in PRIME_EXPONENTS {
            assert!(lucas_lehmer(p).unwrap(), "M{} should be prime", p);
        }
    }

    #[test]
    fn known_composites_are_composite() {
        for &p in COMPOSITE_EXPONENTS {
            assert!(!lucas_lehmer(p).unwrap(), "M{} should be composite", p);
        }
    }

    #[test]
    fn larger_known_primes() {
        for p in [521u64, 607, 1279] {
            assert!(lucas_lehmer(p).unwrap(), "M{} should be prime", p);
        }
        assert!(!lucas_lehmer(523).unwrap());
    }

    // ── Boundaries ─────────────────────────────────────────────────

    #[test]
    fn p3_is_prime_with_single_iteration() {
        let mut ll = LucasLehmer::new(3).unwrap();
        assert_eq!(ll.total_iterations(), 1);
        assert_eq!(ll.step(), Some(Verdict::Prime));
        assert_eq!(ll.state(), &LlState::Done(Verdict::Prime));
    }

    #[test]
    fn exponents_below_three_fail_fast() {
        for p in [0u64, 1, 2] {
            assert_eq!(
                LucasLehmer::new(p).unwrap_err(),
                LlError::ExponentTooSmall { exponent: p }
            );
        }
    }

    #[test]
    fn exponent_beyond_u32_rejected() {
        let p = u32::MAX as u64 + 2;
        assert_eq!(
            checked_exponent(p).unwrap_err(),
            LlError::ExponentTooLarge { exponent: p }
        );
    }

    // ── State Machine ──────────────────────────────────────────────

    #[test]
    fn step_advances_index_until_done() {
        let mut ll = LucasLehmer::new(11).unwrap();
        for expected_i in 2..=9u64 {
            assert_eq!(ll.step(), None);
            match ll.state() {
                LlState::Iterating { i, .. } => assert_eq!(*i, expected_i),
                other => panic!("unexpected state {:?}", other),
            }
        }
        assert_eq!(ll.step(), Some(Verdict::Composite));
        // Done is absorbing.
        assert_eq!(ll.step(), Some(Verdict::Composite));
    }

    #[test]
    fn residues_follow_recurrence_for_m7() {
        // s mod 127: 4, 14, 67, 42, 111, 0
        let mut ll = LucasLehmer::new(7).unwrap();
        let expected = [14u32, 67, 42, 111];
        for want in expected {
            assert_eq!(ll.step(), None);
            match ll.state() {
                LlState::Iterating { s, .. } => assert_eq!(*s, want),
                other => panic!("unexpected state {:?}", other),
            }
        }
        assert_eq!(ll.step(), Some(Verdict::Prime));
    }

    // ── Ranges ─────────────────────────────────────────────────────

    #[test]
    fn iterate_range_matches_full_run() {
        let modulus = MersenneModulus::new(61);
        let signals = StageSignals::new();
        let mut s = Integer::from(4u32);
        assert_eq!(iterate_range(&modulus, &mut s, 1..30, &signals), RangeOutcome::Completed);
        assert_eq!(signals.heartbeat(), 29);
        assert_eq!(
            iterate_range(&modulus, &mut s, 30..60, &signals),
            RangeOutcome::HitZero { at: 59 }
        );
        assert!(signals.exited_early());
        assert_eq!(signals.heartbeat(), 59);
    }

    #[test]
    fn iterate_range_respects_raised_flag() {
        let modulus = MersenneModulus::new(89);
        let signals = StageSignals::new();
        signals.early_exit.store(true, Ordering::Release);
        let mut s = Integer::from(4u32);
        assert_eq!(iterate_range(&modulus, &mut s, 1..88, &signals), RangeOutcome::Aborted);
        assert_eq!(s, 4);
    }

    #[test]
    fn iterate_range_stops_on_cancel() {
        let modulus = MersenneModulus::new(89);
        let signals = StageSignals::new();
        signals.cancel();
        let mut s = Integer::from(4u32);
        assert_eq!(iterate_range(&modulus, &mut s, 1..88, &signals), RangeOutcome::Cancelled);
        assert_eq!(s, 4);
        assert_eq!(signals.heartbeat(), 0);
    }
}
