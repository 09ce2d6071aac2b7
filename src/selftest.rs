//! # Self Test: Known-Exponent Verification
//!
//! Runs a table of exponents with known verdicts through the sequential
//! test and through the range pipeline, in parallel across exponents with
//! rayon. A mismatch in either path means the arithmetic is broken on this
//! machine and no results should be submitted.

use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::error::LlError;
use crate::lucas_lehmer::lucas_lehmer;
use crate::pipeline::run_pipelined;

/// Exponents below 1300 with known Mersenne verdicts.
pub const KNOWN: &[(u64, bool)] = &[
    (3, true),
    (5, true),
    (7, true),
    (11, false),
    (13, true),
    (17, true),
    (19, true),
    (23, false),
    (29, false),
    (31, true),
    (37, false),
    (61, true),
    (67, false),
    (89, true),
    (107, true),
    (127, true),
    (521, true),
    (523, false),
    (607, true),
    (1279, true),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOutcome {
    pub exponent: u64,
    pub expected: bool,
    pub sequential: Result<bool, LlError>,
    pub pipelined: Result<bool, LlError>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.sequential.as_ref() == Ok(&self.expected) && self.pipelined.as_ref() == Ok(&self.expected)
    }
}

#[derive(Debug, Clone)]
pub struct SelfTestReport {
    pub cases: Vec<CaseOutcome>,
    pub elapsed: Duration,
}

impl SelfTestReport {
    pub fn failures(&self) -> Vec<&CaseOutcome> {
        self.cases.iter().filter(|c| !c.passed()).collect()
    }

    pub fn passed(&self) -> bool {
        self.cases.iter().all(CaseOutcome::passed)
    }
}

pub fn run_cases(cases: &[(u64, bool)], units: usize, handoff_timeout: Duration) -> SelfTestReport {
    let started = Instant::now();
    let cases: Vec<CaseOutcome> = cases
        .par_iter()
        .map(|&(exponent, expected)| CaseOutcome {
            exponent,
            expected,
            sequential: lucas_lehmer(exponent),
            pipelined: run_pipelined(exponent, units, handoff_timeout)
                .map(|r| r.verdict.is_prime()),
        })
        .collect();
    let report = SelfTestReport {
        cases,
        elapsed: started.elapsed(),
    };
    for case in report.failures() {
        error!(
            exponent = case.exponent,
            expected = case.expected,
            sequential = ?case.sequential,
            pipelined = ?case.pipelined,
            "self test mismatch"
        );
    }
    info!(
        cases = report.cases.len(),
        failures = report.failures().len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "self test finished"
    );
    report
}

/// The built-in table with `units` pipeline stages.
pub fn run(units: usize) -> SelfTestReport {
    run_cases(KNOWN, units, Duration::from_secs(60))
}
