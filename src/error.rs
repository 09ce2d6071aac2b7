//! # Errors: Failure Taxonomy for the Task-Execution Engine
//!
//! Three error families, one per layer:
//!
//! | Type | Raised by | Recovery |
//! |------|-----------|----------|
//! | [`LlError`] | Lucas–Lehmer test and pipeline | never retried; the task is dropped |
//! | [`TransportError`] | coordinator fetch/submit | back-off and retry in the worker |
//! | [`WorkerError`] | task worker | reported to the pool; siblings keep running |
//!
//! A non-prime exponent is not an error: the worker short-circuits it to a
//! composite result without running the test.

use std::time::Duration;

/// Arithmetic contract violations. Always fatal to the single test invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlError {
    /// Lucas–Lehmer is defined for p >= 3 only.
    ExponentTooSmall { exponent: u64 },
    /// GMP bit positions are u32; larger exponents cannot be represented.
    ExponentTooLarge { exponent: u64 },
    /// A pipeline needs at least one compute unit.
    ZeroUnits,
    /// A pipeline stage waited longer than the handoff timeout for its predecessor.
    HandoffTimeout { stage: usize, waited: Duration },
    /// A pipeline stage lost its predecessor (panic or early failure upstream).
    PipelineBroken { stage: usize },
}

impl std::fmt::Display for LlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlError::ExponentTooSmall { exponent } => {
                write!(f, "Lucas-Lehmer requires p >= 3, got p = {}", exponent)
            }
            LlError::ExponentTooLarge { exponent } => {
                write!(f, "exponent {} exceeds the supported bit range", exponent)
            }
            LlError::ZeroUnits => write!(f, "pipeline requires at least one compute unit"),
            LlError::HandoffTimeout { stage, waited } => write!(
                f,
                "pipeline stage {} timed out after {:?} waiting for its predecessor",
                stage, waited
            ),
            LlError::PipelineBroken { stage } => {
                write!(f, "pipeline stage {} lost its predecessor", stage)
            }
        }
    }
}

impl LlError {
    /// Bad input rather than a failed run: retrying cannot help.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            LlError::ExponentTooSmall { .. } | LlError::ExponentTooLarge { .. } | LlError::ZeroUnits
        )
    }
}

impl std::error::Error for LlError {}

/// Coordinator transport failures, surfaced after the transport's own retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout(String),
    Connection(String),
    /// Non-success HTTP status from the coordinator.
    Status(u16),
    /// Response body could not be decoded as a task.
    Decode(String),
}

impl TransportError {
    /// Connection problems and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connection(_) => true,
            TransportError::Status(code) => matches!(code, 500 | 502 | 503 | 504),
            TransportError::Decode(_) => false,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "coordinator timeout: {}", msg),
            TransportError::Connection(msg) => write!(f, "coordinator connection error: {}", msg),
            TransportError::Status(code) => write!(f, "coordinator returned HTTP {}", code),
            TransportError::Decode(msg) => write!(f, "invalid coordinator response: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors that reach the pool's accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Consecutive-failure ceiling reached; the slot stopped permanently.
    Fatal { slot: usize, consecutive: u32 },
    /// A test invocation violated an arithmetic precondition.
    Computation { slot: usize, source: LlError },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Fatal { slot, consecutive } => write!(
                f,
                "slot {} stopped after {} consecutive errors",
                slot, consecutive
            ),
            WorkerError::Computation { slot, source } => {
                write!(f, "slot {} computation error: {}", slot, source)
            }
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Computation { source, .. } => Some(source),
            WorkerError::Fatal { .. } => None,
        }
    }
}
