//! # Coordinator: Task Source and Result Sink
//!
//! The [`Coordinator`] trait is the seam between the task workers and the
//! outside world. [`HttpCoordinator`] speaks the coordinator's HTTP/JSON
//! protocol through a blocking `ureq` agent:
//!
//! | Operation | Request | "No work" |
//! |-----------|---------|-----------|
//! | fetch | `GET {base}/get_mersenne_task?user_id=..&gpu_available=True` | 204, or a body of `null`, `{}`, `[]`, `""` |
//! | submit | `POST {base}/submit_mersenne_result` (JSON [`ResultPayload`]) | n/a |
//! | ping | `GET {base}/public_stats` | n/a |
//!
//! Fetch and submit share a 30 s timeout and retry up to three times on
//! connection failures and HTTP 500/502/503/504 with exponential back-off.
//! The reachability probe uses a 10 s timeout and never retries.
//!
//! [`ResultPayload`]: crate::task::ResultPayload

use serde_json::Value;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::task::{Capabilities, Task, TaskResult};

/// Remote (or in-process) source of tasks and sink of verdicts.
///
/// Implementations are shared by every worker thread of a pool.
pub trait Coordinator: Send + Sync {
    /// Fetch one task; `Ok(None)` when the coordinator has nothing to hand out.
    fn fetch(&self, user_id: &str, caps: Capabilities) -> Result<Option<Task>, TransportError>;

    /// Report a verdict. `Ok(())` only when the coordinator accepted it.
    fn submit(&self, result: &TaskResult) -> Result<(), TransportError>;

    /// Cheap reachability check.
    fn ping(&self) -> Result<(), TransportError>;
}

/// Transport-level retry policy for fetch and submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    /// Delay before retry n (1-based) is `backoff_factor * 2^(n-1)`.
    pub backoff_factor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            backoff_factor: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.backoff_factor
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpCoordinator {
    base_url: String,
    agent: ureq::Agent,
    probe_agent: ureq::Agent,
    retry: RetryPolicy,
}

fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    ureq::Agent::new_with_config(
        ureq::config::Config::builder()
            .timeout_global(Some(timeout))
            .build(),
    )
}

impl HttpCoordinator {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeouts(base_url, REQUEST_TIMEOUT, PROBE_TIMEOUT)
    }

    pub fn with_timeouts(base_url: &str, request: Duration, probe: Duration) -> Self {
        HttpCoordinator {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: agent_with_timeout(request),
            probe_agent: agent_with_timeout(probe),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut retry = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && retry < self.retry.retries => {
                    retry += 1;
                    let delay = self.retry.delay_before(retry);
                    debug!(what, retry, delay_ms = delay.as_millis() as u64, error = %e, "retrying coordinator request");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn map_ureq(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::StatusCode(code) => TransportError::Status(code),
        e @ ureq::Error::Timeout(_) => TransportError::Timeout(e.to_string()),
        other => TransportError::Connection(other.to_string()),
    }
}

fn gpu_flag(caps: Capabilities) -> &'static str {
    if caps.gpu_available {
        "True"
    } else {
        "False"
    }
}

/// Decode a fetch body. Falsy JSON values mean "no task".
pub fn parse_task_body(body: &str) -> Result<Option<Task>, TransportError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| TransportError::Decode(e.to_string()))?;
    let empty = match &value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    };
    if empty {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| TransportError::Decode(e.to_string()))
}

impl Coordinator for HttpCoordinator {
    fn fetch(&self, user_id: &str, caps: Capabilities) -> Result<Option<Task>, TransportError> {
        let url = format!("{}/get_mersenne_task", self.base_url);
        self.with_retry("fetch", || {
            let mut resp = self
                .agent
                .get(&url)
                .query("user_id", user_id)
                .query("gpu_available", gpu_flag(caps))
                .call()
                .map_err(map_ureq)?;
            if resp.status() == 204 {
                return Ok(None);
            }
            let body = resp.body_mut().read_to_string().map_err(map_ureq)?;
            parse_task_body(&body)
        })
    }

    fn submit(&self, result: &TaskResult) -> Result<(), TransportError> {
        let url = format!("{}/submit_mersenne_result", self.base_url);
        let payload = result.to_payload();
        self.with_retry("submit", || {
            self.agent
                .post(&url)
                .send_json(&payload)
                .map_err(map_ureq)?;
            Ok(())
        })
    }

    fn ping(&self) -> Result<(), TransportError> {
        let url = format!("{}/public_stats", self.base_url);
        match self.probe_agent.get(&url).call() {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = map_ureq(e);
                warn!(url = %url, error = %err, "coordinator probe failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsy_bodies_mean_no_task() {
        for body in ["", "  ", "null", "{}", "[]", "\"\"", "false"] {
            assert_eq!(parse_task_body(body).unwrap(), None, "body {:?}", body);
        }
    }

    #[test]
    fn task_body_decodes() {
        let task = parse_task_body(r#"{"task_id": 5, "exponent": 607}"#)
            .unwrap()
            .unwrap();
        assert_eq!(task, Task::new(5, 607));
    }

    #[test]
    fn malformed_bodies_are_decode_errors() {
        assert!(matches!(
            parse_task_body("{not json"),
            Err(TransportError::Decode(_))
        ));
        assert!(matches!(
            parse_task_body(r#"{"task_id": 1}"#),
            Err(TransportError::Decode(_))
        ));
        assert!(matches!(
            parse_task_body(r#"{"task_id": 1, "exponent": -5}"#),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn retry_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::from_secs(1));
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
    }

    #[test]
    fn gpu_flag_uses_capitalised_booleans() {
        assert_eq!(gpu_flag(Capabilities::default()), "True");
        assert_eq!(
            gpu_flag(Capabilities {
                gpu_available: false
            }),
            "False"
        );
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let c = HttpCoordinator::new("http://localhost:5000/");
        assert_eq!(c.base_url(), "http://localhost:5000");
    }

    #[test]
    fn with_retry_stops_on_non_retryable() {
        let c = HttpCoordinator::new("http://unused").with_retry_policy(RetryPolicy {
            retries: 3,
            backoff_factor: Duration::ZERO,
        });
        let mut calls = 0;
        let r: Result<(), _> = c.with_retry("t", || {
            calls += 1;
            Err(TransportError::Status(404))
        });
        assert_eq!(r, Err(TransportError::Status(404)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn with_retry_gives_up_after_budget() {
        let c = HttpCoordinator::new("http://unused").with_retry_policy(RetryPolicy {
            retries: 3,
            backoff_factor: Duration::ZERO,
        });
        let mut calls = 0;
        let r: Result<(), _> = c.with_retry("t", || {
            calls += 1;
            Err(TransportError::Status(503))
        });
        assert_eq!(r, Err(TransportError::Status(503)));
        assert_eq!(calls, 4);
    }
}
