//! # Task: Work Units and Verdict Reports
//!
//! A [`Task`] is fetched from the coordinator, tested once, and dropped. Its
//! verdict becomes a [`TaskResult`], which serializes to the coordinator's
//! flat JSON report through [`ResultPayload`]:
//!
//! ```text
//! composite: {task_id, exponent, is_prime: false, discovered_by,
//!             verification_status: "NOT_PRIME"}
//! prime:     {task_id, exponent, is_prime: true, num_digits, value_chunks,
//!             verification_method: "CPU", discovered_by,
//!             verification_status: "VERIFIED", value_hash}
//! ```

use serde::{Deserialize, Serialize};

use crate::mersenne::PrimeValue;

/// Opaque coordinator-assigned identifier, echoed back verbatim on submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(serde_json::Value);

impl TaskId {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        TaskId(value.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// One exponent to test. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub exponent: u64,
}

impl Task {
    pub fn new(task_id: impl Into<serde_json::Value>, exponent: u64) -> Self {
        Task {
            task_id: TaskId::new(task_id),
            exponent,
        }
    }

    /// Display label, e.g. `M521`.
    pub fn label(&self) -> String {
        format!("M{}", self.exponent)
    }
}

/// Hardware capabilities advertised when fetching work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub gpu_available: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            gpu_available: true,
        }
    }
}

/// Verdict for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Composite {
        task_id: TaskId,
        exponent: u64,
        discovered_by: String,
    },
    PrimeFound {
        task_id: TaskId,
        exponent: u64,
        discovered_by: String,
        digit_count: u64,
        value_chunks: Vec<String>,
        value_digest: String,
    },
}

impl TaskResult {
    pub fn composite(task: &Task, discovered_by: &str) -> Self {
        TaskResult::Composite {
            task_id: task.task_id.clone(),
            exponent: task.exponent,
            discovered_by: discovered_by.to_string(),
        }
    }

    pub fn prime(task: &Task, discovered_by: &str, value: PrimeValue) -> Self {
        TaskResult::PrimeFound {
            task_id: task.task_id.clone(),
            exponent: task.exponent,
            discovered_by: discovered_by.to_string(),
            digit_count: value.digit_count,
            value_chunks: value.chunks,
            value_digest: value.digest,
        }
    }

    pub fn is_prime(&self) -> bool {
        matches!(self, TaskResult::PrimeFound { .. })
    }

    pub fn exponent(&self) -> u64 {
        match self {
            TaskResult::Composite { exponent, .. } | TaskResult::PrimeFound { exponent, .. } => {
                *exponent
            }
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskResult::Composite { task_id, .. } | TaskResult::PrimeFound { task_id, .. } => {
                task_id
            }
        }
    }

    pub fn to_payload(&self) -> ResultPayload {
        ResultPayload::from(self)
    }
}

/// Wire form of a [`TaskResult`] for `POST /submit_mersenne_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub task_id: TaskId,
    pub exponent: u64,
    pub is_prime: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_digits: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_chunks: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<String>,
    pub discovered_by: String,
    pub verification_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_hash: Option<String>,
}

impl From<&TaskResult> for ResultPayload {
    fn from(result: &TaskResult) -> Self {
        match result {
            TaskResult::Composite {
                task_id,
                exponent,
                discovered_by,
            } => ResultPayload {
                task_id: task_id.clone(),
                exponent: *exponent,
                is_prime: false,
                num_digits: None,
                value_chunks: None,
                verification_method: None,
                discovered_by: discovered_by.clone(),
                verification_status: "NOT_PRIME".to_string(),
                value_hash: None,
            },
            TaskResult::PrimeFound {
                task_id,
                exponent,
                discovered_by,
                digit_count,
                value_chunks,
                value_digest,
            } => ResultPayload {
                task_id: task_id.clone(),
                exponent: *exponent,
                is_prime: true,
                num_digits: Some(*digit_count),
                value_chunks: Some(value_chunks.clone()),
                verification_method: Some("CPU".to_string()),
                discovered_by: discovered_by.clone(),
                verification_status: "VERIFIED".to_string(),
                value_hash: Some(value_digest.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Task Deserialization ───────────────────────────────────────

    #[test]
    fn task_deserializes_numeric_id() {
        let task: Task = serde_json::from_str(r#"{"task_id": 42, "exponent": 521}"#).unwrap();
        assert_eq!(task.exponent, 521);
        assert_eq!(task.task_id.to_string(), "42");
        assert_eq!(task.label(), "M521");
    }

    #[test]
    fn task_deserializes_string_id_and_ignores_extra_fields() {
        let json = r#"{"task_id": "abc-1", "exponent": 89, "assigned_at": "now"}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.task_id.to_string(), "abc-1");
    }

    #[test]
    fn task_id_echoes_original_json_form() {
        let task = Task::new(7, 13);
        let payload = TaskResult::composite(&task, "alice").to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["task_id"], serde_json::json!(7));
    }

    // ── Result Payloads ────────────────────────────────────────────

    #[test]
    fn composite_payload_has_minimal_fields() {
        let task = Task::new("t1", 11);
        let json = serde_json::to_value(TaskResult::composite(&task, "bob").to_payload()).unwrap();
        assert_eq!(json["is_prime"], false);
        assert_eq!(json["verification_status"], "NOT_PRIME");
        assert_eq!(json["discovered_by"], "bob");
        assert!(json.get("value_chunks").is_none());
        assert!(json.get("value_hash").is_none());
        assert!(json.get("num_digits").is_none());
    }

    #[test]
    fn prime_payload_carries_value_fields() {
        let task = Task::new("t2", 127);
        let value = PrimeValue::of_mersenne(127);
        let digest = value.digest.clone();
        let result = TaskResult::prime(&task, "carol", value);
        assert!(result.is_prime());
        let json = serde_json::to_value(result.to_payload()).unwrap();
        assert_eq!(json["is_prime"], true);
        assert_eq!(json["num_digits"], 39);
        assert_eq!(json["verification_method"], "CPU");
        assert_eq!(json["verification_status"], "VERIFIED");
        assert_eq!(json["value_hash"], digest);
        assert_eq!(
            json["value_chunks"][0],
            "170141183460469231731687303715884105727"
        );
    }

    #[test]
    fn accessors_work_for_both_variants() {
        let task = Task::new(1, 23);
        let r = TaskResult::composite(&task, "u");
        assert_eq!(r.exponent(), 23);
        assert_eq!(r.task_id(), &task.task_id);
        assert!(!r.is_prime());
    }

    #[test]
    fn default_capabilities_advertise_gpu() {
        assert!(Capabilities::default().gpu_available);
    }
}
