//! Task domain model.
//!
//! A task is a unit of deferred work identified by UUID, carrying an opaque
//! payload and its lifecycle state. Records persist as store hashes; the two
//! history sequences are JSON arrays inside hash fields, appended only by
//! the atomic transition scripts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Queued (primary or retry) and waiting for a dispatcher.
    Pending,
    /// Claimed by a dispatcher; in no queue.
    Active,
    /// Terminal success; `result` is set.
    Completed,
    /// Most recent attempt failed; transitions onward to SCHEDULED or DLQ.
    Failed,
    /// Waiting in the time-indexed set for a delayed retry.
    Scheduled,
    /// Terminal failure; listed in the dead letter queue.
    Dlq,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Active,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Scheduled,
        TaskState::Dlq,
    ];

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Scheduled => "SCHEDULED",
            Self::Dlq => "DLQ",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "SCHEDULED" => Some(Self::Scheduled),
            "DLQ" => Some(Self::Dlq),
            _ => None,
        }
    }

    /// Terminal states never leave without manual intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dlq)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition, appended per transition (strictly monotone in time
/// within a task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: String,
    pub timestamp: String,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHistoryEntry {
    pub error_type: String,
    pub message: String,
    pub timestamp: String,
}

/// Full task record, as read back from its store hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: String,
    pub payload: String,
    pub state: TaskState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub error_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub state_history: Vec<StateHistoryEntry>,
    pub error_history: Vec<ErrorHistoryEntry>,
}

impl TaskRecord {
    /// Rebuild a record from its hash fields.
    ///
    /// Fails with `Internal` when required fields are missing or unparseable;
    /// that indicates a record written outside the creation script.
    pub fn from_hash(task_id: &str, fields: &HashMap<String, String>) -> BrokerResult<Self> {
        let state_raw = required_field(task_id, fields, "state")?;
        let state = TaskState::parse(state_raw).ok_or_else(|| {
            BrokerError::Internal(format!("task {} has unknown state '{}'", task_id, state_raw))
        })?;

        let state_history: Vec<StateHistoryEntry> = serde_json::from_str(
            fields
                .get("state_history")
                .map(String::as_str)
                .unwrap_or("[]"),
        )?;
        let error_history: Vec<ErrorHistoryEntry> = serde_json::from_str(
            fields
                .get("error_history")
                .map(String::as_str)
                .unwrap_or("[]"),
        )?;

        Ok(Self {
            task_id: required_field(task_id, fields, "task_id")?.clone(),
            task_type: required_field(task_id, fields, "task_type")?.clone(),
            payload: required_field(task_id, fields, "payload")?.clone(),
            state,
            retry_count: count_field(task_id, fields, "retry_count")?,
            max_retries: count_field(task_id, fields, "max_retries")?,
            last_error: optional_field(fields, "last_error"),
            error_type: optional_field(fields, "error_type"),
            created_at: instant_field(
                task_id,
                "created_at",
                required_field(task_id, fields, "created_at")?,
            )?,
            updated_at: instant_field(
                task_id,
                "updated_at",
                required_field(task_id, fields, "updated_at")?,
            )?,
            completed_at: optional_instant_field(task_id, fields, "completed_at")?,
            retry_after: optional_instant_field(task_id, fields, "retry_after")?,
            result: optional_field(fields, "result"),
            state_history,
            error_history,
        })
    }

    /// Age of the task since submission.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

fn required_field<'m>(
    task_id: &str,
    fields: &'m HashMap<String, String>,
    name: &str,
) -> BrokerResult<&'m String> {
    fields.get(name).ok_or_else(|| {
        BrokerError::Internal(format!("task {} missing field '{}'", task_id, name))
    })
}

fn optional_field(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|value| !value.is_empty()).cloned()
}

fn instant_field(task_id: &str, name: &str, raw: &str) -> BrokerResult<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        BrokerError::Internal(format!(
            "task {} field '{}' is not a timestamp: {}",
            task_id, name, e
        ))
    })
}

fn optional_instant_field(
    task_id: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> BrokerResult<Option<DateTime<Utc>>> {
    match fields.get(name).map(String::as_str) {
        None | Some("") => Ok(None),
        Some(raw) => instant_field(task_id, name, raw).map(Some),
    }
}

fn count_field(task_id: &str, fields: &HashMap<String, String>, name: &str) -> BrokerResult<u32> {
    required_field(task_id, fields, name)?.parse().map_err(|e| {
        BrokerError::Internal(format!(
            "task {} field '{}' is not an integer: {}",
            task_id, name, e
        ))
    })
}

/// Arguments for creating a new task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub task_type: String,
    pub payload: String,
    pub max_retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("task_id".into(), "t1".into());
        fields.insert("task_type".into(), "echo".into());
        fields.insert("payload".into(), "hello".into());
        fields.insert("state".into(), "PENDING".into());
        fields.insert("retry_count".into(), "0".into());
        fields.insert("max_retries".into(), "3".into());
        fields.insert("created_at".into(), "2025-03-07T12:00:00Z".into());
        fields.insert("updated_at".into(), "2025-03-07T12:00:00Z".into());
        fields.insert(
            "state_history".into(),
            r#"[{"state":"PENDING","timestamp":"2025-03-07T12:00:00Z"}]"#.into(),
        );
        fields.insert("error_history".into(), "[]".into());
        fields
    }

    #[test]
    fn test_state_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("RUNNING"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Dlq.is_terminal());
        assert!(!TaskState::Failed.is_terminal());
        assert!(!TaskState::Active.is_terminal());
    }

    #[test]
    fn test_from_hash_complete_record() {
        let record = TaskRecord::from_hash("t1", &sample_fields()).unwrap();
        assert_eq!(record.task_id, "t1");
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.state_history.len(), 1);
        assert!(record.retry_after.is_none());
        assert!(record.result.is_none());
    }

    #[test]
    fn test_from_hash_empty_optional_fields_are_none() {
        let mut fields = sample_fields();
        fields.insert("retry_after".into(), "".into());
        fields.insert("last_error".into(), "".into());
        let record = TaskRecord::from_hash("t1", &fields).unwrap();
        assert!(record.retry_after.is_none());
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_from_hash_missing_required_field() {
        let mut fields = sample_fields();
        fields.remove("task_type");
        let err = TaskRecord::from_hash("t1", &fields).unwrap_err();
        assert!(err.to_string().contains("task_type"));
    }

    #[test]
    fn test_from_hash_unknown_state() {
        let mut fields = sample_fields();
        fields.insert("state".into(), "LIMBO".into());
        let err = TaskRecord::from_hash("t1", &fields).unwrap_err();
        assert!(err.to_string().contains("LIMBO"));
    }

    #[test]
    fn test_age() {
        let record = TaskRecord::from_hash("t1", &sample_fields()).unwrap();
        let now = "2025-03-07T14:00:00Z".parse().unwrap();
        assert_eq!(record.age(now).num_hours(), 2);
    }
}
