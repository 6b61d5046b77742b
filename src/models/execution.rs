//! Execution records: one row per task run, with child per-backend results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal (or in-flight) status of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ExecutionStatus::Running),
            "success" => Some(ExecutionStatus::Success),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// `true` once this status can never be mutated again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Outcome of a single backend's part of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendResultStatus {
    Success,
    Failed,
}

impl BackendResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendResultStatus::Success => "success",
            BackendResultStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(BackendResultStatus::Success),
            "failed" => Some(BackendResultStatus::Failed),
            _ => None,
        }
    }
}

/// The outcome of uploading/syncing to one backend during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend_id: Uuid,
    pub backend_name: String,
    pub status: BackendResultStatus,
    pub uploaded_at: DateTime<Utc>,
    pub size: u64,
    pub remote_path: String,
    pub error_message: Option<String>,
}

/// One concrete run of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Denormalized so history survives task rename/delete.
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Bytes written for archive mode; total uploaded bytes for sync mode.
    pub archive_size: Option<u64>,
    /// `sha256:<hex>`, archive mode only.
    pub archive_hash: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub backend_results: Vec<BackendResult>,
}

impl Execution {
    pub fn new_running(task_id: Uuid, task_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            task_name: task_name.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            archive_size: None,
            archive_hash: None,
            error_message: None,
            duration_ms: None,
            backend_results: Vec::new(),
        }
    }

    /// Finalize this execution in place with a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus, error_message: Option<String>) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0));
        self.status = status;
        self.error_message = error_message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_status_is_monotone_by_construction() {
        let mut e = Execution::new_running(Uuid::new_v4(), "t");
        assert!(!e.status.is_terminal());
        e.finish(ExecutionStatus::Success, None);
        assert!(e.status.is_terminal());
        assert!(e.completed_at.is_some());
        assert!(e.duration_ms.is_some());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::from_str(s.as_str()), Some(s));
        }
    }
}
