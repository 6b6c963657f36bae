use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::record::{Fingerprint, ResultRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status of an inference task.
///
/// `Queued -> Running -> Succeeded`, or `Running -> Queued` again while the
/// retry budget lasts, and `Running -> Failed` once it is spent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// One orchestrated, retryable unit of inference work for a fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub target_fingerprint: Fingerprint,
    pub attempt_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn queued(target_fingerprint: Fingerprint) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            target_fingerprint,
            attempt_count: 0,
            status: TaskStatus::Queued,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a caller sees when polling a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskPoll {
    Processing,
    Completed { record: ResultRecord },
    Failed { error: String },
}

impl TaskPoll {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskPoll::Processing)
    }
}
