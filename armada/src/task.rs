use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier of a queued task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskPriority {
    P0 = 0,
    P1 = 1,
    #[default]
    P2 = 2,
    P3 = 3,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::P0 => "P0",
            TaskPriority::P1 => "P1",
            TaskPriority::P2 => "P2",
            TaskPriority::P3 => "P3",
        }
    }
}

/// A unit of work carried on the durable queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub topic: String,
    pub owner_id: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    /// Whether another delivery attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Caller-side request to enqueue a task. Identity and timestamps are
/// assigned by the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: String,
    pub payload: Value,
    pub priority: TaskPriority,
    /// Falls back to the queue default when unset.
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(owner_id: impl Into<String>, payload: Value) -> Self {
        Self {
            owner_id: owner_id.into(),
            payload,
            priority: TaskPriority::default(),
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Stopped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known status of a task, keyed by task id in the status store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn pending(task: &Task) -> Self {
        Self {
            id: task.id,
            status: TaskState::Pending,
            result: None,
            error: None,
            created_at: task.created_at,
            processed_at: None,
        }
    }

    pub fn transition(&self, status: TaskState) -> Self {
        Self {
            status,
            processed_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn completed(&self, result: Option<Value>) -> Self {
        Self {
            result,
            error: None,
            ..self.transition(TaskState::Completed)
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self.transition(TaskState::Failed)
        }
    }
}
