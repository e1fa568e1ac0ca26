//! Jobs dispatched to the external execution plane and their state machine.
//!
//! ```text
//! pending ──> running ──> completed
//!                    ├──> failed
//!                    ├──> timeout
//!                    └──> partial
//! ```
//!
//! The four right-hand states are terminal. Every write consults
//! [`is_valid_transition`] first.

use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskId;

/// Job identifier assigned by the execution plane at dispatch time.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Jid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Jid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Partial,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Timeout,
        JobState::Partial,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Timeout | JobState::Partial
        )
    }

    pub fn can_transition_to(self, to: JobState) -> bool {
        is_valid_transition(self, to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Timeout => "timeout",
            JobState::Partial => "partial",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::error::ArmadaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::error::ArmadaError::Serialization(format!("unknown job state '{s}'")))
    }
}

/// Returns true only for `pending -> running` and `running -> terminal`.
pub fn is_valid_transition(from: JobState, to: JobState) -> bool {
    match from {
        JobState::Pending => to == JobState::Running,
        JobState::Running => to.is_terminal(),
        _ => false,
    }
}

/// Persisted view of a dispatched job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: Jid,
    pub task_id: Option<TaskId>,
    pub status: JobState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between `start_time` and `end_time`.
    pub duration_secs: Option<f64>,
    pub success_count: u32,
    pub failed_count: u32,
    pub result: Option<Value>,
}

impl JobRecord {
    pub fn new(jid: Jid, task_id: Option<TaskId>) -> Self {
        Self {
            jid,
            task_id,
            status: JobState::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_secs: None,
            success_count: 0,
            failed_count: 0,
            result: None,
        }
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time
    }

    /// Applies an update in place. Callers check the transition first.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        if update.end_time.is_some() {
            self.end_time = update.end_time;
        }
        if update.duration_secs.is_some() {
            self.duration_secs = update.duration_secs;
        }
        if let Some(success) = update.success_count {
            self.success_count = success;
        }
        if let Some(failed) = update.failed_count {
            self.failed_count = failed;
        }
        if update.result.is_some() {
            self.result = update.result.clone();
        }
    }
}

/// Fields written by a conditional job update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: JobState,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub success_count: Option<u32>,
    pub failed_count: Option<u32>,
    pub result: Option<Value>,
}

impl JobUpdate {
    pub fn running() -> Self {
        Self {
            status: JobState::Running,
            ..Default::default()
        }
    }

    /// Terminal update stamped with the end time and duration for `job`.
    pub fn finish(job: &JobRecord, status: JobState, now: DateTime<Utc>) -> Self {
        let duration = (now - job.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            status,
            end_time: Some(now),
            duration_secs: Some(duration),
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: &ResultSummary, raw: Value) -> Self {
        self.success_count = Some(summary.success_count);
        self.failed_count = Some(summary.failed_count);
        self.result = Some(raw);
        self
    }
}

/// Per-target results returned by the execution plane for one job.
pub type PlaneResult = HashMap<String, Value>;

/// Success/failure counts derived from a plane result.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub success_count: u32,
    pub failed_count: u32,
    pub failed_targets: Vec<String>,
}

impl ResultSummary {
    pub fn total(&self) -> u32 {
        self.success_count + self.failed_count
    }

    /// Terminal state implied by the counts, `None` when nothing reported.
    pub fn terminal_state(&self) -> Option<JobState> {
        match (self.success_count, self.failed_count) {
            (0, 0) => None,
            (_, 0) => Some(JobState::Completed),
            (0, _) => Some(JobState::Failed),
            _ => Some(JobState::Partial),
        }
    }
}

/// Classifies every target outcome of a plane result.
pub fn summarize_result(result: &PlaneResult) -> ResultSummary {
    let mut summary = ResultSummary::default();
    let mut targets: Vec<&String> = result.keys().collect();
    targets.sort();
    for target in targets {
        if target_failed(&result[target]) {
            summary.failed_count += 1;
            summary.failed_targets.push(target.clone());
        } else {
            summary.success_count += 1;
        }
    }
    summary
}

/// Whether a single target's outcome counts as a failure.
///
/// Structured outcomes fail on a non-zero `retcode`, `success: false`, or an
/// `error` field. Raw strings fail when they look like an error report.
pub fn target_failed(outcome: &Value) -> bool {
    match outcome {
        Value::Null => true,
        Value::Bool(ok) => !ok,
        Value::String(raw) => raw_string_failed(raw),
        Value::Object(fields) => {
            if let Some(retcode) = fields.get("retcode") {
                return retcode.as_i64().map_or(true, |code| code != 0);
            }
            if let Some(Value::Bool(false)) = fields.get("success") {
                return true;
            }
            ["error", "Error", "stderr_error"]
                .iter()
                .any(|key| fields.get(*key).is_some_and(|v| !v.is_null()))
        }
        _ => false,
    }
}

fn raw_string_failed(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    let lowered = trimmed.to_ascii_lowercase();
    lowered.starts_with("error")
        || lowered.starts_with("traceback")
        || lowered.contains("did not return")
        || lowered.contains("command not found")
}
