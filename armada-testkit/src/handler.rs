use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use armada::{HandlerOutcome, Task, TaskContext, TaskHandler, TaskId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

/// One observed delivery.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub task_id: TaskId,
    pub attempt: u32,
    pub at: Instant,
}

/// Handler that replays a script of outcomes and records every delivery.
///
/// Once the script is exhausted every delivery falls back to the default
/// outcome, `Completed` unless overridden.
#[derive(Clone)]
pub struct ScriptedHandler {
    script: Arc<Mutex<VecDeque<HandlerOutcome>>>,
    fallback: Arc<Mutex<HandlerOutcome>>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(HandlerOutcome::completed(json!({ "ok": true })))),
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every delivery fails with a retryable error.
    pub fn always_failing(error: &str) -> Self {
        let handler = Self::new();
        handler.set_fallback(HandlerOutcome::retryable(error));
        handler
    }

    pub fn then(self, outcome: HandlerOutcome) -> Self {
        self.script.lock().push_back(outcome);
        self
    }

    pub fn set_fallback(&self, outcome: HandlerOutcome) {
        *self.fallback.lock() = outcome;
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn assert_attempt_count_eq(&self, expected: usize) {
        let actual = self.attempt_count();
        assert_eq!(actual, expected, "Expected {expected} deliveries, got {actual}");
    }
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> HandlerOutcome {
        self.attempts.lock().push(Attempt {
            task_id: task.id,
            attempt: ctx.attempt(),
            at: Instant::now(),
        });
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().clone())
    }
}
