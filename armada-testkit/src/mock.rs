use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use armada::{DispatchRequest, Deleter, ExecutionPlane, ItemExecutor, Jid, LogSink, PlaneResult};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Execution plane whose results are set by the test.
///
/// `dispatch` hands out sequential jids. `lookup` returns `None` until a
/// result is published for the jid.
#[derive(Clone, Default)]
pub struct MockExecutionPlane {
    next: Arc<AtomicU32>,
    dispatched: Arc<Mutex<Vec<DispatchRequest>>>,
    results: Arc<Mutex<HashMap<Jid, PlaneResult>>>,
    lookups: Arc<AtomicU32>,
    failing: Arc<Mutex<bool>>,
}

impl MockExecutionPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, jid: &Jid, result: PlaneResult) {
        self.results.lock().insert(jid.clone(), result);
    }

    /// Makes every lookup fail until reset.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn dispatched(&self) -> Vec<DispatchRequest> {
        self.dispatched.lock().clone()
    }

    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionPlane for MockExecutionPlane {
    async fn dispatch(&self, request: &DispatchRequest) -> anyhow::Result<Jid> {
        self.dispatched.lock().push(request.clone());
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(crate::fixtures::jid(n))
    }

    async fn lookup(&self, jid: &Jid) -> anyhow::Result<Option<PlaneResult>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock() {
            anyhow::bail!("plane unavailable");
        }
        Ok(self.results.lock().get(jid).cloned())
    }
}

/// Deleter that fails the first `failures` calls per target, then succeeds.
#[derive(Clone, Default)]
pub struct MockDeleter {
    failures: u32,
    calls: Arc<Mutex<HashMap<String, u32>>>,
    always_fail: Arc<Mutex<HashSet<String>>>,
}

impl MockDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Every delete of `target` fails.
    pub fn fail_target(&self, target: &str) {
        self.always_fail.lock().insert(target.to_string());
    }

    pub fn calls(&self, target: &str) -> u32 {
        self.calls.lock().get(target).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Deleter for MockDeleter {
    async fn delete(&self, target_id: &str, _force: bool) -> anyhow::Result<()> {
        let call = {
            let mut calls = self.calls.lock();
            let entry = calls.entry(target_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.always_fail.lock().contains(target_id) {
            anyhow::bail!("delete of {target_id} refused");
        }
        if call <= self.failures {
            anyhow::bail!("delete of {target_id} failed on attempt {call}");
        }
        Ok(())
    }
}

/// Bulk item executor that fails listed targets and logs one line per item.
#[derive(Clone, Default)]
pub struct MockItemExecutor {
    failing: Arc<HashSet<String>>,
    delay: Duration,
    executed: Arc<Mutex<Vec<String>>>,
}

impl MockItemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: Arc::new(targets.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl ItemExecutor for MockItemExecutor {
    async fn execute(&self, target: &str, log: &LogSink) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.executed.lock().push(target.to_string());
        log.line(format!("processing {target}"));
        if self.failing.contains(target) {
            anyhow::bail!("{target} unreachable");
        }
        Ok(())
    }
}
