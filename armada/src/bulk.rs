//! Fixed-size worker pool for bulk operations over many targets.
//!
//! A run fills a bounded work channel once, lets `parallelism` workers drain
//! it, and folds their results in a single aggregator. Progress and log lines
//! go out on a bounded channel that drops events when full; the [`BulkRun`]
//! returned by [`BulkRunner::run`] is the authoritative result.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::BulkConfig;
use crate::events::{publish_quietly, EventPayload, EventPublisher};
use crate::runtime::BackgroundTasks;
use crate::status::{keys, StatusStore, StatusStoreExt};
use crate::telemetry::{bulk_item_span, record_bulk_item};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkItemStatus {
    Pending,
    Success,
    Failed,
}

impl BulkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkItemStatus::Pending => "pending",
            BulkItemStatus::Success => "success",
            BulkItemStatus::Failed => "failed",
        }
    }
}

/// Outcome for one target. Written by exactly one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub target: String,
    pub status: BulkItemStatus,
    pub error: Option<String>,
    pub duration_secs: Option<f64>,
}

impl BulkItem {
    fn pending(target: String) -> Self {
        Self {
            target,
            status: BulkItemStatus::Pending,
            error: None,
            duration_secs: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkRunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl BulkRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BulkRunStatus::Running)
    }

    /// Aggregate status once every item has reported.
    pub fn from_counts(success: usize, failed: usize) -> Self {
        match (success, failed) {
            (_, 0) => BulkRunStatus::Completed,
            (0, _) => BulkRunStatus::Failed,
            _ => BulkRunStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BulkRunStatus::Running => "running",
            BulkRunStatus::Completed => "completed",
            BulkRunStatus::Partial => "partial",
            BulkRunStatus::Failed => "failed",
        }
    }
}

/// Aggregate view of a bulk run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkRun {
    pub run_id: RunId,
    pub items: Vec<BulkItem>,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub completed_count: usize,
    pub status: BulkRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BulkRun {
    pub fn new(run_id: RunId, targets: Vec<String>) -> Self {
        let items: Vec<BulkItem> = targets.into_iter().map(BulkItem::pending).collect();
        Self {
            run_id,
            total: items.len(),
            items,
            success_count: 0,
            failed_count: 0,
            completed_count: 0,
            status: BulkRunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed_count as f64 * 100.0 / self.total as f64
        }
    }

    fn record(&mut self, index: usize, item: BulkItem) {
        match item.status {
            BulkItemStatus::Success => self.success_count += 1,
            BulkItemStatus::Failed => self.failed_count += 1,
            BulkItemStatus::Pending => return,
        }
        self.completed_count += 1;
        if let Some(slot) = self.items.get_mut(index) {
            *slot = item;
        }
    }

    fn finish(&mut self) {
        self.status = BulkRunStatus::from_counts(self.success_count, self.failed_count);
        self.finished_at = Some(Utc::now());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BulkProgress {
    pub run_id: RunId,
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    pub last: BulkItem,
}

/// Events streamed while a run is in flight.
#[derive(Clone, Debug, PartialEq)]
pub enum BulkEvent {
    Progress(BulkProgress),
    /// One line of raw output from an item.
    Log {
        run_id: RunId,
        target: String,
        line: String,
    },
}

/// Per-item handle for streaming output lines into the progress channel.
#[derive(Clone, Debug)]
pub struct LogSink {
    run_id: RunId,
    target: String,
    tx: Option<mpsc::Sender<BulkEvent>>,
}

impl LogSink {
    pub fn new(run_id: RunId, target: impl Into<String>, tx: Option<mpsc::Sender<BulkEvent>>) -> Self {
        Self {
            run_id,
            target: target.into(),
            tx,
        }
    }

    /// A sink that discards every line.
    pub fn discard(target: impl Into<String>) -> Self {
        Self::new(RunId::new(), target, None)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forwards a line. Dropped when the channel is full or closed.
    pub fn line(&self, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(BulkEvent::Log {
                run_id: self.run_id,
                target: self.target.clone(),
                line: line.into(),
            });
        }
    }
}

/// Performs the work for one target.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(&self, target: &str, log: &LogSink) -> anyhow::Result<()>;
}

struct ItemResult {
    index: usize,
    item: BulkItem,
}

/// Runs bulk operations on a fixed-size worker pool.
pub struct BulkRunner {
    config: BulkConfig,
    executor: Arc<dyn ItemExecutor>,
}

impl fmt::Debug for BulkRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BulkRunner {
    pub fn new(config: BulkConfig, executor: Arc<dyn ItemExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Creates a progress channel sized by `progress_capacity`.
    pub fn subscribe(&self) -> (mpsc::Sender<BulkEvent>, mpsc::Receiver<BulkEvent>) {
        mpsc::channel(self.config.progress_capacity.max(1))
    }

    /// Runs every target to completion and returns the final aggregate.
    pub async fn run(&self, targets: Vec<String>, parallelism: usize) -> BulkRun {
        let run = Arc::new(Mutex::new(BulkRun::new(RunId::new(), targets)));
        self.run_tracked(run, parallelism, None).await
    }

    /// Like [`run`](Self::run), streaming progress and log lines to `progress`.
    pub async fn run_with_progress(
        &self,
        targets: Vec<String>,
        parallelism: usize,
        progress: mpsc::Sender<BulkEvent>,
    ) -> BulkRun {
        let run = Arc::new(Mutex::new(BulkRun::new(RunId::new(), targets)));
        self.run_tracked(run, parallelism, Some(progress)).await
    }

    /// Drives `run` to completion, updating the shared snapshot after every item.
    pub async fn run_tracked(
        &self,
        run: Arc<Mutex<BulkRun>>,
        parallelism: usize,
        progress: Option<mpsc::Sender<BulkEvent>>,
    ) -> BulkRun {
        let (run_id, targets) = {
            let run = run.lock();
            let targets: Vec<String> = run.items.iter().map(|i| i.target.clone()).collect();
            (run.run_id, targets)
        };
        let total = targets.len();
        let workers = parallelism.clamp(1, total.max(1));

        let (work_tx, work_rx) = mpsc::channel::<(usize, String)>(total.max(1));
        for job in targets.into_iter().enumerate() {
            // Capacity equals the item count, so this never waits.
            if work_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(work_tx);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let (results_tx, mut results_rx) = mpsc::channel::<ItemResult>(workers);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let work_rx = Arc::clone(&work_rx);
            let results_tx = results_tx.clone();
            let executor = Arc::clone(&self.executor);
            let progress = progress.clone();
            let item_timeout = self.config.item_timeout();
            pool.spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some((index, target)) = next else { break };
                    let sink = LogSink::new(run_id, target.clone(), progress.clone());
                    let item = execute_item(executor.as_ref(), &sink, item_timeout)
                        .instrument(bulk_item_span(run_id.to_string(), &target))
                        .await;
                    if results_tx.send(ItemResult { index, item }).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Results close only after every worker has exited.
        tokio::spawn(async move {
            while let Some(joined) = pool.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(run_id = %run_id, "bulk worker exited abnormally: {err}");
                }
            }
            drop(results_tx);
        });

        while let Some(ItemResult { index, item }) = results_rx.recv().await {
            let snapshot = {
                let mut run = run.lock();
                run.record(index, item.clone());
                BulkProgress {
                    run_id,
                    completed: run.completed_count,
                    total: run.total,
                    percent: run.percent(),
                    last: item,
                }
            };
            if let Some(tx) = &progress {
                let _ = tx.try_send(BulkEvent::Progress(snapshot));
            }
        }

        let mut run = run.lock();
        run.finish();
        tracing::info!(
            run_id = %run_id,
            total = run.total,
            success = run.success_count,
            failed = run.failed_count,
            status = run.status.as_str(),
            "bulk run finished"
        );
        run.clone()
    }
}

async fn execute_item(executor: &dyn ItemExecutor, sink: &LogSink, item_timeout: Duration) -> BulkItem {
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        item_timeout,
        AssertUnwindSafe(executor.execute(sink.target(), sink)).catch_unwind(),
    )
    .await;
    let error = match outcome {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(err))) => Some(format!("{err:#}")),
        Ok(Err(_)) => Some("executor panicked".to_string()),
        Err(_) => Some(format!("timed out after {item_timeout:?}")),
    };
    let duration = started.elapsed();
    let status = if error.is_some() {
        BulkItemStatus::Failed
    } else {
        BulkItemStatus::Success
    };
    record_bulk_item(sink.run_id.to_string(), status.as_str(), duration);
    BulkItem {
        target: sink.target().to_string(),
        status,
        error,
        duration_secs: Some(duration.as_secs_f64()),
    }
}

/// A run started in the background by [`BulkRunRegistry::start`].
#[derive(Debug)]
pub struct BulkRunHandle {
    pub run_id: RunId,
    /// Progress for this run. Dropping it does not affect the run.
    pub progress: mpsc::Receiver<BulkEvent>,
}

/// Starts runs in the background and serves their progress by id.
///
/// In-flight runs are read from memory. Finished runs are persisted under
/// `armada:bulk:{run_id}` and served from the status store afterwards.
pub struct BulkRunRegistry {
    runner: Arc<BulkRunner>,
    store: Arc<dyn StatusStore>,
    events: Arc<dyn EventPublisher>,
    active: Arc<Mutex<HashMap<RunId, Arc<Mutex<BulkRun>>>>>,
    tasks: BackgroundTasks,
}

impl fmt::Debug for BulkRunRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkRunRegistry")
            .field("active", &self.active.lock().len())
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl BulkRunRegistry {
    pub fn new(
        runner: Arc<BulkRunner>,
        store: Arc<dyn StatusStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            runner,
            store,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
            tasks: BackgroundTasks::new("bulk-runs"),
        }
    }

    pub fn runner(&self) -> &Arc<BulkRunner> {
        &self.runner
    }

    /// Number of runs still in flight.
    pub fn active_runs(&self) -> usize {
        self.active.lock().len()
    }

    /// Starts a run in the background. `None` uses the configured parallelism.
    pub fn start(&self, targets: Vec<String>, parallelism: Option<usize>) -> BulkRunHandle {
        let run_id = RunId::new();
        let run = Arc::new(Mutex::new(BulkRun::new(run_id, targets)));
        self.active.lock().insert(run_id, Arc::clone(&run));

        let parallelism = parallelism.unwrap_or(self.runner.config().default_parallelism);
        let (progress_tx, progress) = self.runner.subscribe();
        let runner = Arc::clone(&self.runner);
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let active = Arc::clone(&self.active);

        self.tasks.spawn(async move {
            let finished = runner.run_tracked(run, parallelism, Some(progress_tx)).await;
            let ttl = runner.config().snapshot_ttl();
            match store.set_json(&keys::bulk_run(run_id), &finished, Some(ttl)).await {
                Ok(()) => {
                    active.lock().remove(&run_id);
                }
                Err(err) => {
                    // Keep serving it from memory.
                    tracing::warn!(run_id = %run_id, "failed to persist bulk run: {err}");
                }
            }
            publish_quietly(
                events.as_ref(),
                EventPayload::BulkRunFinished {
                    run_id,
                    status: finished.status,
                    total: finished.total,
                    success_count: finished.success_count,
                    failed_count: finished.failed_count,
                },
            )
            .await;
        });

        BulkRunHandle { run_id, progress }
    }

    /// Current snapshot of a run, in flight or finished.
    pub async fn get(&self, run_id: RunId) -> anyhow::Result<Option<BulkRun>> {
        let active = self.active.lock().get(&run_id).cloned();
        if let Some(run) = active {
            return Ok(Some(run.lock().clone()));
        }
        self.store.get_json(&keys::bulk_run(run_id)).await
    }

    /// Waits for in-flight runs to finish, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::status::InMemoryStatusStore;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the targets listed in `failing` and tracks peak concurrency.
    struct Selective {
        failing: HashSet<String>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Selective {
        fn new(failing: &[&str], delay: Duration) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ItemExecutor for Selective {
        async fn execute(&self, target: &str, log: &LogSink) -> anyhow::Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            log.line(format!("working on {target}"));
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.failing.contains(target) {
                anyhow::bail!("{target} unreachable");
            }
            Ok(())
        }
    }

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    #[tokio::test]
    async fn test_partial_run_counts() {
        let executor = Arc::new(Selective::new(
            &["node-1", "node-4", "node-6", "node-9"],
            Duration::from_millis(5),
        ));
        let runner = BulkRunner::new(BulkConfig::default(), executor.clone());

        let run = runner.run(targets(10), 3).await;

        assert_eq!(run.total, 10);
        assert_eq!(run.items.len(), 10);
        assert_eq!(run.success_count, 6);
        assert_eq!(run.failed_count, 4);
        assert_eq!(run.completed_count, 10);
        assert_eq!(run.status, BulkRunStatus::Partial);
        assert!(run.items.iter().all(|i| i.status != BulkItemStatus::Pending));
        assert_eq!(
            run.items[4].error.as_deref(),
            Some("node-4 unreachable")
        );
        assert!(executor.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_run_completes() {
        let runner = BulkRunner::new(
            BulkConfig::default(),
            Arc::new(Selective::new(&[], Duration::ZERO)),
        );
        let run = runner.run(Vec::new(), 4).await;
        assert_eq!(run.status, BulkRunStatus::Completed);
        assert_eq!(run.total, 0);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_all_failed() {
        let runner = BulkRunner::new(
            BulkConfig::default(),
            Arc::new(Selective::new(&["node-0", "node-1"], Duration::ZERO)),
        );
        let run = runner.run(targets(2), 8).await;
        assert_eq!(run.status, BulkRunStatus::Failed);
    }

    #[tokio::test]
    async fn test_item_timeout_fails_item() {
        let config = BulkConfig {
            item_timeout_secs: 1,
            ..BulkConfig::default()
        };
        let runner = BulkRunner::new(config, Arc::new(Selective::new(&[], Duration::from_secs(5))));
        let run = runner.run(targets(1), 1).await;
        assert_eq!(run.failed_count, 1);
        assert!(run.items[0]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("timed out")));
    }

    #[tokio::test]
    async fn test_progress_reports_every_item_and_logs() {
        let runner = BulkRunner::new(
            BulkConfig::default(),
            Arc::new(Selective::new(&[], Duration::ZERO)),
        );
        let (tx, mut rx) = runner.subscribe();
        let run = runner.run_with_progress(targets(5), 2, tx).await;
        assert_eq!(run.success_count, 5);

        let mut progress = Vec::new();
        let mut logs = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                BulkEvent::Progress(p) => progress.push(p),
                BulkEvent::Log { .. } => logs += 1,
            }
        }
        assert_eq!(logs, 5);
        assert_eq!(progress.len(), 5);
        let last = progress.last().map(|p| (p.completed, p.percent));
        assert_eq!(last, Some((5, 100.0)));
    }

    #[tokio::test]
    async fn test_full_progress_channel_does_not_block() {
        let config = BulkConfig {
            progress_capacity: 1,
            ..BulkConfig::default()
        };
        let runner = BulkRunner::new(config, Arc::new(Selective::new(&[], Duration::ZERO)));
        let (tx, _rx) = runner.subscribe();
        let run = runner.run_with_progress(targets(20), 4, tx).await;
        assert_eq!(run.completed_count, 20);
    }

    #[tokio::test]
    async fn test_registry_serves_finished_run() {
        let store: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
        let events = Arc::new(InProcEventBus::new("test", 16));
        let mut rx = events.subscribe();
        let runner = Arc::new(BulkRunner::new(
            BulkConfig::default(),
            Arc::new(Selective::new(&["node-2"], Duration::from_millis(1))),
        ));
        let registry = BulkRunRegistry::new(runner, Arc::clone(&store), events);

        let handle = registry.start(targets(4), Some(2));
        assert!(registry.get(handle.run_id).await.unwrap().is_some());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::BulkRunFinished { status: BulkRunStatus::Partial, .. }
        ));

        let first = registry.get(handle.run_id).await.unwrap().unwrap();
        let second = registry.get(handle.run_id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!((first.success_count, first.failed_count), (3, 1));
        assert_eq!(registry.active_runs(), 0);
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(BulkRunStatus::from_counts(0, 0), BulkRunStatus::Completed);
        assert_eq!(BulkRunStatus::from_counts(3, 0), BulkRunStatus::Completed);
        assert_eq!(BulkRunStatus::from_counts(0, 3), BulkRunStatus::Failed);
        assert_eq!(BulkRunStatus::from_counts(1, 2), BulkRunStatus::Partial);
    }
}
