//! Soft-delete with background retry.
//!
//! [`SoftDeleteService::soft_delete`] records a [`DeleteTask`] and returns at
//! once. A single worker performs the deletion; a periodic sweep re-queues
//! tasks that are still pending or failed with retries left, which also
//! recovers work persisted before a restart. A task left in `deleting` longer
//! than the delete timeout plus a grace period lost its worker, so the sweep
//! marks it failed and it is retried like any other failure.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::SoftDeleteConfig;
use crate::error::ArmadaError;
use crate::events::{publish_quietly, EventPayload, EventPublisher};
use crate::runtime::{BackgroundTasks, ShutdownToken};
use crate::telemetry::{delete_task_span, record_delete_outcome};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeleteTaskId(pub Uuid);

impl DeleteTaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DeleteTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DeleteTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStatus {
    Pending,
    Deleting,
    Completed,
    Failed,
    Cancelled,
}

impl DeleteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteStatus::Pending => "pending",
            DeleteStatus::Deleting => "deleting",
            DeleteStatus::Completed => "completed",
            DeleteStatus::Failed => "failed",
            DeleteStatus::Cancelled => "cancelled",
        }
    }
}

impl Display for DeleteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeleteStatus {
    type Err = ArmadaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeleteStatus::Pending),
            "deleting" => Ok(DeleteStatus::Deleting),
            "completed" => Ok(DeleteStatus::Completed),
            "failed" => Ok(DeleteStatus::Failed),
            "cancelled" => Ok(DeleteStatus::Cancelled),
            other => Err(ArmadaError::Serialization(format!("unknown delete status '{other}'"))),
        }
    }
}

/// A request to delete one target, with its retry bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteTask {
    pub id: DeleteTaskId,
    pub target_id: String,
    pub status: DeleteStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub force: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeleteTask {
    pub fn new(target_id: impl Into<String>, force: bool, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: DeleteTaskId::new(),
            target_id: target_id.into(),
            status: DeleteStatus::Pending,
            retry_count: 0,
            max_retries,
            force,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed with retries left. `retry_count` counts failed attempts, so a
    /// task gets the first attempt plus `max_retries` retries.
    pub fn can_retry(&self) -> bool {
        self.status == DeleteStatus::Failed && self.retry_count <= self.max_retries
    }

    /// Pending, deleting, or retry-eligible.
    pub fn is_active(&self) -> bool {
        matches!(self.status, DeleteStatus::Pending | DeleteStatus::Deleting) || self.can_retry()
    }

    /// Whether the worker may pick it up.
    pub fn is_runnable(&self) -> bool {
        self.status == DeleteStatus::Pending || self.can_retry()
    }

    pub fn apply(&mut self, update: &DeleteUpdate) {
        self.status = update.status;
        self.retry_count = update.retry_count;
        self.last_error = update.last_error.clone();
        self.updated_at = update.updated_at;
    }
}

/// Full replacement of the mutable fields of a [`DeleteTask`].
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteUpdate {
    pub status: DeleteStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeleteUpdate {
    /// Moves to `status`, keeping retry bookkeeping.
    pub fn to(task: &DeleteTask, status: DeleteStatus) -> Self {
        Self {
            status,
            retry_count: task.retry_count,
            last_error: task.last_error.clone(),
            updated_at: Utc::now(),
        }
    }

    pub fn completed(task: &DeleteTask) -> Self {
        Self {
            last_error: None,
            ..Self::to(task, DeleteStatus::Completed)
        }
    }

    pub fn failed(task: &DeleteTask, error: impl Into<String>) -> Self {
        Self {
            retry_count: task.retry_count.saturating_add(1),
            last_error: Some(error.into()),
            ..Self::to(task, DeleteStatus::Failed)
        }
    }
}

/// Persistent delete-task table.
#[async_trait]
pub trait DeleteTaskStore: Send + Sync {
    /// Inserts `task` unless the target already has an active task, in which
    /// case that one is returned. Atomic per target.
    async fn insert_unless_active(&self, task: DeleteTask) -> anyhow::Result<DeleteTask>;

    async fn get(&self, id: DeleteTaskId) -> anyhow::Result<Option<DeleteTask>>;

    async fn find_active(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>>;

    /// Most recently created task for `target_id`, in any status.
    async fn latest_for_target(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>>;

    /// Tasks in `status`, oldest first. `None` lists everything.
    async fn list(&self, status: Option<DeleteStatus>) -> anyhow::Result<Vec<DeleteTask>>;

    /// Applies `update` only while the stored status equals `expected`.
    async fn update_if(
        &self,
        id: DeleteTaskId,
        expected: DeleteStatus,
        update: &DeleteUpdate,
    ) -> anyhow::Result<bool>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDeleteTaskStore {
    tasks: Arc<Mutex<HashMap<DeleteTaskId, DeleteTask>>>,
}

impl InMemoryDeleteTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeleteTaskStore for InMemoryDeleteTaskStore {
    async fn insert_unless_active(&self, task: DeleteTask) -> anyhow::Result<DeleteTask> {
        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks
            .values()
            .filter(|t| t.target_id == task.target_id && t.is_active())
            .min_by_key(|t| t.created_at)
        {
            return Ok(existing.clone());
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: DeleteTaskId) -> anyhow::Result<Option<DeleteTask>> {
        Ok(self.tasks.lock().get(&id).cloned())
    }

    async fn find_active(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.target_id == target_id && t.is_active())
            .min_by_key(|t| t.created_at)
            .cloned())
    }

    async fn latest_for_target(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|t| t.target_id == target_id)
            .max_by_key(|t| (t.created_at, t.id.0))
            .cloned())
    }

    async fn list(&self, status: Option<DeleteStatus>) -> anyhow::Result<Vec<DeleteTask>> {
        let mut tasks: Vec<DeleteTask> = self
            .tasks
            .lock()
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id.0));
        Ok(tasks)
    }

    async fn update_if(
        &self,
        id: DeleteTaskId,
        expected: DeleteStatus,
        update: &DeleteUpdate,
    ) -> anyhow::Result<bool> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&id) {
            Some(task) if task.status == expected => {
                task.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Performs the actual deletion of a target.
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, target_id: &str, force: bool) -> anyhow::Result<()>;
}

/// Accepts delete requests and drives them to completion in the background.
pub struct SoftDeleteService {
    config: SoftDeleteConfig,
    store: Arc<dyn DeleteTaskStore>,
    deleter: Arc<dyn Deleter>,
    events: Arc<dyn EventPublisher>,
    queue: mpsc::Sender<DeleteTaskId>,
    receiver: Mutex<Option<mpsc::Receiver<DeleteTaskId>>>,
    in_flight: Mutex<HashSet<DeleteTaskId>>,
    tasks: BackgroundTasks,
}

impl fmt::Debug for SoftDeleteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDeleteService")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.lock().len())
            .field("running", &self.tasks.is_running())
            .finish()
    }
}

impl SoftDeleteService {
    pub fn new(
        config: SoftDeleteConfig,
        store: Arc<dyn DeleteTaskStore>,
        deleter: Arc<dyn Deleter>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            config,
            store,
            deleter,
            events,
            queue,
            receiver: Mutex::new(Some(receiver)),
            in_flight: Mutex::new(HashSet::new()),
            tasks: BackgroundTasks::new("soft-delete"),
        }
    }

    pub fn config(&self) -> &SoftDeleteConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn DeleteTaskStore> {
        Arc::clone(&self.store)
    }

    /// Records a delete request and returns without waiting for the deletion.
    /// A target with an active task gets that task back.
    pub async fn soft_delete(&self, target_id: &str, force: bool) -> anyhow::Result<DeleteTask> {
        let candidate = DeleteTask::new(target_id, force, self.config.max_retries);
        let candidate_id = candidate.id;
        let task = self.store.insert_unless_active(candidate).await?;

        if task.id == candidate_id {
            tracing::info!(task_id = %task.id, target_id = %target_id, force, "soft delete requested");
            self.publish(&task).await;
        } else {
            tracing::debug!(task_id = %task.id, target_id = %target_id, "soft delete already active");
        }
        if task.is_runnable() {
            self.enqueue(task.id);
        }
        Ok(task)
    }

    /// Cancels the target's task. Allowed only while pending or failed.
    pub async fn cancel(&self, target_id: &str) -> Result<DeleteTask, ArmadaError> {
        let task = self
            .store
            .latest_for_target(target_id)
            .await
            .map_err(ArmadaError::transient)?
            .ok_or_else(|| ArmadaError::NotFound(format!("delete task for {target_id}")))?;

        if !matches!(task.status, DeleteStatus::Pending | DeleteStatus::Failed) {
            return Err(ArmadaError::CancelRejected(format!(
                "delete of {target_id} is {}",
                task.status
            )));
        }
        let update = DeleteUpdate::to(&task, DeleteStatus::Cancelled);
        let won = self
            .store
            .update_if(task.id, task.status, &update)
            .await
            .map_err(ArmadaError::transient)?;
        if !won {
            return Err(ArmadaError::CancelRejected(format!(
                "delete of {target_id} changed concurrently"
            )));
        }

        let mut cancelled = task;
        cancelled.apply(&update);
        tracing::info!(task_id = %cancelled.id, target_id = %target_id, "soft delete cancelled");
        self.publish(&cancelled).await;
        Ok(cancelled)
    }

    /// Latest task for `target_id`.
    pub async fn get(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        self.store.latest_for_target(target_id).await
    }

    pub async fn get_task(&self, id: DeleteTaskId) -> anyhow::Result<Option<DeleteTask>> {
        self.store.get(id).await
    }

    pub async fn list(&self, status: Option<DeleteStatus>) -> anyhow::Result<Vec<DeleteTask>> {
        self.store.list(status).await
    }

    /// Reclaims stale `deleting` tasks, then re-queues runnable tasks not
    /// already in flight. Returns how many were queued.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        self.reclaim_stale().await?;

        let mut runnable = self.store.list(Some(DeleteStatus::Pending)).await?;
        runnable.extend(
            self.store
                .list(Some(DeleteStatus::Failed))
                .await?
                .into_iter()
                .filter(DeleteTask::can_retry),
        );
        Ok(runnable.into_iter().filter(|t| self.enqueue(t.id)).count())
    }

    /// Fails `deleting` tasks whose worker is gone: not in flight here and not
    /// updated within the reclaim window. Returns how many were reclaimed.
    pub async fn reclaim_stale(&self) -> anyhow::Result<usize> {
        let window = chrono::Duration::from_std(self.config.reclaim_after())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - window;

        let mut reclaimed = 0;
        for task in self.store.list(Some(DeleteStatus::Deleting)).await? {
            if task.updated_at > cutoff || self.in_flight.lock().contains(&task.id) {
                continue;
            }
            let update = DeleteUpdate::failed(&task, "delete interrupted: worker lost while deleting");
            if !self.store.update_if(task.id, DeleteStatus::Deleting, &update).await? {
                continue;
            }
            let mut task = task;
            task.apply(&update);
            tracing::warn!(
                task_id = %task.id,
                target_id = %task.target_id,
                retry_count = task.retry_count,
                "reclaimed stale deleting task"
            );
            record_delete_outcome(&task.target_id, task.status.as_str());
            self.publish(&task).await;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    /// Starts the worker and the sweep. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(receiver) = self.receiver.lock().take() else {
            tracing::warn!("soft delete service already started");
            return;
        };
        self.tasks
            .spawn(Arc::clone(self).work(receiver, self.tasks.token()));
        self.tasks.spawn(Arc::clone(self).sweep(self.tasks.token()));
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown(timeout).await;
    }

    /// Queues `id` unless it is already in flight. Never waits: a full queue
    /// leaves the task for the next sweep.
    fn enqueue(&self, id: DeleteTaskId) -> bool {
        if !self.in_flight.lock().insert(id) {
            return false;
        }
        match self.queue.try_send(id) {
            Ok(()) => true,
            Err(err) => {
                self.in_flight.lock().remove(&id);
                tracing::debug!(task_id = %id, "delete queue unavailable, deferring to sweep: {err}");
                false
            }
        }
    }

    async fn work(self: Arc<Self>, mut receiver: mpsc::Receiver<DeleteTaskId>, shutdown: ShutdownToken) {
        loop {
            let id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };
            if let Err(err) = self.process(id).await {
                tracing::error!(task_id = %id, "soft delete processing failed: {err:#}");
            }
            self.in_flight.lock().remove(&id);
        }
        tracing::info!("soft delete worker shutting down");
    }

    async fn sweep(self: Arc<Self>, shutdown: ShutdownToken) {
        let interval = self.config.sweep_interval();
        loop {
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(queued) => tracing::debug!(queued, "soft delete sweep"),
                Err(err) => tracing::warn!("soft delete sweep failed: {err}"),
            }
            if !shutdown.sleep(interval).await {
                break;
            }
        }
    }

    async fn process(&self, id: DeleteTaskId) -> anyhow::Result<()> {
        let Some(task) = self.store.get(id).await? else {
            return Ok(());
        };
        if !task.is_runnable() {
            return Ok(());
        }
        let span = delete_task_span(id.to_string(), &task.target_id);
        self.attempt(task).instrument(span).await
    }

    async fn attempt(&self, task: DeleteTask) -> anyhow::Result<()> {
        let start = DeleteUpdate::to(&task, DeleteStatus::Deleting);
        if !self.store.update_if(task.id, task.status, &start).await? {
            // Cancelled or picked up elsewhere.
            return Ok(());
        }
        let mut task = task;
        task.apply(&start);
        self.publish(&task).await;

        let timeout = self.config.delete_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(self.deleter.delete(&task.target_id, task.force)).catch_unwind(),
        )
        .await;
        let update = match outcome {
            Ok(Ok(Ok(()))) => DeleteUpdate::completed(&task),
            Ok(Ok(Err(err))) => DeleteUpdate::failed(&task, format!("{err:#}")),
            Ok(Err(_)) => DeleteUpdate::failed(&task, "deleter panicked"),
            Err(_) => DeleteUpdate::failed(&task, ArmadaError::Timeout(timeout).to_string()),
        };

        if !self.store.update_if(task.id, DeleteStatus::Deleting, &update).await? {
            anyhow::bail!("delete task {} left deleting by another writer", task.id);
        }
        task.apply(&update);
        record_delete_outcome(&task.target_id, task.status.as_str());
        if let Some(error) = &task.last_error {
            tracing::warn!(
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "delete failed: {error}"
            );
        }
        self.publish(&task).await;
        Ok(())
    }

    async fn publish(&self, task: &DeleteTask) {
        publish_quietly(
            self.events.as_ref(),
            EventPayload::DeleteTaskChanged {
                task_id: task.id,
                target_id: task.target_id.clone(),
                status: task.status,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingDeleter {
        calls: AtomicUsize,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Deleter for CountingDeleter {
        async fn delete(&self, target_id: &str, _force: bool) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                anyhow::bail!("{target_id} is still attached");
            }
            Ok(())
        }
    }

    fn config() -> SoftDeleteConfig {
        SoftDeleteConfig {
            sweep_interval_ms: 20,
            max_retries: 2,
            ..SoftDeleteConfig::default()
        }
    }

    fn service(
        deleter: Arc<CountingDeleter>,
    ) -> (Arc<SoftDeleteService>, InMemoryDeleteTaskStore) {
        let store = InMemoryDeleteTaskStore::new();
        let service = SoftDeleteService::new(
            config(),
            Arc::new(store.clone()),
            deleter,
            Arc::new(InProcEventBus::new("test", 64)),
        );
        (Arc::new(service), store)
    }

    async fn wait_for(service: &SoftDeleteService, target: &str, status: DeleteStatus) -> DeleteTask {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(task) = service.get(target).await.unwrap() {
                    if task.status == status {
                        return task;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status not reached in time")
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent_while_pending() {
        let (service, store) = service(Arc::new(CountingDeleter::default()));

        let first = service.soft_delete("cluster-9", false).await.unwrap();
        let second = service.soft_delete("cluster-9", true).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert!(!second.force);
    }

    #[tokio::test]
    async fn test_worker_completes_delete() {
        let deleter = Arc::new(CountingDeleter::default());
        let (service, _) = service(deleter.clone());
        service.start();

        service.soft_delete("cluster-1", false).await.unwrap();
        let done = wait_for(&service, "cluster-1", DeleteStatus::Completed).await;

        assert_eq!(done.retry_count, 0);
        assert_eq!(deleter.calls.load(Ordering::SeqCst), 1);
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failures_retry_until_exhausted() {
        let deleter = Arc::new(CountingDeleter {
            fail: true,
            ..CountingDeleter::default()
        });
        let (service, _) = service(deleter.clone());
        service.start();

        service.soft_delete("cluster-2", false).await.unwrap();
        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = service.get("cluster-2").await.unwrap().unwrap();
                if task.status == DeleteStatus::Failed && !task.can_retry() {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // One initial attempt plus max_retries (2) retries.
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.last_error.as_deref(), Some("cluster-2 is still attached"));
        service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(deleter.calls.load(Ordering::SeqCst), 3);

        // Exhausted tasks are no longer active, so a new request starts fresh.
        let fresh = service.soft_delete("cluster-2", false).await.unwrap();
        assert_ne!(fresh.id, failed.id);
    }

    #[tokio::test]
    async fn test_cancel_pending_then_rejected() {
        let (service, _) = service(Arc::new(CountingDeleter::default()));
        service.soft_delete("cluster-3", false).await.unwrap();

        let cancelled = service.cancel("cluster-3").await.unwrap();
        assert_eq!(cancelled.status, DeleteStatus::Cancelled);

        let err = service.cancel("cluster-3").await.unwrap_err();
        assert!(matches!(err, ArmadaError::CancelRejected(_)));
        assert!(matches!(
            service.cancel("missing").await,
            Err(ArmadaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_rejected_while_deleting() {
        let gate = Arc::new(Notify::new());
        let deleter = Arc::new(CountingDeleter {
            gate: Some(gate.clone()),
            ..CountingDeleter::default()
        });
        let (service, _) = service(deleter);
        service.start();

        service.soft_delete("cluster-4", false).await.unwrap();
        wait_for(&service, "cluster-4", DeleteStatus::Deleting).await;

        assert!(matches!(
            service.cancel("cluster-4").await,
            Err(ArmadaError::CancelRejected(_))
        ));

        gate.notify_one();
        wait_for(&service, "cluster-4", DeleteStatus::Completed).await;
        service.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_sweep_skips_in_flight_and_terminal() {
        let (service, store) = service(Arc::new(CountingDeleter::default()));
        service.soft_delete("a", false).await.unwrap();
        service.soft_delete("b", false).await.unwrap();
        service.cancel("b").await.unwrap();

        // "a" was queued by soft_delete and is still in flight.
        assert_eq!(service.sweep_once().await.unwrap(), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(service.list(Some(DeleteStatus::Cancelled)).await.unwrap().len(), 1);
        assert_eq!(service.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_if_single_winner() {
        let store = Arc::new(InMemoryDeleteTaskStore::new());
        let task = store
            .insert_unless_active(DeleteTask::new("x", false, 3))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let task = task.clone();
            handles.push(tokio::spawn(async move {
                let update = DeleteUpdate::to(&task, DeleteStatus::Deleting);
                store.update_if(task.id, DeleteStatus::Pending, &update).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_failed_update_counts_retries() {
        let task = DeleteTask::new("x", false, 1);
        let mut failed = task.clone();
        failed.apply(&DeleteUpdate::failed(&task, "boom"));
        assert_eq!(failed.retry_count, 1);
        assert!(failed.can_retry());
        assert!(failed.is_active());

        let again = DeleteUpdate::failed(&failed, "boom again");
        failed.apply(&again);
        assert_eq!(failed.retry_count, 2);
        assert!(!failed.can_retry());
        assert!(!failed.is_active());
    }

    #[test]
    fn test_zero_max_retries_allows_single_attempt() {
        let task = DeleteTask::new("x", false, 0);
        let mut failed = task.clone();
        failed.apply(&DeleteUpdate::failed(&task, "boom"));
        assert!(!failed.can_retry());
    }

    fn stale_deleting(target: &str, age: chrono::Duration) -> DeleteTask {
        let mut task = DeleteTask::new(target, false, 2);
        task.status = DeleteStatus::Deleting;
        task.updated_at = Utc::now() - age;
        task
    }

    #[tokio::test]
    async fn test_sweep_reclaims_stale_deleting_task() {
        let deleter = Arc::new(CountingDeleter::default());
        let (service, store) = service(deleter.clone());
        let stuck = store
            .insert_unless_active(stale_deleting("cluster-x", chrono::Duration::hours(1)))
            .await
            .unwrap();

        service.start();
        let done = wait_for(&service, "cluster-x", DeleteStatus::Completed).await;

        assert_eq!(done.id, stuck.id);
        assert_eq!(done.retry_count, 1);
        assert_eq!(deleter.calls.load(Ordering::SeqCst), 1);
        service.shutdown(Duration::from_secs(1)).await;

        let next = service.soft_delete("cluster-x", false).await.unwrap();
        assert_ne!(next.id, stuck.id);
    }

    #[tokio::test]
    async fn test_recent_deleting_task_is_left_alone() {
        let (service, store) = service(Arc::new(CountingDeleter::default()));
        store
            .insert_unless_active(stale_deleting("cluster-y", chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(service.reclaim_stale().await.unwrap(), 0);
        assert_eq!(service.sweep_once().await.unwrap(), 0);
        let task = service.get("cluster-y").await.unwrap().unwrap();
        assert_eq!(task.status, DeleteStatus::Deleting);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_reclaimed_task_can_be_cancelled() {
        let (service, store) = service(Arc::new(CountingDeleter::default()));
        store
            .insert_unless_active(stale_deleting("cluster-z", chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(service.reclaim_stale().await.unwrap(), 1);
        let task = service.get("cluster-z").await.unwrap().unwrap();
        assert_eq!(task.status, DeleteStatus::Failed);
        assert!(task.can_retry());

        let cancelled = service.cancel("cluster-z").await.unwrap();
        assert_eq!(cancelled.status, DeleteStatus::Cancelled);
    }
}
