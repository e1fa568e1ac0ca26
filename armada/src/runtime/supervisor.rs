use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::bulk::{BulkRun, BulkRunHandle, BulkRunRegistry, RunId};
use crate::config::ArmadaConfig;
use crate::error::ArmadaError;
use crate::events::{ArmadaEvent, EventPublisher};
use crate::job::{Jid, JobRecord};
use crate::plane::{DispatchRequest, ExecutionPlane};
use crate::queue::{QueueHealth, TaskHandler, TaskQueue};
use crate::reconciler::JobReconciler;
use crate::soft_delete::{DeleteTask, SoftDeleteService};
use crate::task::{NewTask, TaskId, TaskStatus};

/// Caller-facing handle owning every armada service.
///
/// Built by [`ArmadaRuntimeBuilder`](super::ArmadaRuntimeBuilder). Background
/// loops run between [`start`](Self::start) and [`shutdown`](Self::shutdown).
/// A runtime is started at most once; after shutdown, build a new one.
pub struct ArmadaRuntime {
    config: ArmadaConfig,
    queue: TaskQueue,
    reconciler: Arc<JobReconciler>,
    plane: Arc<dyn ExecutionPlane>,
    bulk: BulkRunRegistry,
    deletes: Arc<SoftDeleteService>,
    events: Arc<dyn EventPublisher>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl fmt::Debug for ArmadaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmadaRuntime")
            .field("queue", &self.queue)
            .field("reconciler", &self.reconciler)
            .field("bulk", &self.bulk)
            .field("deletes", &self.deletes)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ArmadaRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ArmadaConfig,
        queue: TaskQueue,
        reconciler: Arc<JobReconciler>,
        plane: Arc<dyn ExecutionPlane>,
        bulk: BulkRunRegistry,
        deletes: Arc<SoftDeleteService>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            queue,
            reconciler,
            plane,
            bulk,
            deletes,
            events,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ArmadaConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &Arc<JobReconciler> {
        &self.reconciler
    }

    pub fn soft_deletes(&self) -> &Arc<SoftDeleteService> {
        &self.deletes
    }

    pub fn events(&self) -> Arc<dyn EventPublisher> {
        Arc::clone(&self.events)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ArmadaEvent> {
        self.events.subscribe()
    }

    /// Starts the retry promoter, the reconciler, and the soft-delete worker.
    /// Calling it again has no effect.
    ///
    /// # Errors
    ///
    /// Fails once [`shutdown`](Self::shutdown) has run: the background loops
    /// cannot be revived.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            anyhow::bail!("armada runtime was shut down and cannot be restarted");
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.start();
        self.reconciler.start();
        self.deletes.start();
        tracing::info!("armada runtime started");
        Ok(())
    }

    /// Stops every background loop, waiting up to `shutdown_timeout` for each.
    pub async fn shutdown(&self) {
        tracing::info!("initiating graceful shutdown of armada runtime");
        self.stopped.store(true, Ordering::SeqCst);
        let timeout = self.config.shutdown_timeout();
        self.queue.shutdown(timeout).await;
        self.reconciler.shutdown(timeout).await;
        self.deletes.shutdown(timeout).await;
        self.bulk.shutdown(timeout).await;
        tracing::info!("armada runtime shutdown complete");
    }

    pub async fn submit(&self, topic: &str, task: NewTask) -> anyhow::Result<TaskId> {
        self.queue.enqueue(topic, task).await
    }

    pub async fn task_status(&self, task_id: TaskId) -> anyhow::Result<Option<TaskStatus>> {
        self.queue.status(task_id).await
    }

    pub async fn cancel_task(&self, task_id: TaskId, requester: &str) -> Result<(), ArmadaError> {
        self.queue.cancel(task_id, requester).await
    }

    /// Starts a consumer for `topic` in `group`.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> anyhow::Result<()> {
        self.queue.subscribe(topic, group, consumer, handler).await
    }

    pub async fn health(&self, topics: &[&str]) -> QueueHealth {
        self.queue.health_check(topics).await
    }

    /// Starts a bulk run in the background. `None` uses the configured parallelism.
    pub fn start_bulk_run(&self, targets: Vec<String>, parallelism: Option<usize>) -> BulkRunHandle {
        self.bulk.start(targets, parallelism)
    }

    pub async fn bulk_run(&self, run_id: RunId) -> anyhow::Result<Option<BulkRun>> {
        self.bulk.get(run_id).await
    }

    pub async fn soft_delete(&self, target_id: &str, force: bool) -> anyhow::Result<DeleteTask> {
        self.deletes.soft_delete(target_id, force).await
    }

    pub async fn delete_status(&self, target_id: &str) -> anyhow::Result<Option<DeleteTask>> {
        self.deletes.get(target_id).await
    }

    pub async fn cancel_delete(&self, target_id: &str) -> Result<DeleteTask, ArmadaError> {
        self.deletes.cancel(target_id).await
    }

    /// Dispatches to the execution plane and tracks the returned jid.
    pub async fn dispatch_job(
        &self,
        request: &DispatchRequest,
        task_id: Option<TaskId>,
    ) -> anyhow::Result<JobRecord> {
        let jid = self.plane.dispatch(request).await?;
        tracing::info!(jid = %jid, target = %request.target, function = %request.function, "job dispatched");
        self.reconciler.track(jid, task_id).await
    }

    pub async fn track_job(&self, jid: Jid, task_id: Option<TaskId>) -> anyhow::Result<JobRecord> {
        self.reconciler.track(jid, task_id).await
    }

    /// Fires `callback` once when `jid` reaches a terminal state, right away
    /// if it already has.
    pub async fn on_job_complete<F>(&self, jid: Jid, callback: F) -> anyhow::Result<()>
    where
        F: FnOnce(&JobRecord) + Send + 'static,
    {
        self.reconciler.register_callback(jid, callback).await
    }

    pub async fn force_check_job(&self, jid: &Jid) -> anyhow::Result<JobRecord> {
        self.reconciler.force_check(jid).await
    }

    pub async fn wait_for_job(&self, jid: &Jid, timeout: Duration) -> Result<JobRecord, ArmadaError> {
        self.reconciler.wait_for_completion(jid, timeout).await
    }
}
