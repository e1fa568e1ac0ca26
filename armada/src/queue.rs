//! Durable task queue on top of a [`Broker`].
//!
//! Delivery is at-least-once. Each task carries its id end to end, and a
//! delivery whose status is already terminal is acknowledged without running
//! the handler again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;

use crate::broker::{Broker, Delivery, MessageId, ReadRequest};
use crate::config::QueueConfig;
use crate::error::ArmadaError;
use crate::events::{publish_quietly, EventPayload, EventPublisher};
use crate::retry::{BackoffPolicy, RetryScheduler};
use crate::runtime::{BackgroundTasks, ShutdownToken};
use crate::status::{keys, StatusStore, StatusStoreExt};
use crate::task::{NewTask, Task, TaskId, TaskState, TaskStatus};
use crate::telemetry;

/// Result of running a handler on one delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum HandlerOutcome {
    Completed { result: Option<Value> },
    /// Retried with backoff while the task has retries left.
    RetryableFailure { error: String },
    /// Marks the task failed without further attempts.
    PermanentFailure { error: String },
    /// The handler observed a stop request.
    Stopped,
}

impl HandlerOutcome {
    pub fn completed(result: Value) -> Self {
        Self::Completed {
            result: Some(result),
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::RetryableFailure {
            error: error.into(),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self::PermanentFailure {
            error: error.into(),
        }
    }
}

impl From<anyhow::Result<Option<Value>>> for HandlerOutcome {
    fn from(result: anyhow::Result<Option<Value>>) -> Self {
        match result {
            Ok(result) => Self::Completed { result },
            Err(err) => Self::RetryableFailure {
                error: err.to_string(),
            },
        }
    }
}

/// Per-delivery context handed to a [`TaskHandler`].
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    store: Arc<dyn StatusStore>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl TaskContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 1 on the first delivery of a task, incremented per retry.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Checkpoint for cooperative cancellation. Long handlers call this
    /// between steps and return [`HandlerOutcome::Stopped`] when it is true.
    pub async fn should_stop(&self) -> bool {
        match self.store.exists(&keys::task_stop(self.task_id)).await {
            Ok(stop) => stop,
            Err(err) => {
                tracing::warn!(task_id = %self.task_id, "stop flag check failed: {err}");
                false
            }
        }
    }
}

/// Business logic run for each delivered task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> HandlerOutcome;
}

/// Broker and topic reachability reported by [`TaskQueue::health_check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueHealth {
    pub broker_ok: bool,
    pub broker_error: Option<String>,
    pub topics: Vec<(String, bool)>,
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        self.broker_ok && self.topics.iter().all(|(_, ok)| *ok)
    }
}

struct QueueInner {
    config: QueueConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn StatusStore>,
    events: Arc<dyn EventPublisher>,
    backoff: BackoffPolicy,
    retries: RetryScheduler,
    consumers: BackgroundTasks,
}

/// Stream-backed task queue with consumer groups and retry backoff.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("config", &self.inner.config)
            .field("backoff", &self.inner.backoff)
            .field("consumers", &self.inner.consumers.len())
            .field("retries", &self.inner.retries)
            .finish()
    }
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn StatusStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let backoff = BackoffPolicy::from(&config.backoff);
        let retries = RetryScheduler::new(Arc::clone(&broker), config.promote_interval());
        Self {
            inner: Arc::new(QueueInner {
                config,
                broker,
                store,
                events,
                backoff,
                retries,
                consumers: BackgroundTasks::new("task-queue"),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.inner.broker)
    }

    pub fn retry_scheduler(&self) -> &RetryScheduler {
        &self.inner.retries
    }

    /// Starts promoting delayed retries. Consumers are started separately
    /// through [`TaskQueue::subscribe`].
    pub fn start(&self) {
        self.inner.retries.start();
    }

    /// Stores the pending status and payload, then appends the task.
    pub async fn enqueue(&self, topic: &str, new_task: NewTask) -> anyhow::Result<TaskId> {
        let inner = &self.inner;
        let task = Task {
            id: TaskId::new(),
            topic: topic.to_string(),
            owner_id: new_task.owner_id,
            payload: new_task.payload,
            priority: new_task.priority,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: new_task
                .max_retries
                .unwrap_or(inner.config.default_max_retries),
        };
        let ttl = Some(inner.config.status_ttl());

        inner
            .store
            .set_json(&keys::task_status(task.id), &TaskStatus::pending(&task), ttl)
            .await?;
        let raw = serde_json::to_string(&task)?;
        inner
            .store
            .set(&keys::task_payload(task.id), raw.clone(), ttl)
            .await?;
        inner.broker.append(topic, raw).await?;
        inner.retries.watch(topic);

        telemetry::record_task_enqueued(topic, task.priority.as_str());
        publish_quietly(
            inner.events.as_ref(),
            EventPayload::TaskEnqueued {
                task_id: task.id,
                topic: topic.to_string(),
            },
        )
        .await;
        Ok(task.id)
    }

    pub async fn status(&self, task_id: TaskId) -> anyhow::Result<Option<TaskStatus>> {
        self.inner.store.get_json(&keys::task_status(task_id)).await
    }

    /// The task as submitted, while its payload is still retained.
    pub async fn task(&self, task_id: TaskId) -> anyhow::Result<Option<Task>> {
        self.inner.store.get_json(&keys::task_payload(task_id)).await
    }

    /// Requests cooperative cancellation. Only the submitter may cancel.
    pub async fn cancel(&self, task_id: TaskId, requester: &str) -> Result<(), ArmadaError> {
        let inner = &self.inner;
        let task: Task = inner
            .store
            .get_json(&keys::task_payload(task_id))
            .await
            .map_err(ArmadaError::transient)?
            .ok_or_else(|| ArmadaError::NotFound(format!("task {task_id}")))?;

        if task.owner_id != requester {
            return Err(ArmadaError::NotOwner {
                task_id,
                requester: requester.to_string(),
            });
        }

        let status: Option<TaskStatus> = inner
            .store
            .get_json(&keys::task_status(task_id))
            .await
            .map_err(ArmadaError::transient)?;
        if let Some(status) = status.filter(|s| s.status.is_terminal()) {
            return Err(ArmadaError::CancelRejected(format!(
                "task {task_id} already {}",
                status.status
            )));
        }

        inner
            .store
            .set(
                &keys::task_stop(task_id),
                "1".to_string(),
                Some(inner.config.stop_flag_ttl()),
            )
            .await
            .map_err(ArmadaError::transient)?;
        tracing::info!(task_id = %task_id, requester = %requester, "task stop requested");
        Ok(())
    }

    /// Pings the broker and checks that each topic exists. Says nothing about
    /// whether consumers are alive.
    pub async fn health_check(&self, topics: &[&str]) -> QueueHealth {
        let broker = &self.inner.broker;
        let (broker_ok, broker_error) = match broker.ping().await {
            Ok(()) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        };
        let mut checked = Vec::with_capacity(topics.len());
        for topic in topics {
            let reachable = broker_ok && broker.topic_exists(topic).await.unwrap_or(false);
            checked.push((topic.to_string(), reachable));
        }
        QueueHealth {
            broker_ok,
            broker_error,
            topics: checked,
        }
    }

    /// Joins `group` on `topic` as `consumer` and spawns its read loop.
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> anyhow::Result<()> {
        self.inner.broker.ensure_group(topic, group).await?;
        self.inner.retries.watch(topic);

        let consumer = Consumer {
            queue: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            name: consumer.to_string(),
            handler,
        };
        let shutdown = self.inner.consumers.token();
        self.inner.consumers.spawn(consumer.run(shutdown));
        tracing::info!(topic = %topic, group = %group, "consumer subscribed");
        Ok(())
    }

    /// Stops consumers first, then the retry promoter.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.consumers.shutdown(timeout).await;
        self.inner.retries.shutdown(timeout).await;
    }

    /// Handles one delivery end to end and acknowledges it unless the retry
    /// could not be scheduled.
    pub async fn process_delivery(
        &self,
        topic: &str,
        group: &str,
        handler: &dyn TaskHandler,
        delivery: Delivery,
    ) -> anyhow::Result<()> {
        let inner = &self.inner;
        let mut task: Task = match serde_json::from_str(&delivery.payload) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(
                    topic = %topic,
                    message_id = %delivery.id,
                    "dropping undecodable delivery: {err}"
                );
                self.dead_letter(topic, delivery.payload.clone()).await;
                inner.broker.ack(topic, group, &delivery.id).await?;
                return Ok(());
            }
        };

        let status_key = keys::task_status(task.id);
        let ttl = Some(inner.config.status_ttl());
        let stored: Option<TaskStatus> = inner.store.get_json(&status_key).await?;
        let current = match stored {
            Some(status) if status.status.is_terminal() => {
                tracing::debug!(
                    task_id = %task.id,
                    status = %status.status,
                    "acknowledging redelivery of finished task"
                );
                inner.broker.ack(topic, group, &delivery.id).await?;
                return Ok(());
            }
            Some(status) => status,
            None => TaskStatus::pending(&task),
        };

        let ctx = TaskContext {
            task_id: task.id,
            attempt: task.retry_count + 1,
            store: Arc::clone(&inner.store),
        };

        if ctx.should_stop().await {
            self.finish(&task, &current.transition(TaskState::Stopped), Duration::ZERO)
                .await?;
            inner.broker.ack(topic, group, &delivery.id).await?;
            return Ok(());
        }

        let processing = current.transition(TaskState::Processing);
        inner.store.set_json(&status_key, &processing, ttl).await?;
        publish_quietly(
            inner.events.as_ref(),
            EventPayload::TaskStarted {
                task_id: task.id,
                topic: topic.to_string(),
                attempt: ctx.attempt,
            },
        )
        .await;

        let started = Instant::now();
        let run = telemetry::instrument_task(
            task.id.to_string(),
            topic,
            ctx.attempt,
            AssertUnwindSafe(handler.handle(&task, &ctx)).catch_unwind(),
        );
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(_) => HandlerOutcome::retryable("handler panicked"),
        };
        let elapsed = started.elapsed();

        match outcome {
            HandlerOutcome::Completed { result } => {
                self.finish(&task, &processing.completed(result), elapsed).await?;
            }
            HandlerOutcome::Stopped => {
                self.finish(&task, &processing.transition(TaskState::Stopped), elapsed)
                    .await?;
            }
            HandlerOutcome::RetryableFailure { error } if task.can_retry() => {
                task.retry_count += 1;
                let delay = inner.backoff.delay_for(task.retry_count);
                let due_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                // Left unacknowledged on failure so the entry is re-claimed.
                inner
                    .broker
                    .schedule(topic, serde_json::to_string(&task)?, due_at)
                    .await?;

                let mut pending = processing.transition(TaskState::Pending);
                pending.error = Some(error);
                inner.store.set_json(&status_key, &pending, ttl).await?;

                telemetry::record_task_retry_scheduled(topic, task.retry_count, delay);
                publish_quietly(
                    inner.events.as_ref(),
                    EventPayload::TaskRetryScheduled {
                        task_id: task.id,
                        topic: topic.to_string(),
                        retry_count: task.retry_count,
                        delay_ms: delay.as_millis() as u64,
                    },
                )
                .await;
            }
            HandlerOutcome::RetryableFailure { error }
            | HandlerOutcome::PermanentFailure { error } => {
                self.finish(&task, &processing.failed(error), elapsed).await?;
                if inner.config.dead_letter_enabled {
                    self.dead_letter(topic, serde_json::to_string(&task)?).await;
                }
            }
        }

        inner.broker.ack(topic, group, &delivery.id).await?;
        Ok(())
    }

    async fn finish(
        &self,
        task: &Task,
        status: &TaskStatus,
        elapsed: Duration,
    ) -> anyhow::Result<()> {
        let inner = &self.inner;
        inner
            .store
            .set_json(
                &keys::task_status(task.id),
                status,
                Some(inner.config.status_ttl()),
            )
            .await?;
        telemetry::record_task_finished(&task.topic, status.status.as_str(), elapsed);
        publish_quietly(
            inner.events.as_ref(),
            EventPayload::TaskFinished {
                task_id: task.id,
                topic: task.topic.clone(),
                state: status.status,
                error: status.error.clone(),
            },
        )
        .await;
        Ok(())
    }

    async fn dead_letter(&self, topic: &str, payload: String) {
        let dlq = dead_letter_topic(topic);
        match self.inner.broker.append(&dlq, payload).await {
            Ok(_) => telemetry::record_task_dead_lettered(topic),
            Err(err) => tracing::error!(topic = %dlq, "dead-letter append failed: {err}"),
        }
    }
}

/// Topic terminally failed tasks are copied to.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}:dlq")
}

struct Consumer {
    queue: TaskQueue,
    topic: String,
    group: String,
    name: String,
    handler: Arc<dyn TaskHandler>,
}

impl Consumer {
    async fn run(self, shutdown: ShutdownToken) {
        let settings = self.queue.inner.config.consumer.clone();
        let broker = self.queue.broker();
        loop {
            let request = ReadRequest {
                topic: self.topic.clone(),
                group: self.group.clone(),
                consumer: self.name.clone(),
                count: settings.batch_size,
                block: settings.block(),
                claim_idle: settings.claim_idle(),
            };
            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = broker.read_group(request) => read,
            };

            match read {
                Ok(deliveries) if deliveries.is_empty() => {}
                Ok(deliveries) => {
                    let ids: Vec<MessageId> = deliveries.iter().map(|d| d.id.clone()).collect();
                    tokio::select! {
                        _ = self.process_batch(deliveries, &shutdown) => {}
                        _ = self.keep_alive(broker.as_ref(), &ids, settings.claim_idle()) => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(topic = %self.topic, consumer = %self.name, "read failed: {err}");
                    if !shutdown.sleep(settings.error_backoff()).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(topic = %self.topic, consumer = %self.name, "consumer shutting down");
    }

    async fn process_batch(&self, deliveries: Vec<Delivery>, shutdown: &ShutdownToken) {
        for delivery in deliveries {
            if shutdown.is_cancelled() {
                // Unprocessed entries stay pending and are re-claimed.
                break;
            }
            let id = delivery.id.clone();
            if let Err(err) = self
                .queue
                .process_delivery(&self.topic, &self.group, self.handler.as_ref(), delivery)
                .await
            {
                tracing::warn!(
                    topic = %self.topic,
                    message_id = %id,
                    "delivery left pending: {err}"
                );
            }
        }
    }

    /// Touches the batch's entries well inside the claim-idle window until
    /// dropped, so only a dead consumer's entries are re-claimed.
    async fn keep_alive(&self, broker: &dyn Broker, ids: &[MessageId], claim_idle: Duration) {
        let period = (claim_idle / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = broker.touch(&self.topic, &self.group, &self.name, ids).await {
                tracing::warn!(topic = %self.topic, consumer = %self.name, "pending touch failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::events::InProcEventBus;
    use crate::status::InMemoryStatusStore;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Scripted {
        outcomes: Mutex<Vec<HandlerOutcome>>,
        seen: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<HandlerOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for Scripted {
        async fn handle(&self, _task: &Task, ctx: &TaskContext) -> HandlerOutcome {
            self.seen.lock().push(ctx.attempt());
            self.outcomes
                .lock()
                .pop()
                .unwrap_or_else(|| HandlerOutcome::completed(json!("ok")))
        }
    }

    fn queue() -> (TaskQueue, Arc<InMemoryBroker>) {
        let broker = Arc::new(InMemoryBroker::new());
        let mut config = QueueConfig::default();
        config.backoff.base_ms = 10;
        let queue = TaskQueue::new(
            config,
            broker.clone(),
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(InProcEventBus::new("test", 64)),
        );
        (queue, broker)
    }

    async fn deliver_next(queue: &TaskQueue, handler: &dyn TaskHandler) -> bool {
        let deliveries = queue
            .broker()
            .read_group(ReadRequest {
                topic: "install".into(),
                group: "workers".into(),
                consumer: "c1".into(),
                count: 1,
                block: Duration::from_millis(5),
                claim_idle: Duration::from_secs(60),
            })
            .await
            .unwrap();
        let Some(delivery) = deliveries.into_iter().next() else {
            return false;
        };
        queue
            .process_delivery("install", "workers", handler, delivery)
            .await
            .unwrap();
        true
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_status_and_payload() {
        let (queue, broker) = queue();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({"host": "n1"})))
            .await
            .unwrap();

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Pending);
        let task = queue.task(id).await.unwrap().unwrap();
        assert_eq!(task.owner_id, "alice");
        assert_eq!(task.max_retries, 3);
        assert_eq!(broker.len("install"), 1);
    }

    #[tokio::test]
    async fn test_success_marks_completed_with_result() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();

        let handler = Scripted::new(vec![HandlerOutcome::completed(json!({"rc": 0}))]);
        assert!(deliver_next(&queue, &handler).await);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Completed);
        assert_eq!(status.result, Some(json!({"rc": 0})));
        assert_eq!(broker.pending_count("install", "workers"), 0);
    }

    #[tokio::test]
    async fn test_retry_is_parked_then_promoted() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})).with_max_retries(1))
            .await
            .unwrap();

        let handler = Scripted::new(vec![HandlerOutcome::retryable("ssh refused")]);
        assert!(deliver_next(&queue, &handler).await);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Pending);
        assert_eq!(status.error.as_deref(), Some("ssh refused"));
        assert_eq!(broker.delayed_count("install"), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.retry_scheduler().promote_once().await, 1);
        assert!(deliver_next(&queue, &handler).await);

        assert_eq!(*handler.seen.lock(), vec![1, 2]);
        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries_and_dead_letters() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();

        let handler = Scripted::new(vec![HandlerOutcome::permanent("bad manifest")]);
        assert!(deliver_next(&queue, &handler).await);

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.error.as_deref(), Some("bad manifest"));
        assert_eq!(broker.delayed_count("install"), 0);
        assert_eq!(broker.len(&dead_letter_topic("install")), 1);
    }

    #[tokio::test]
    async fn test_terminal_redelivery_is_acked_without_running_handler() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();
        let handler = Scripted::new(vec![]);
        assert!(deliver_next(&queue, &handler).await);

        // Same payload appended again, as a broker redelivery would.
        let raw = broker.payloads("install")[0].clone();
        broker.append("install", raw).await.unwrap();
        assert!(deliver_next(&queue, &handler).await);

        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(broker.pending_count("install", "workers"), 0);
    }

    #[tokio::test]
    async fn test_cancel_by_non_owner_rejected() {
        let (queue, _) = queue();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();

        let err = queue.cancel(id, "mallory").await.unwrap_err();
        assert!(matches!(err, ArmadaError::NotOwner { .. }));
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_yields_stopped() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();
        queue.cancel(id, "alice").await.unwrap();

        let handler = Scripted::new(vec![]);
        assert!(deliver_next(&queue, &handler).await);

        assert!(handler.seen.lock().is_empty());
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskState::Stopped
        );
    }

    /// Parks inside `handle` until released, then honours a stop request.
    #[derive(Default)]
    struct Checkpointed {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Checkpointed {
        async fn handle(&self, _task: &Task, ctx: &TaskContext) -> HandlerOutcome {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            if ctx.should_stop().await {
                return HandlerOutcome::Stopped;
            }
            HandlerOutcome::completed(json!("finished"))
        }
    }

    #[tokio::test]
    async fn test_cancel_while_running_stops_at_checkpoint() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();

        let handler = Arc::new(Checkpointed::default());
        let running = {
            let queue = queue.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { deliver_next(&queue, handler.as_ref()).await })
        };

        handler.entered.notified().await;
        assert_eq!(
            queue.status(id).await.unwrap().unwrap().status,
            TaskState::Processing
        );
        queue.cancel(id, "alice").await.unwrap();
        handler.release.notify_one();
        assert!(running.await.unwrap());

        let status = queue.status(id).await.unwrap().unwrap();
        assert_eq!(status.status, TaskState::Stopped);
        assert!(status.result.is_none());
        assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(broker.pending_count("install", "workers"), 0);
    }

    struct Slow {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _task: &Task, _ctx: &TaskContext) -> HandlerOutcome {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(400)).await;
            HandlerOutcome::completed(json!("done"))
        }
    }

    #[tokio::test]
    async fn test_slow_handler_keeps_its_delivery() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut config = QueueConfig::default();
        config.consumer = config.consumer.with_claim_idle(100).with_block(20);
        let queue = TaskQueue::new(
            config,
            broker.clone(),
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(InProcEventBus::new("test", 64)),
        );
        let handler = Arc::new(Slow {
            calls: Default::default(),
        });
        for name in ["c1", "c2"] {
            queue
                .subscribe("install", "workers", name, handler.clone())
                .await
                .unwrap();
        }

        let id = queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            while queue.status(id).await.unwrap().unwrap().status != TaskState::Completed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // Past the point where a second consumer would have re-claimed it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(broker.pending_count("install", "workers"), 0);
        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let (queue, _) = queue();
        let err = queue.cancel(TaskId::new(), "alice").await.unwrap_err();
        assert!(matches!(err, ArmadaError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_dead_lettered() {
        let (queue, broker) = queue();
        broker.ensure_group("install", "workers").await.unwrap();
        broker.append("install", "not json".into()).await.unwrap();

        let handler = Scripted::new(vec![]);
        assert!(deliver_next(&queue, &handler).await);
        assert!(handler.seen.lock().is_empty());
        assert_eq!(broker.payloads(&dead_letter_topic("install")), vec!["not json"]);
        assert_eq!(broker.pending_count("install", "workers"), 0);
    }

    #[tokio::test]
    async fn test_health_check_reports_missing_topic() {
        let (queue, _) = queue();
        queue
            .enqueue("install", NewTask::new("alice", json!({})))
            .await
            .unwrap();
        let health = queue.health_check(&["install", "delete"]).await;
        assert!(health.broker_ok);
        assert_eq!(
            health.topics,
            vec![("install".to_string(), true), ("delete".to_string(), false)]
        );
        assert!(!health.is_healthy());
    }
}
