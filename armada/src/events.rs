use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::bulk::{BulkRunStatus, RunId};
use crate::job::{Jid, JobState};
use crate::soft_delete::{DeleteStatus, DeleteTaskId};
use crate::status::{keys, StatusStore, StatusStoreExt};
use crate::task::{TaskId, TaskState};

/// Metadata envelope attached to every event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, idempotency_key: impl Into<String>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Event with metadata and payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArmadaEvent {
    pub meta: EventMeta,
    pub payload: EventPayload,
}

impl ArmadaEvent {
    /// Wraps a payload with fresh metadata keyed by the payload's entity and
    /// kind.
    pub fn new(payload: EventPayload) -> Self {
        let key = format!("{}:{}", payload.kind(), payload.cache_key());
        Self {
            meta: EventMeta::new(None, key),
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.meta.correlation_id = correlation_id;
        self
    }

    pub fn cache_key(&self) -> String {
        self.payload.cache_key()
    }
}

/// Lifecycle transitions published by the queue, reconciler, bulk runner and
/// soft-delete worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventPayload {
    TaskEnqueued {
        task_id: TaskId,
        topic: String,
    },
    TaskStarted {
        task_id: TaskId,
        topic: String,
        attempt: u32,
    },
    TaskRetryScheduled {
        task_id: TaskId,
        topic: String,
        retry_count: u32,
        delay_ms: u64,
    },
    TaskFinished {
        task_id: TaskId,
        topic: String,
        state: TaskState,
        error: Option<String>,
    },
    JobStateChanged {
        jid: Jid,
        task_id: Option<TaskId>,
        old: JobState,
        new: JobState,
        success_count: u32,
        failed_count: u32,
        duration_secs: Option<f64>,
    },
    BulkRunFinished {
        run_id: RunId,
        status: BulkRunStatus,
        total: usize,
        success_count: usize,
        failed_count: usize,
    },
    DeleteTaskChanged {
        task_id: DeleteTaskId,
        target_id: String,
        status: DeleteStatus,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskEnqueued { .. } => "task_enqueued",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskRetryScheduled { .. } => "task_retry_scheduled",
            Self::TaskFinished { .. } => "task_finished",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::BulkRunFinished { .. } => "bulk_run_finished",
            Self::DeleteTaskChanged { .. } => "delete_task_changed",
        }
    }

    /// Identifier pull consumers poll the last-known event by.
    pub fn cache_key(&self) -> String {
        match self {
            Self::TaskEnqueued { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskRetryScheduled { task_id, .. }
            | Self::TaskFinished { task_id, .. } => task_id.to_string(),
            Self::JobStateChanged { jid, .. } => jid.to_string(),
            Self::BulkRunFinished { run_id, .. } => run_id.to_string(),
            Self::DeleteTaskChanged { target_id, .. } => target_id.clone(),
        }
    }
}

/// Publish/subscribe boundary for lifecycle events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    async fn publish(&self, event: ArmadaEvent) -> anyhow::Result<()>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ArmadaEvent>;

    /// Most recent event published for `key`, if it is still cached.
    async fn last_known(&self, key: &str) -> anyhow::Result<Option<ArmadaEvent>>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits on subscribers: a subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged`. When a status store
/// is attached, every event is also written under `armada:event:last:{key}`
/// so consumers that cannot hold a subscription can poll by id.
pub struct InProcEventBus {
    channel: String,
    sender: broadcast::Sender<ArmadaEvent>,
    capacity: usize,
    cache: Option<(Arc<dyn StatusStore>, Duration)>,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("channel", &self.channel)
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            channel: channel.into(),
            sender,
            capacity,
            cache: None,
        }
    }

    /// Mirror every event into `store` for `ttl`.
    pub fn with_cache(mut self, store: Arc<dyn StatusStore>, ttl: Duration) -> Self {
        self.cache = Some((store, ttl));
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: ArmadaEvent) -> anyhow::Result<()> {
        if let Some((store, ttl)) = &self.cache {
            let key = keys::event_last(&event.cache_key());
            if let Err(err) = store.set_json(&key, &event, Some(*ttl)).await {
                tracing::warn!(
                    channel = %self.channel,
                    key = %key,
                    "failed to cache event: {err}"
                );
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ArmadaEvent> {
        self.sender.subscribe()
    }

    async fn last_known(&self, key: &str) -> anyhow::Result<Option<ArmadaEvent>> {
        match &self.cache {
            Some((store, _)) => store.get_json(&keys::event_last(key)).await,
            None => Ok(None),
        }
    }
}

/// Publishes and logs failures instead of propagating them. Event delivery
/// never decides the outcome of the work that produced it.
pub(crate) async fn publish_quietly(events: &dyn EventPublisher, payload: EventPayload) {
    let kind = payload.kind();
    if let Err(err) = events.publish(ArmadaEvent::new(payload)).await {
        tracing::warn!(event = kind, "failed to publish event: {err}");
    }
}
