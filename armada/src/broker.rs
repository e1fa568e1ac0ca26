//! Broker boundary for the durable queue.
//!
//! A broker is an append-only per-topic log with consumer groups: entries are
//! delivered to one consumer of each group, stay pending until acknowledged,
//! and are re-claimed by another consumer once they sit unacknowledged past
//! the claim-idle threshold. Delayed entries are parked outside the log until
//! [`Broker::promote_due`] appends them.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Broker-assigned identifier of a log entry.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An entry handed to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub id: MessageId,
    pub payload: String,
    /// 1 on first delivery, incremented every time the entry is re-claimed.
    pub delivery_count: u32,
}

/// Request to read from a consumer group.
#[derive(Clone, Debug)]
pub struct ReadRequest {
    pub topic: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    /// Maximum time to wait for new entries.
    pub block: Duration,
    /// Pending entries idle at least this long are re-claimed.
    pub claim_idle: Duration,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a payload to a topic, creating the topic when needed.
    async fn append(&self, topic: &str, payload: String) -> anyhow::Result<MessageId>;

    /// Creates a consumer group reading from the start of the topic.
    /// Creating an existing group is a no-op.
    async fn ensure_group(&self, topic: &str, group: &str) -> anyhow::Result<()>;

    /// Re-claims idle pending entries first, then reads new ones, blocking up
    /// to `request.block` when nothing is available.
    async fn read_group(&self, request: ReadRequest) -> anyhow::Result<Vec<Delivery>>;

    /// Acknowledges an entry. Returns false when it was not pending.
    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> anyhow::Result<bool>;

    /// Resets the idle time of entries `consumer` is still working on, so a
    /// slow but live consumer does not lose them to re-claiming. Ids that are
    /// no longer pending are ignored.
    async fn touch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> anyhow::Result<()>;

    /// Parks a payload until `due_at`.
    async fn schedule(&self, topic: &str, payload: String, due_at: DateTime<Utc>)
    -> anyhow::Result<()>;

    /// Appends every parked payload due at or before `now`. Returns how many
    /// were promoted.
    async fn promote_due(&self, topic: &str, now: DateTime<Utc>) -> anyhow::Result<usize>;

    async fn topic_exists(&self, topic: &str) -> anyhow::Result<bool>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashMap<MessageId, PendingEntry>,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<(MessageId, String)>,
    index: HashMap<MessageId, usize>,
    groups: HashMap<String, GroupState>,
    delayed: BTreeMap<(i64, u64), String>,
}

/// In-process broker with the same delivery semantics as a stream-backed
/// one. Used in tests and single-node deployments.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, TopicLog>>>,
    notify: Arc<Notify>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> MessageId {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        MessageId(format!("{}-{}", Utc::now().timestamp_millis(), seq))
    }

    /// Number of entries ever appended to a topic.
    pub fn len(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.entries.len())
    }

    /// Entries delivered to a group but not yet acknowledged.
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    pub fn delayed_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map_or(0, |log| log.delayed.len())
    }

    /// Raw payloads of a topic in append order.
    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.entries.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    fn try_read(&self, request: &ReadRequest) -> anyhow::Result<Vec<Delivery>> {
        let mut topics = self.topics.lock();
        let log = topics
            .get_mut(&request.topic)
            .ok_or_else(|| anyhow::anyhow!("unknown topic {}", request.topic))?;
        let TopicLog {
            entries,
            index,
            groups,
            ..
        } = log;
        let group = groups.get_mut(&request.group).ok_or_else(|| {
            anyhow::anyhow!("unknown group {} on {}", request.group, request.topic)
        })?;

        let now = Instant::now();
        let mut deliveries = Vec::new();

        let mut idle: Vec<MessageId> = group
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= request.claim_idle)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort_by_key(|id| index.get(id).copied().unwrap_or(usize::MAX));
        for id in idle.into_iter().take(request.count) {
            let Some(&pos) = index.get(&id) else { continue };
            if let Some(pending) = group.pending.get_mut(&id) {
                pending.consumer = request.consumer.clone();
                pending.delivered_at = now;
                pending.delivery_count += 1;
                deliveries.push(Delivery {
                    id,
                    payload: entries[pos].1.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        while deliveries.len() < request.count && group.cursor < entries.len() {
            let (id, payload) = &entries[group.cursor];
            group.cursor += 1;
            group.pending.insert(
                id.clone(),
                PendingEntry {
                    consumer: request.consumer.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            deliveries.push(Delivery {
                id: id.clone(),
                payload: payload.clone(),
                delivery_count: 1,
            });
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn append(&self, topic: &str, payload: String) -> anyhow::Result<MessageId> {
        let id = self.next_id();
        {
            let mut topics = self.topics.lock();
            let log = topics.entry(topic.to_string()).or_default();
            log.index.insert(id.clone(), log.entries.len());
            log.entries.push((id.clone(), payload));
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> anyhow::Result<()> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(&self, request: ReadRequest) -> anyhow::Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + request.block;
        loop {
            let notified = self.notify.notified();
            let deliveries = self.try_read(&request)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake on append, or re-check once the block window ends.
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: &MessageId) -> anyhow::Result<bool> {
        let mut topics = self.topics.lock();
        let removed = topics
            .get_mut(topic)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|g| g.pending.remove(id));
        Ok(removed.is_some())
    }

    async fn touch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        ids: &[MessageId],
    ) -> anyhow::Result<()> {
        let mut topics = self.topics.lock();
        let Some(group) = topics.get_mut(topic).and_then(|log| log.groups.get_mut(group)) else {
            return Ok(());
        };
        let now = Instant::now();
        for id in ids {
            if let Some(pending) = group.pending.get_mut(id) {
                if pending.consumer == consumer {
                    pending.delivered_at = now;
                }
            }
        }
        Ok(())
    }

    async fn schedule(
        &self,
        topic: &str,
        payload: String,
        due_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_default()
            .delayed
            .insert((due_at.timestamp_millis(), seq), payload);
        Ok(())
    }

    async fn promote_due(&self, topic: &str, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let due: Vec<String> = {
            let mut topics = self.topics.lock();
            let Some(log) = topics.get_mut(topic) else {
                return Ok(0);
            };
            let cutoff = (now.timestamp_millis(), u64::MAX);
            let later = log.delayed.split_off(&cutoff);
            let ready = std::mem::replace(&mut log.delayed, later);
            ready.into_values().collect()
        };
        let promoted = due.len();
        for payload in due {
            self.append(topic, payload).await?;
        }
        Ok(promoted)
    }

    async fn topic_exists(&self, topic: &str) -> anyhow::Result<bool> {
        Ok(self.topics.lock().contains_key(topic))
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
