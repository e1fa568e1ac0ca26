//! Retry backoff and the scheduler that re-queues delayed retries.
//!
//! Failed deliveries are parked on the broker as delayed entries instead of
//! in-process timers, so a restart between the failure and the retry does
//! not lose the retry. [`RetryScheduler`] promotes due entries back onto
//! their topic on a fixed interval.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::broker::Broker;
use crate::config::BackoffConfig;
use crate::runtime::{BackgroundTasks, ShutdownToken};

/// Delay before the n-th retry: `base * n²`, capped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for the given retry number. Retry 0 is immediate.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(retry_count).saturating_mul(u64::from(retry_count));
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let scaled = Duration::from_millis(base_ms.saturating_mul(factor));
        scaled.min(self.cap)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_ms),
            Duration::from_millis(config.cap_ms),
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

/// Promotes delayed retries back onto their topics.
pub struct RetryScheduler {
    broker: Arc<dyn Broker>,
    topics: Arc<Mutex<BTreeSet<String>>>,
    interval: Duration,
    tasks: BackgroundTasks,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("topics", &*self.topics.lock())
            .field("interval", &self.interval)
            .field("running", &self.tasks.is_running())
            .finish()
    }
}

impl RetryScheduler {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self {
            broker,
            topics: Arc::new(Mutex::new(BTreeSet::new())),
            interval,
            tasks: BackgroundTasks::new("retry-scheduler"),
        }
    }

    /// Adds a topic whose delayed entries should be promoted.
    pub fn watch(&self, topic: impl Into<String>) {
        self.topics.lock().insert(topic.into());
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    /// Runs one promotion pass over every watched topic.
    pub async fn promote_once(&self) -> usize {
        promote_all(self.broker.as_ref(), &self.topics()).await
    }

    pub fn start(&self) {
        let broker = Arc::clone(&self.broker);
        let topics = Arc::clone(&self.topics);
        let interval = self.interval;
        let shutdown = self.tasks.token();
        self.tasks
            .spawn(promote_loop(broker, topics, interval, shutdown));
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown(timeout).await;
    }
}

async fn promote_loop(
    broker: Arc<dyn Broker>,
    topics: Arc<Mutex<BTreeSet<String>>>,
    interval: Duration,
    shutdown: ShutdownToken,
) {
    loop {
        if !shutdown.sleep(interval).await {
            tracing::info!("retry scheduler shutting down");
            break;
        }
        let watched: Vec<String> = topics.lock().iter().cloned().collect();
        promote_all(broker.as_ref(), &watched).await;
    }
}

async fn promote_all(broker: &dyn Broker, topics: &[String]) -> usize {
    let now = Utc::now();
    let mut total = 0;
    for topic in topics {
        match broker.promote_due(topic, now).await {
            Ok(0) => {}
            Ok(promoted) => {
                tracing::debug!(topic = %topic, promoted, "promoted delayed retries");
                total += promoted;
            }
            Err(err) => tracing::warn!(topic = %topic, "promote delayed retries failed: {err}"),
        }
    }
    total
}
