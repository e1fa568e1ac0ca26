use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ArmadaError;

/// Settings for a single queue consumer loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum entries read per poll.
    pub batch_size: usize,
    /// How long one broker read may block, in milliseconds. Bounds how long
    /// shutdown takes to be observed.
    pub block_ms: u64,
    /// Entries left unacknowledged this long are re-claimed by another
    /// consumer, in milliseconds.
    pub claim_idle_ms: u64,
    /// Pause after a broker error before polling again, in milliseconds.
    pub error_backoff_ms: u64,
}

impl ConsumerConfig {
    pub fn with_block(mut self, ms: u64) -> Self {
        self.block_ms = ms;
        self
    }

    pub fn with_claim_idle(mut self, ms: u64) -> Self {
        self.claim_idle_ms = ms;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_ms: 1000,
            claim_idle_ms: 60_000,
            error_backoff_ms: 500,
        }
    }
}

/// Retry delay policy: `base * retry_count²`, capped.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            cap_ms: 300_000, // 5 minutes
        }
    }
}

/// Durable queue behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lifetime of task status and payload keys, in seconds.
    pub status_ttl_secs: u64,
    /// Lifetime of a cancellation flag, in seconds.
    pub stop_flag_ttl_secs: u64,
    /// Retry budget for tasks that do not specify one.
    pub default_max_retries: u32,
    /// How often delayed retries are promoted back onto their topic.
    pub promote_interval_ms: u64,
    /// Copy terminally failed tasks to `{topic}:dlq`.
    pub dead_letter_enabled: bool,
    pub backoff: BackoffConfig,
    pub consumer: ConsumerConfig,
}

impl QueueConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn stop_flag_ttl(&self) -> Duration {
        Duration::from_secs(self.stop_flag_ttl_secs)
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 30 * 60,
            stop_flag_ttl_secs: 10 * 60,
            default_max_retries: 3,
            promote_interval_ms: 500,
            dead_letter_enabled: true,
            backoff: BackoffConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Job reconciliation loop tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    /// Running jobs examined per tick, oldest first.
    pub batch_size: usize,
    /// Running jobs older than this are moved to `timeout`.
    pub job_timeout_secs: u64,
    /// Concurrent plane lookups per tick.
    pub lookup_concurrency: usize,
    pub lookup_timeout_ms: u64,
    /// Lifetime of the cached last-known job status, in seconds.
    pub status_ttl_secs: u64,
    pub wait_poll_interval_ms: u64,
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            batch_size: 100,
            job_timeout_secs: 10 * 60,
            lookup_concurrency: 10,
            lookup_timeout_ms: 10_000,
            status_ttl_secs: 60 * 60,
            wait_poll_interval_ms: 500,
        }
    }
}

/// Connection settings for the HTTP execution plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Authentication backend name passed on login.
    pub eauth: String,
    pub request_timeout_ms: u64,
    /// Refresh the token this long before it expires.
    pub token_refresh_margin_secs: u64,
}

impl PlaneConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            username: String::new(),
            password: String::new(),
            eauth: "pam".to_string(),
            request_timeout_ms: 30_000,
            token_refresh_margin_secs: 60,
        }
    }
}

/// Bulk worker pool defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub default_parallelism: usize,
    pub item_timeout_secs: u64,
    /// Progress events buffered per run before new ones are dropped.
    pub progress_capacity: usize,
    /// Lifetime of a finished run snapshot in the status store, in seconds.
    pub snapshot_ttl_secs: u64,
}

impl BulkConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            default_parallelism: 5,
            item_timeout_secs: 10 * 60,
            progress_capacity: 64,
            snapshot_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Soft-delete worker tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftDeleteConfig {
    pub channel_capacity: usize,
    pub sweep_interval_ms: u64,
    pub max_retries: u32,
    pub delete_timeout_secs: u64,
    /// Extra time past `delete_timeout_secs` before a task stuck in
    /// `deleting` is reclaimed by the sweep.
    pub reclaim_grace_ms: u64,
}

impl SoftDeleteConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    /// Age of a `deleting` task after which no worker can still own it.
    pub fn reclaim_after(&self) -> Duration {
        self.delete_timeout() + Duration::from_millis(self.reclaim_grace_ms)
    }
}

impl Default for SoftDeleteConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            sweep_interval_ms: 30_000,
            max_retries: 3,
            delete_timeout_secs: 120,
            reclaim_grace_ms: 30_000,
        }
    }
}

/// Top-level configuration for an armada runtime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmadaConfig {
    pub queue: QueueConfig,
    pub reconciler: ReconcilerConfig,
    pub plane: PlaneConfig,
    pub bulk: BulkConfig,
    pub soft_delete: SoftDeleteConfig,
    /// How long shutdown waits for each background loop, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl ArmadaConfig {
    /// Parses a JSON document; omitted sections keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ArmadaError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        if self.shutdown_timeout_secs == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(self.shutdown_timeout_secs)
        }
    }

    pub fn validate(&self) -> Result<(), ArmadaError> {
        let checks = [
            (self.queue.consumer.batch_size == 0, "queue.consumer.batch_size must be > 0"),
            (self.queue.backoff.base_ms == 0, "queue.backoff.base_ms must be > 0"),
            (
                self.queue.backoff.cap_ms < self.queue.backoff.base_ms,
                "queue.backoff.cap_ms must be >= base_ms",
            ),
            (self.queue.status_ttl_secs == 0, "queue.status_ttl_secs must be > 0"),
            (self.reconciler.interval_ms == 0, "reconciler.interval_ms must be > 0"),
            (self.reconciler.batch_size == 0, "reconciler.batch_size must be > 0"),
            (
                self.reconciler.lookup_concurrency == 0,
                "reconciler.lookup_concurrency must be > 0",
            ),
            (self.bulk.default_parallelism == 0, "bulk.default_parallelism must be > 0"),
            (self.bulk.progress_capacity == 0, "bulk.progress_capacity must be > 0"),
            (
                self.soft_delete.channel_capacity == 0,
                "soft_delete.channel_capacity must be > 0",
            ),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(ArmadaError::Config(message.to_string()));
            }
        }
        Ok(())
    }
}
