//! Tracing and telemetry instrumentation for armada.
//!
//! Span constructors for the units of work each component runs, plus
//! `record_*` helpers that log a structured event and, with the `metrics`
//! feature, update the Prometheus collectors in [`crate::metrics`]. All helpers
//! work with and without the feature.
//!
//! # Example
//!
//! ```ignore
//! use armada::telemetry::{init_tracing, task_handle_span, LogFormat};
//!
//! init_tracing(LogFormat::Json);
//! let span = task_handle_span(&task_id.to_string(), "install", 1);
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    #[default]
    Text,
}

/// Installs the global subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(false)).try_init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(false)).try_init(),
    };
    installed.is_ok()
}

/// Span around one handler invocation for a queued task.
#[must_use]
pub fn task_handle_span(task_id: impl AsRef<str>, topic: impl AsRef<str>, attempt: u32) -> Span {
    info_span!(
        "armada.task",
        task_id = %task_id.as_ref(),
        topic = %topic.as_ref(),
        attempt = attempt,
    )
}

/// Span around one reconciliation of a single job.
#[must_use]
pub fn job_reconcile_span(jid: impl AsRef<str>) -> Span {
    info_span!("armada.reconcile", jid = %jid.as_ref())
}

/// Span around one bulk item on a worker.
#[must_use]
pub fn bulk_item_span(run_id: impl AsRef<str>, target: impl AsRef<str>) -> Span {
    info_span!(
        "armada.bulk_item",
        run_id = %run_id.as_ref(),
        target = %target.as_ref(),
    )
}

/// Span around one soft-delete attempt.
#[must_use]
pub fn delete_task_span(task_id: impl AsRef<str>, target_id: impl AsRef<str>) -> Span {
    info_span!(
        "armada.delete",
        task_id = %task_id.as_ref(),
        target_id = %target_id.as_ref(),
    )
}

/// Instrument a handler future with a task span.
pub fn instrument_task<F>(
    task_id: impl AsRef<str>,
    topic: impl AsRef<str>,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(task_handle_span(task_id, topic, attempt))
}

pub fn record_task_enqueued(topic: impl AsRef<str>, priority: impl AsRef<str>) {
    tracing::info!(
        topic = %topic.as_ref(),
        priority = %priority.as_ref(),
        "task enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_enqueued(topic.as_ref(), priority.as_ref());
}

/// Record a task reaching a terminal state.
///
/// # Arguments
/// * `topic` - The queue topic
/// * `state` - The terminal state (completed, failed, stopped)
/// * `duration` - Handler wall time for the final attempt
pub fn record_task_finished(topic: impl AsRef<str>, state: impl AsRef<str>, duration: Duration) {
    tracing::info!(
        topic = %topic.as_ref(),
        state = %state.as_ref(),
        duration_secs = duration.as_secs_f64(),
        "task finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_finished(topic.as_ref(), state.as_ref(), duration.as_secs_f64());
}

pub fn record_task_retry_scheduled(topic: impl AsRef<str>, retry_count: u32, delay: Duration) {
    tracing::info!(
        topic = %topic.as_ref(),
        retry_count = retry_count,
        delay_ms = delay.as_millis() as u64,
        "task retry scheduled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_retry(topic.as_ref());
}

pub fn record_task_dead_lettered(topic: impl AsRef<str>) {
    tracing::warn!(topic = %topic.as_ref(), "task dead-lettered");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_dead_lettered(topic.as_ref());
}

/// Record an applied job state transition.
pub fn record_job_transition(from: impl AsRef<str>, to: impl AsRef<str>) {
    tracing::info!(
        from = %from.as_ref(),
        to = %to.as_ref(),
        "job transition applied"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_transition(from.as_ref(), to.as_ref());
}

pub fn record_job_lookup_error(jid: impl AsRef<str>, error: impl std::fmt::Display) {
    tracing::warn!(jid = %jid.as_ref(), "job lookup failed: {error}");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_lookup_error();
}

/// Record the outcome of one reconciliation tick.
///
/// # Arguments
/// * `examined` - Running jobs loaded for the tick
/// * `finalized` - Jobs moved to a terminal state (timeouts included)
/// * `duration` - Wall time of the tick
pub fn record_reconcile_tick(examined: usize, finalized: usize, duration: Duration) {
    tracing::debug!(
        examined = examined,
        finalized = finalized,
        duration_ms = duration.as_millis() as u64,
        "reconcile tick complete"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::observe_reconcile_tick(duration.as_secs_f64());
        crate::metrics::set_running_jobs(examined.saturating_sub(finalized) as f64);
    }
}

pub fn record_bulk_item(run_id: impl AsRef<str>, status: impl AsRef<str>, duration: Duration) {
    tracing::debug!(
        run_id = %run_id.as_ref(),
        status = %status.as_ref(),
        duration_secs = duration.as_secs_f64(),
        "bulk item finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_bulk_item(status.as_ref(), duration.as_secs_f64());
}

pub fn record_delete_outcome(target_id: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        target_id = %target_id.as_ref(),
        status = %status.as_ref(),
        "soft delete attempt finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_delete_outcome(status.as_ref());
}

/// Starts timing a unit of work.
pub fn start_timer(label: impl Into<String>) -> TimingHandle {
    TimingHandle {
        label: label.into(),
        start: Instant::now(),
    }
}

/// Opaque handle returned by [`start_timer`].
#[derive(Debug)]
pub struct TimingHandle {
    label: String,
    start: Instant,
}

impl TimingHandle {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
