//! Prometheus metrics for armada.
//!
//! Compiled only with the `metrics` feature.
//!
//! ## Counters
//! - `armada_tasks_enqueued_total`
//! - `armada_tasks_finished_total`
//! - `armada_task_retries_total`
//! - `armada_tasks_dead_lettered_total`
//! - `armada_job_transitions_total`
//! - `armada_job_lookup_errors_total`
//! - `armada_delete_attempts_total`
//!
//! ## Gauges
//! - `armada_running_jobs`
//!
//! ## Histograms
//! - `armada_task_duration_seconds`
//! - `armada_reconcile_tick_seconds`
//! - `armada_bulk_item_duration_seconds`
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};

/// Global Prometheus registry for armada metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `topic`, `priority`.
pub static TASKS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("armada_tasks_enqueued_total", "Total number of tasks enqueued");
    CounterVec::new(opts, &["topic", "priority"])
        .expect("armada_tasks_enqueued_total metric creation failed")
});

/// Labels: `topic`, `state` (completed, failed, stopped).
pub static TASKS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "armada_tasks_finished_total",
        "Total number of tasks that reached a terminal state",
    );
    CounterVec::new(opts, &["topic", "state"])
        .expect("armada_tasks_finished_total metric creation failed")
});

pub static TASK_RETRIES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("armada_task_retries_total", "Total number of task retries scheduled");
    CounterVec::new(opts, &["topic"]).expect("armada_task_retries_total metric creation failed")
});

pub static TASKS_DEAD_LETTERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "armada_tasks_dead_lettered_total",
        "Total number of tasks copied to a dead-letter topic",
    );
    CounterVec::new(opts, &["topic"])
        .expect("armada_tasks_dead_lettered_total metric creation failed")
});

/// Labels: `from`, `to`.
pub static JOB_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "armada_job_transitions_total",
        "Total number of job state transitions applied",
    );
    CounterVec::new(opts, &["from", "to"])
        .expect("armada_job_transitions_total metric creation failed")
});

pub static JOB_LOOKUP_ERRORS_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "armada_job_lookup_errors_total",
        "Total number of failed execution plane lookups",
    )
    .expect("armada_job_lookup_errors_total metric creation failed")
});

/// Labels: `status` (completed, failed).
pub static DELETE_ATTEMPTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("armada_delete_attempts_total", "Total number of soft-delete attempts");
    CounterVec::new(opts, &["status"])
        .expect("armada_delete_attempts_total metric creation failed")
});

/// Jobs left running after the most recent reconcile tick.
pub static RUNNING_JOBS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("armada_running_jobs", "Jobs still running after the last reconcile tick")
        .expect("armada_running_jobs metric creation failed")
});

pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new("armada_task_duration_seconds", "Task handler duration in seconds")
        .buckets(buckets);
    HistogramVec::new(opts, &["topic", "state"])
        .expect("armada_task_duration_seconds metric creation failed")
});

pub static RECONCILE_TICK_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "armada_reconcile_tick_seconds",
        "Reconciliation tick duration in seconds",
    )
    .buckets(buckets);
    Histogram::with_opts(opts).expect("armada_reconcile_tick_seconds metric creation failed")
});

pub static BULK_ITEM_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "armada_bulk_item_duration_seconds",
        "Bulk item execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("armada_bulk_item_duration_seconds metric creation failed")
});

/// Registers every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASKS_FINISHED_TOTAL.clone()),
        Box::new(TASK_RETRIES_TOTAL.clone()),
        Box::new(TASKS_DEAD_LETTERED_TOTAL.clone()),
        Box::new(JOB_TRANSITIONS_TOTAL.clone()),
        Box::new(JOB_LOOKUP_ERRORS_TOTAL.clone()),
        Box::new(DELETE_ATTEMPTS_TOTAL.clone()),
        Box::new(RUNNING_JOBS.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
        Box::new(RECONCILE_TICK_SECONDS.clone()),
        Box::new(BULK_ITEM_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_task_enqueued(topic: &str, priority: &str) {
    TASKS_ENQUEUED_TOTAL.with_label_values(&[topic, priority]).inc();
}

pub fn record_task_finished(topic: &str, state: &str, duration_secs: f64) {
    TASKS_FINISHED_TOTAL.with_label_values(&[topic, state]).inc();
    TASK_DURATION_SECONDS
        .with_label_values(&[topic, state])
        .observe(duration_secs);
}

pub fn record_task_retry(topic: &str) {
    TASK_RETRIES_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_task_dead_lettered(topic: &str) {
    TASKS_DEAD_LETTERED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_job_transition(from: &str, to: &str) {
    JOB_TRANSITIONS_TOTAL.with_label_values(&[from, to]).inc();
}

pub fn record_job_lookup_error() {
    JOB_LOOKUP_ERRORS_TOTAL.inc();
}

pub fn record_delete_outcome(status: &str) {
    DELETE_ATTEMPTS_TOTAL.with_label_values(&[status]).inc();
}

pub fn set_running_jobs(count: f64) {
    RUNNING_JOBS.set(count);
}

pub fn observe_reconcile_tick(duration_secs: f64) {
    RECONCILE_TICK_SECONDS.observe(duration_secs);
}

pub fn observe_bulk_item(status: &str, duration_secs: f64) {
    BULK_ITEM_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_task_enqueued("install", "P2");
        record_task_finished("install", "completed", 0.25);
        record_job_transition("running", "completed");
        set_running_jobs(3.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("armada_tasks_enqueued_total"));
        assert!(output.contains("armada_tasks_finished_total"));
        assert!(output.contains("armada_job_transitions_total"));
        assert!(output.contains("armada_running_jobs"));
    }
}
