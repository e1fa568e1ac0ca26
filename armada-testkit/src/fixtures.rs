use armada::{ArmadaConfig, Jid, NewTask, PlaneResult};
use serde_json::{json, Value};

/// Configuration with every loop interval shortened for tests.
///
/// Retries back off by `base_ms * n²` with a 20ms base, so a task with three
/// retries finishes within a few hundred milliseconds.
pub fn fast_config() -> ArmadaConfig {
    let mut config = ArmadaConfig::default();
    config.queue.consumer.block_ms = 20;
    config.queue.consumer.error_backoff_ms = 10;
    config.queue.consumer.claim_idle_ms = 60_000;
    config.queue.promote_interval_ms = 5;
    config.queue.backoff.base_ms = 20;
    config.queue.backoff.cap_ms = 1_000;
    config.reconciler.interval_ms = 20;
    config.reconciler.wait_poll_interval_ms = 10;
    config.reconciler.lookup_timeout_ms = 500;
    config.bulk.item_timeout_secs = 5;
    config.soft_delete.sweep_interval_ms = 20;
    config.soft_delete.delete_timeout_secs = 5;
    config.shutdown_timeout_secs = 2;
    config
}

/// A task owned by `owner` carrying `payload`.
pub fn task(owner: &str, payload: Value) -> NewTask {
    NewTask::new(owner, payload)
}

pub fn jid(n: u32) -> Jid {
    Jid::new(format!("2026{n:016}"))
}

/// Structured outcome a target reports on success.
pub fn target_ok() -> Value {
    json!({ "retcode": 0, "stdout": "ok" })
}

/// Structured outcome a target reports on failure.
pub fn target_err(message: &str) -> Value {
    json!({ "retcode": 1, "stderr": message })
}

/// Plane result with the given number of succeeded and failed targets.
pub fn plane_result(succeeded: usize, failed: usize) -> PlaneResult {
    let mut result = PlaneResult::new();
    for i in 0..succeeded {
        result.insert(format!("ok-{i:03}"), target_ok());
    }
    for i in 0..failed {
        result.insert(format!("bad-{i:03}"), target_err("boom"));
    }
    result
}

/// Target names `prefix-000` through `prefix-{count-1}`.
pub fn targets(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-{i:03}")).collect()
}
