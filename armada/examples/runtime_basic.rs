//! Basic runtime example on in-memory backends.
//!
//! Submits a task that fails once before succeeding, runs a small bulk
//! run, dispatches a job to a mock execution plane and soft-deletes a
//! target, printing the lifecycle events as they arrive.
//!
//! Run with: `cargo run --example runtime_basic`

use std::sync::Arc;
use std::time::Duration;

use armada::telemetry::{init_tracing, LogFormat};
use armada::*;
use armada_testkit::{plane_result, MockDeleter, MockExecutionPlane, MockItemExecutor, ScriptedHandler};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Text);

    let mut config = ArmadaConfig::default();
    config.queue.backoff.base_ms = 200;
    config.reconciler.interval_ms = 200;
    config.soft_delete.sweep_interval_ms = 500;

    let plane = MockExecutionPlane::new();
    let runtime = ArmadaRuntimeBuilder::in_memory(config)
        .with_plane(Arc::new(plane.clone()))
        .with_item_executor(Arc::new(
            MockItemExecutor::failing(["db-02"]).with_delay(Duration::from_millis(50)),
        ))
        .with_deleter(Arc::new(MockDeleter::failing_first(1)))
        .build()?;
    runtime.start()?;

    let mut events = runtime.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[EVENT] {}: {}", event.payload.kind(), event.payload.cache_key());
        }
    });

    let handler = ScriptedHandler::new().then(HandlerOutcome::retryable("package mirror timeout"));
    runtime
        .subscribe("install", "installers", "installer-1", Arc::new(handler))
        .await?;
    let task_id = runtime
        .submit("install", NewTask::new("ops", json!({ "host": "web-01", "pkg": "nginx" })))
        .await?;
    println!("[MAIN] submitted task {task_id}");

    let mut handle = runtime.start_bulk_run(
        vec!["db-01".into(), "db-02".into(), "db-03".into()],
        Some(2),
    );
    while let Some(event) = handle.progress.recv().await {
        match event {
            BulkEvent::Progress(p) => println!("[BULK] {}/{} ({:.0}%)", p.completed, p.total, p.percent),
            BulkEvent::Log { target, line, .. } => println!("[BULK] {target}: {line}"),
        }
    }

    let job = runtime
        .dispatch_job(&DispatchRequest::new("web*", "pkg.upgrade"), Some(task_id))
        .await?;
    plane.publish(&job.jid, plane_result(4, 0));
    let job = runtime.wait_for_job(&job.jid, Duration::from_secs(5)).await?;
    println!("[MAIN] job {} finished as {}", job.jid, job.status);

    runtime.soft_delete("vm-legacy-7", false).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Some(task) = runtime.delete_status("vm-legacy-7").await? {
        println!("[MAIN] delete of vm-legacy-7 is {} after {} retries", task.status, task.retry_count);
    }
    if let Some(status) = runtime.task_status(task_id).await? {
        println!("[MAIN] task {task_id} is {}", status.status);
    }

    runtime.shutdown().await;
    Ok(())
}
