//! End-to-end tests for the armada runtime on in-memory backends.
//!
//! Covers retry backoff and dead-lettering, owner-only cancellation,
//! job reconciliation, bulk runs and soft-delete idempotency.

use std::sync::Arc;
use std::time::Duration;

use armada::queue::dead_letter_topic;
use armada::{
    ArmadaError, ArmadaRuntime, ArmadaRuntimeBuilder, BulkEvent, BulkRunStatus, DeleteStatus,
    DispatchRequest, EventPayload, HandlerOutcome, InMemoryBroker, InMemoryStatusStore, JobState,
    NewTask, TaskState,
};
use armada_testkit::{
    fast_config, plane_result, targets, wait_until, MockDeleter, MockExecutionPlane,
    MockItemExecutor, ScriptedHandler,
};
use serde_json::json;
use tokio::sync::oneshot;

const TOPIC: &str = "provision";
const GROUP: &str = "workers";

struct Harness {
    runtime: ArmadaRuntime,
    broker: Arc<InMemoryBroker>,
    plane: MockExecutionPlane,
    deleter: MockDeleter,
}

fn harness_with(executor: MockItemExecutor, deleter: MockDeleter) -> Harness {
    let broker = Arc::new(InMemoryBroker::new());
    let plane = MockExecutionPlane::new();
    let runtime = ArmadaRuntimeBuilder::new(fast_config())
        .with_broker(broker.clone())
        .with_status_store(Arc::new(InMemoryStatusStore::new()))
        .with_plane(Arc::new(plane.clone()))
        .with_item_executor(Arc::new(executor))
        .with_deleter(Arc::new(deleter.clone()))
        .build()
        .expect("runtime builds");
    runtime.start().expect("runtime starts");
    Harness {
        runtime,
        broker,
        plane,
        deleter,
    }
}

fn harness() -> Harness {
    harness_with(MockItemExecutor::new(), MockDeleter::new())
}

async fn wait_for_state(runtime: &ArmadaRuntime, task_id: armada::TaskId, state: TaskState) -> bool {
    wait_until(Duration::from_secs(5), move || async move {
        matches!(
            runtime.task_status(task_id).await,
            Ok(Some(status)) if status.status == state
        )
    })
    .await
}

#[tokio::test]
async fn retryable_failures_back_off_then_dead_letter() {
    let h = harness();
    let mut events = h.runtime.subscribe_events();
    let handler = ScriptedHandler::always_failing("host unreachable");
    h.runtime
        .subscribe(TOPIC, GROUP, "c1", Arc::new(handler.clone()))
        .await
        .unwrap();

    let task_id = h
        .runtime
        .submit(TOPIC, NewTask::new("ops", json!({"host": "web-1"})).with_max_retries(3))
        .await
        .unwrap();

    assert!(wait_for_state(&h.runtime, task_id, TaskState::Failed).await);
    let dlq = dead_letter_topic(TOPIC);
    let (broker, dlq) = (&h.broker, dlq.as_str());
    assert!(wait_until(Duration::from_secs(2), move || async move { broker.len(dlq) == 1 }).await);

    let attempts = handler.attempts();
    assert_eq!(attempts.len(), 4, "initial delivery plus three retries");
    assert_eq!(
        attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert!(gaps[0] >= Duration::from_millis(20));
    assert!(gaps.windows(2).all(|w| w[1] > w[0]), "gaps grow: {gaps:?}");

    let status = h.runtime.task_status(task_id).await.unwrap().unwrap();
    assert_eq!(status.error.as_deref(), Some("host unreachable"));

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let EventPayload::TaskRetryScheduled { task_id: id, .. } = event.payload {
            assert_eq!(id, task_id);
            retries += 1;
        }
    }
    assert_eq!(retries, 3);

    h.runtime.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let h = harness();
    let handler = ScriptedHandler::new().then(HandlerOutcome::permanent("bad payload"));
    h.runtime
        .subscribe(TOPIC, GROUP, "c1", Arc::new(handler.clone()))
        .await
        .unwrap();

    let task_id = h
        .runtime
        .submit(TOPIC, NewTask::new("ops", json!({})))
        .await
        .unwrap();

    assert!(wait_for_state(&h.runtime, task_id, TaskState::Failed).await);
    handler.assert_attempt_count_eq(1);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn completed_task_keeps_result_and_rejects_cancel() {
    let h = harness();
    let handler =
        ScriptedHandler::new().then(HandlerOutcome::completed(json!({"installed": ["nginx"]})));
    h.runtime
        .subscribe(TOPIC, GROUP, "c1", Arc::new(handler))
        .await
        .unwrap();

    let task_id = h
        .runtime
        .submit(TOPIC, NewTask::new("ops", json!({"pkg": "nginx"})))
        .await
        .unwrap();
    assert!(wait_for_state(&h.runtime, task_id, TaskState::Completed).await);

    let status = h.runtime.task_status(task_id).await.unwrap().unwrap();
    assert_eq!(status.result, Some(json!({"installed": ["nginx"]})));
    assert!(status.processed_at.is_some());

    let err = h.runtime.cancel_task(task_id, "ops").await.unwrap_err();
    assert!(matches!(err, ArmadaError::CancelRejected(_)));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn only_the_submitter_can_cancel() {
    let h = harness();
    let task_id = h
        .runtime
        .submit(TOPIC, NewTask::new("alice", json!({})))
        .await
        .unwrap();

    let err = h.runtime.cancel_task(task_id, "mallory").await.unwrap_err();
    assert!(matches!(err, ArmadaError::NotOwner { .. }));

    h.runtime.cancel_task(task_id, "alice").await.unwrap();

    let handler = ScriptedHandler::new();
    h.runtime
        .subscribe(TOPIC, GROUP, "c1", Arc::new(handler.clone()))
        .await
        .unwrap();
    assert!(wait_for_state(&h.runtime, task_id, TaskState::Stopped).await);
    handler.assert_attempt_count_eq(0);

    let missing = h
        .runtime
        .cancel_task(armada::TaskId::new(), "alice")
        .await
        .unwrap_err();
    assert!(matches!(missing, ArmadaError::NotFound(_)));
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn health_reports_known_topics() {
    let h = harness();
    h.runtime
        .subscribe(TOPIC, GROUP, "c1", Arc::new(ScriptedHandler::new()))
        .await
        .unwrap();

    let health = h.runtime.health(&[TOPIC]).await;
    assert!(health.is_healthy());

    let health = h.runtime.health(&[TOPIC, "unknown"]).await;
    assert!(health.broker_ok);
    assert!(!health.is_healthy());
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn dispatched_job_reconciles_to_partial() {
    let h = harness();
    let record = h
        .runtime
        .dispatch_job(&DispatchRequest::new("web*", "state.apply"), None)
        .await
        .unwrap();
    assert_eq!(record.status, JobState::Running);
    assert_eq!(h.plane.dispatched().len(), 1);

    let (tx, rx) = oneshot::channel();
    h.runtime
        .on_job_complete(record.jid.clone(), move |job| {
            let _ = tx.send(job.status);
        })
        .await
        .unwrap();

    h.plane.publish(&record.jid, plane_result(2, 1));
    let job = h
        .runtime
        .wait_for_job(&record.jid, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(job.status, JobState::Partial);
    assert_eq!((job.success_count, job.failed_count), (2, 1));
    assert!(job.end_time.is_some());

    let fired = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert_eq!(fired, JobState::Partial);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn waiting_on_a_silent_job_times_out() {
    let h = harness();
    let record = h
        .runtime
        .dispatch_job(&DispatchRequest::new("db*", "test.ping"), None)
        .await
        .unwrap();

    let err = h
        .runtime
        .wait_for_job(&record.jid, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ArmadaError::Timeout(_)));

    let job = h.runtime.force_check_job(&record.jid).await.unwrap();
    assert_eq!(job.status, JobState::Running);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn bulk_run_streams_progress_and_persists_result() {
    let h = harness_with(MockItemExecutor::failing(["web-001"]), MockDeleter::new());
    let mut handle = h.runtime.start_bulk_run(targets("web", 6), Some(2));

    let mut progress = 0;
    let mut logs = 0;
    while let Some(event) = handle.progress.recv().await {
        match event {
            BulkEvent::Progress(p) => {
                progress += 1;
                assert_eq!(p.total, 6);
            }
            BulkEvent::Log { .. } => logs += 1,
        }
    }
    assert_eq!(progress, 6);
    assert_eq!(logs, 6);

    let (run_id, runtime) = (handle.run_id, &h.runtime);
    assert!(
        wait_until(Duration::from_secs(2), move || async move {
            matches!(
                runtime.bulk_run(run_id).await,
                Ok(Some(run)) if run.status.is_terminal()
            )
        })
        .await
    );
    let run = h.runtime.bulk_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, BulkRunStatus::Partial);
    assert_eq!((run.success_count, run.failed_count), (5, 1));
    assert!(run.finished_at.is_some());
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn soft_delete_is_idempotent_per_target() {
    let h = harness();
    let first = h.runtime.soft_delete("vm-1", false).await.unwrap();
    let second = h.runtime.soft_delete("vm-1", true).await.unwrap();
    assert_eq!(first.id, second.id);

    let runtime = &h.runtime;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            matches!(
                runtime.delete_status("vm-1").await,
                Ok(Some(task)) if task.status == DeleteStatus::Completed
            )
        })
        .await
    );
    assert_eq!(h.deleter.calls("vm-1"), 1);

    let again = h.runtime.soft_delete("vm-1", false).await.unwrap();
    assert_ne!(again.id, first.id);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn soft_delete_gives_up_after_max_retries() {
    let deleter = MockDeleter::new();
    deleter.fail_target("vm-stuck");
    let h = harness_with(MockItemExecutor::new(), deleter);

    h.runtime.soft_delete("vm-stuck", false).await.unwrap();
    let runtime = &h.runtime;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            matches!(
                runtime.delete_status("vm-stuck").await,
                Ok(Some(task)) if task.status == DeleteStatus::Failed && !task.can_retry()
            )
        })
        .await
    );

    let task = h.runtime.delete_status("vm-stuck").await.unwrap().unwrap();
    // The first attempt plus three retries.
    assert_eq!(task.retry_count, 4);
    assert!(task.last_error.is_some());
    assert_eq!(h.deleter.calls("vm-stuck"), 4);
    h.runtime.shutdown().await;
}

#[tokio::test]
async fn builder_rejects_missing_dependencies() {
    let err = ArmadaRuntimeBuilder::in_memory(fast_config())
        .with_item_executor(Arc::new(MockItemExecutor::new()))
        .with_deleter(Arc::new(MockDeleter::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("execution plane"));

    let mut config = fast_config();
    config.bulk.default_parallelism = 0;
    let err = ArmadaRuntimeBuilder::in_memory(config)
        .with_plane(Arc::new(MockExecutionPlane::new()))
        .with_item_executor(Arc::new(MockItemExecutor::new()))
        .with_deleter(Arc::new(MockDeleter::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("default_parallelism"));
}

#[tokio::test]
async fn runtime_cannot_restart_after_shutdown() {
    let h = harness();
    h.runtime.start().unwrap();
    h.runtime.shutdown().await;

    let err = h.runtime.start().unwrap_err();
    assert!(err.to_string().contains("cannot be restarted"));
}
