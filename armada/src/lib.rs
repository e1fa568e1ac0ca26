//! Armada - task orchestration backbone for fleet-management services.
//!
//! A crate providing a durable task queue, job reconciliation against a remote
//! execution plane, parallel bulk runs over many targets, and a retrying
//! soft-delete pipeline.
//!
//! # Core Concepts
//!
//! - **Task**: A unit of work submitted to a topic. Tasks are delivered to
//!   consumer groups through a [`Broker`], processed by a [`TaskHandler`], and
//!   retried with exponential backoff until they complete or dead-letter.
//!
//! - **Status store**: The [`StatusStore`] trait is a TTL key/value cache that
//!   holds task status, stop flags, job snapshots, and bulk-run results.
//!
//! - **Job**: Work started on an [`ExecutionPlane`]. The [`JobReconciler`]
//!   polls the plane and moves each job from `running` to a terminal state
//!   exactly once, even with several reconcilers racing.
//!
//! - **Bulk run**: The [`BulkRunner`] executes one [`ItemExecutor`] call per
//!   target with bounded parallelism and streams progress and log lines.
//!
//! - **Soft delete**: The [`SoftDeleteService`] records one active delete per
//!   target and drives it through a background worker with bounded retries.
//!
//! - **Runtime**: The [`ArmadaRuntime`] ties the services together behind a
//!   single start/shutdown lifecycle.
//!
//! # Feature Flags
//!
//! - `redis` - Redis Streams broker and Redis status store
//! - `postgres` - PostgreSQL job and delete-task tables via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use armada::*;
//!
//! let runtime = ArmadaRuntimeBuilder::in_memory(ArmadaConfig::default())
//!     .with_plane(plane)
//!     .with_item_executor(executor)
//!     .with_deleter(deleter)
//!     .build()?;
//! runtime.start()?;
//!
//! let task_id = runtime
//!     .submit("provision", NewTask::new("ops", serde_json::json!({"host": "web-1"})))
//!     .await?;
//! ```

/// Message broker abstraction with consumer groups and delayed delivery.
pub mod broker;

/// Parallel bulk execution over many targets.
pub mod bulk;

/// Configuration structures for every armada service.
pub mod config;

/// Error types shared across services.
pub mod error;

/// Lifecycle events and the in-process event bus.
pub mod events;

/// Job records, states and plane result summaries.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// Backend implementations for Redis and PostgreSQL.
pub mod persistence;

/// Execution plane client.
pub mod plane;

/// The task queue: enqueue, consume, retry, cancel.
pub mod queue;

/// Job reconciliation against the execution plane.
pub mod reconciler;

/// Remote command execution over SSH for bulk runs.
pub mod remote;

/// Retry backoff and delayed-task promotion.
pub mod retry;

/// Runtime facade, builder and shutdown plumbing.
pub mod runtime;

/// Soft-delete tasks and their background worker.
pub mod soft_delete;

/// TTL key/value status store.
pub mod status;

/// Task types and states.
pub mod task;

/// Tracing setup and structured log helpers.
pub mod telemetry;

pub use broker::{Broker, Delivery, InMemoryBroker, MessageId, ReadRequest};
pub use bulk::{
    BulkEvent, BulkItem, BulkItemStatus, BulkProgress, BulkRun, BulkRunHandle, BulkRunRegistry,
    BulkRunStatus, BulkRunner, ItemExecutor, LogSink, RunId,
};
pub use config::*;
pub use error::ArmadaError;
pub use events::{ArmadaEvent, EventMeta, EventPayload, EventPublisher, InProcEventBus};
pub use job::{Jid, JobRecord, JobState, JobUpdate, PlaneResult, ResultSummary};
pub use plane::{DispatchRequest, ExecutionPlane, HttpExecutionPlane, PlaneError};
pub use queue::{HandlerOutcome, QueueHealth, TaskContext, TaskHandler, TaskQueue};
pub use reconciler::{InMemoryJobStore, JobReconciler, JobStore, TickReport};
pub use remote::{OutputLine, RemoteAuth, RemoteCommandExecutor, RemoteShell, RemoteTarget, SshCommandShell};
pub use retry::{BackoffPolicy, RetryScheduler};
pub use runtime::{ArmadaRuntime, ArmadaRuntimeBuilder, BackgroundTasks, ShutdownToken};
pub use soft_delete::{
    DeleteStatus, DeleteTask, DeleteTaskId, DeleteTaskStore, DeleteUpdate, Deleter,
    InMemoryDeleteTaskStore, SoftDeleteService,
};
pub use status::{keys, InMemoryStatusStore, StatusStore, StatusStoreExt};
pub use task::{NewTask, Task, TaskId, TaskPriority, TaskState, TaskStatus};
