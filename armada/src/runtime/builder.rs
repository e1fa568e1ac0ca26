use std::fmt;
use std::sync::Arc;

use crate::broker::{Broker, InMemoryBroker};
use crate::bulk::{BulkRunRegistry, BulkRunner, ItemExecutor};
use crate::config::ArmadaConfig;
use crate::events::{EventPublisher, InProcEventBus};
use crate::plane::ExecutionPlane;
use crate::queue::TaskQueue;
use crate::reconciler::{InMemoryJobStore, JobReconciler, JobStore};
use crate::soft_delete::{DeleteTaskStore, Deleter, InMemoryDeleteTaskStore, SoftDeleteService};
use crate::status::{InMemoryStatusStore, StatusStore};

use super::supervisor::ArmadaRuntime;

const EVENT_CHANNEL: &str = "armada.events";
const EVENT_CAPACITY: usize = 1024;

/// Builder for an [`ArmadaRuntime`] with explicit dependencies.
///
/// The broker, status store, execution plane, item executor and deleter are
/// required. The job store and delete-task store default to in-memory tables;
/// the event publisher defaults to an [`InProcEventBus`] mirrored into the
/// status store.
///
/// # Example
///
/// ```ignore
/// let runtime = ArmadaRuntimeBuilder::new(config)
///     .with_broker(broker)
///     .with_status_store(store)
///     .with_plane(plane)
///     .with_item_executor(executor)
///     .with_deleter(deleter)
///     .build()?;
/// runtime.start()?;
/// ```
pub struct ArmadaRuntimeBuilder {
    config: ArmadaConfig,
    broker: Option<Arc<dyn Broker>>,
    status: Option<Arc<dyn StatusStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    jobs: Option<Arc<dyn JobStore>>,
    plane: Option<Arc<dyn ExecutionPlane>>,
    executor: Option<Arc<dyn ItemExecutor>>,
    delete_store: Option<Arc<dyn DeleteTaskStore>>,
    deleter: Option<Arc<dyn Deleter>>,
}

impl fmt::Debug for ArmadaRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmadaRuntimeBuilder")
            .field("config", &self.config)
            .field("broker_set", &self.broker.is_some())
            .field("status_set", &self.status.is_some())
            .field("events_set", &self.events.is_some())
            .field("jobs_set", &self.jobs.is_some())
            .field("plane_set", &self.plane.is_some())
            .field("executor_set", &self.executor.is_some())
            .field("delete_store_set", &self.delete_store.is_some())
            .field("deleter_set", &self.deleter.is_some())
            .finish()
    }
}

impl ArmadaRuntimeBuilder {
    pub fn new(config: ArmadaConfig) -> Self {
        Self {
            config,
            broker: None,
            status: None,
            events: None,
            jobs: None,
            plane: None,
            executor: None,
            delete_store: None,
            deleter: None,
        }
    }

    /// Pre-populated with the in-memory broker and status store. Callers
    /// still supply the plane, item executor and deleter.
    pub fn in_memory(config: ArmadaConfig) -> Self {
        Self::new(config)
            .with_broker(Arc::new(InMemoryBroker::new()))
            .with_status_store(Arc::new(InMemoryStatusStore::new()))
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_status_store(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_plane(mut self, plane: Arc<dyn ExecutionPlane>) -> Self {
        self.plane = Some(plane);
        self
    }

    pub fn with_item_executor(mut self, executor: Arc<dyn ItemExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_delete_store(mut self, store: Arc<dyn DeleteTaskStore>) -> Self {
        self.delete_store = Some(store);
        self
    }

    pub fn with_deleter(mut self, deleter: Arc<dyn Deleter>) -> Self {
        self.deleter = Some(deleter);
        self
    }

    /// Validates the configuration and wires every service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a required
    /// dependency is missing.
    pub fn build(self) -> anyhow::Result<ArmadaRuntime> {
        self.config.validate()?;

        let broker = self
            .broker
            .ok_or_else(|| anyhow::anyhow!("broker dependency missing"))?;
        let status = self
            .status
            .ok_or_else(|| anyhow::anyhow!("status store dependency missing"))?;
        let plane = self
            .plane
            .ok_or_else(|| anyhow::anyhow!("execution plane dependency missing"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("item executor dependency missing"))?;
        let deleter = self
            .deleter
            .ok_or_else(|| anyhow::anyhow!("deleter dependency missing"))?;

        let config = self.config;
        let events = self.events.unwrap_or_else(|| {
            Arc::new(
                InProcEventBus::new(EVENT_CHANNEL, EVENT_CAPACITY)
                    .with_cache(Arc::clone(&status), config.queue.status_ttl()),
            )
        });
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let delete_store = self
            .delete_store
            .unwrap_or_else(|| Arc::new(InMemoryDeleteTaskStore::new()));

        let queue = TaskQueue::new(
            config.queue.clone(),
            broker,
            Arc::clone(&status),
            Arc::clone(&events),
        );
        let reconciler = Arc::new(JobReconciler::new(
            config.reconciler.clone(),
            jobs,
            Arc::clone(&plane),
            Arc::clone(&status),
            Arc::clone(&events),
        ));
        let bulk = BulkRunRegistry::new(
            Arc::new(BulkRunner::new(config.bulk.clone(), executor)),
            status,
            Arc::clone(&events),
        );
        let deletes = Arc::new(SoftDeleteService::new(
            config.soft_delete.clone(),
            delete_store,
            deleter,
            Arc::clone(&events),
        ));

        Ok(ArmadaRuntime::new(
            config, queue, reconciler, plane, bulk, deletes, events,
        ))
    }
}
