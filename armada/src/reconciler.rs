//! Job reconciliation loop.
//!
//! Jobs dispatched to the execution plane are fire-and-forget: the plane
//! hands back a jid and nothing else. The reconciler polls running jobs on a
//! fixed interval, classifies any result the plane reports, and moves the job
//! to a terminal state through a conditional write so concurrent reconcilers
//! never both apply a transition.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::Instrument;

use crate::config::ReconcilerConfig;
use crate::error::ArmadaError;
use crate::events::{publish_quietly, EventPayload, EventPublisher};
use crate::job::{
    is_valid_transition, summarize_result, Jid, JobRecord, JobState, JobUpdate, PlaneResult,
};
use crate::plane::ExecutionPlane;
use crate::runtime::{BackgroundTasks, ShutdownToken};
use crate::status::{keys, StatusStore, StatusStoreExt};
use crate::task::TaskId;
use crate::telemetry;

/// Persistent job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new record. Returns false when the jid already exists.
    async fn insert(&self, record: JobRecord) -> anyhow::Result<bool>;

    async fn get(&self, jid: &Jid) -> anyhow::Result<Option<JobRecord>>;

    /// Up to `limit` running jobs, oldest `start_time` first.
    async fn list_running(&self, limit: usize) -> anyhow::Result<Vec<JobRecord>>;

    /// Applies `update` only while the stored status equals `expected`.
    /// Returns whether this call won.
    async fn update_if(&self, jid: &Jid, expected: JobState, update: &JobUpdate)
    -> anyhow::Result<bool>;
}

/// Process-local job table.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<Mutex<HashMap<Jid, JobRecord>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&record.jid) {
            return Ok(false);
        }
        jobs.insert(record.jid.clone(), record);
        Ok(true)
    }

    async fn get(&self, jid: &Jid) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.jobs.lock().get(jid).cloned())
    }

    async fn list_running(&self, limit: usize) -> anyhow::Result<Vec<JobRecord>> {
        let mut running: Vec<JobRecord> = self
            .jobs
            .lock()
            .values()
            .filter(|job| job.status == JobState::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.jid.cmp(&b.jid)));
        running.truncate(limit);
        Ok(running)
    }

    async fn update_if(
        &self,
        jid: &Jid,
        expected: JobState,
        update: &JobUpdate,
    ) -> anyhow::Result<bool> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(jid) {
            Some(job) if job.status == expected => {
                job.apply(update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// One-shot notification fired when a job reaches a terminal state.
pub type JobCallback = Box<dyn FnOnce(&JobRecord) + Send>;

/// Counters for one reconciliation tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub examined: usize,
    pub timed_out: usize,
    /// Jobs moved to completed, failed or partial from a plane result.
    pub finalized: usize,
    pub still_running: usize,
    pub lookup_errors: usize,
    /// Conditional writes lost to another reconciler.
    pub conflicts: usize,
    /// Writes refused by the state machine.
    pub rejected: usize,
    /// Job store errors; the job is retried on a later tick.
    pub store_errors: usize,
}

impl TickReport {
    fn absorb(&mut self, outcome: Reconciled) {
        match outcome {
            Reconciled::StillRunning => self.still_running += 1,
            Reconciled::LookupError => self.lookup_errors += 1,
            Reconciled::Transition(Transition::Applied(job)) if job.status == JobState::Timeout => {
                self.timed_out += 1
            }
            Reconciled::Transition(Transition::Applied(_)) => self.finalized += 1,
            Reconciled::Transition(Transition::Conflict) => self.conflicts += 1,
            Reconciled::Transition(Transition::Rejected) => self.rejected += 1,
        }
    }
}

/// Result of attempting a single job transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Applied(JobRecord),
    /// Another writer changed the job first.
    Conflict,
    /// The state machine does not allow the edge.
    Rejected,
}

#[derive(Debug)]
enum Reconciled {
    StillRunning,
    LookupError,
    Transition(Transition),
}

/// Polls the execution plane for running jobs and applies their outcome.
pub struct JobReconciler {
    config: ReconcilerConfig,
    jobs: Arc<dyn JobStore>,
    plane: Arc<dyn ExecutionPlane>,
    status: Arc<dyn StatusStore>,
    events: Arc<dyn EventPublisher>,
    callbacks: Mutex<HashMap<Jid, JobCallback>>,
    tasks: BackgroundTasks,
}

impl std::fmt::Debug for JobReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobReconciler")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks.lock().len())
            .field("running", &self.tasks.is_running())
            .finish()
    }
}

impl JobReconciler {
    pub fn new(
        config: ReconcilerConfig,
        jobs: Arc<dyn JobStore>,
        plane: Arc<dyn ExecutionPlane>,
        status: Arc<dyn StatusStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            jobs,
            plane,
            status,
            events,
            callbacks: Mutex::new(HashMap::new()),
            tasks: BackgroundTasks::new("job-reconciler"),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.jobs)
    }

    /// Registers a job the plane accepted and moves it to `running`.
    pub async fn track(&self, jid: Jid, task_id: Option<TaskId>) -> anyhow::Result<JobRecord> {
        let record = JobRecord::new(jid.clone(), task_id);
        if !self.jobs.insert(record.clone()).await? {
            return self
                .jobs
                .get(&jid)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {jid} vanished after insert conflict"));
        }

        match self.apply(&record, JobUpdate::running()).await? {
            Transition::Applied(running) => {
                tracing::info!(jid = %jid, task_id = ?task_id, "tracking job");
                Ok(running)
            }
            Transition::Conflict | Transition::Rejected => self
                .jobs
                .get(&jid)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {jid} not found")),
        }
    }

    /// Fires `callback` once when `jid` reaches a terminal state. Replaces any
    /// callback registered earlier for the same job. A job that is already
    /// terminal fires the callback before this returns.
    pub async fn register_callback<F>(&self, jid: Jid, callback: F) -> anyhow::Result<()>
    where
        F: FnOnce(&JobRecord) + Send + 'static,
    {
        self.callbacks.lock().insert(jid.clone(), Box::new(callback));

        // The terminal transition may have landed before the insert.
        let job = match self.jobs.get(&jid).await {
            Ok(job) => job,
            Err(err) => {
                self.callbacks.lock().remove(&jid);
                return Err(err);
            }
        };
        if let Some(job) = job.filter(|job| job.status.is_terminal()) {
            self.fire_callback(&job);
        }
        Ok(())
    }

    /// Runs one pass over the oldest running jobs.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        let started = Instant::now();
        let running = self.jobs.list_running(self.config.batch_size).await?;
        let mut report = TickReport {
            examined: running.len(),
            ..Default::default()
        };

        let now = Utc::now();
        let (expired, live): (Vec<JobRecord>, Vec<JobRecord>) =
            running.into_iter().partition(|job| self.is_expired(job, now));

        for job in expired {
            match self.time_out(&job).await {
                Ok(outcome) => report.absorb(Reconciled::Transition(outcome)),
                Err(err) => {
                    tracing::warn!(jid = %job.jid, "job timeout write failed: {err}");
                    report.store_errors += 1;
                }
            }
        }

        let outcomes: Vec<anyhow::Result<Reconciled>> = stream::iter(live)
            .map(|job| async move {
                let lookup = self.lookup(&job.jid).await;
                self.settle(&job, lookup).await
            })
            .buffer_unordered(self.config.lookup_concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => report.absorb(outcome),
                Err(err) => {
                    tracing::warn!("job reconcile failed: {err}");
                    report.store_errors += 1;
                }
            }
        }

        telemetry::record_reconcile_tick(
            report.examined,
            report.finalized + report.timed_out,
            started.elapsed(),
        );
        Ok(report)
    }

    /// Reconciles one job immediately, outside the tick schedule.
    pub async fn force_check(&self, jid: &Jid) -> anyhow::Result<JobRecord> {
        let job = self
            .jobs
            .get(jid)
            .await?
            .ok_or_else(|| ArmadaError::NotFound(format!("job {jid}")))?;
        if job.status != JobState::Running {
            return Ok(job);
        }

        if self.is_expired(&job, Utc::now()) {
            self.time_out(&job).await?;
        } else {
            let lookup = self.lookup(jid).await;
            self.settle(&job, lookup).await?;
        }
        self.jobs
            .get(jid)
            .await?
            .ok_or_else(|| ArmadaError::NotFound(format!("job {jid}")).into())
    }

    /// Polls the last-known status until the job is terminal.
    pub async fn wait_for_completion(
        &self,
        jid: &Jid,
        timeout: Duration,
    ) -> Result<JobRecord, ArmadaError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.last_known(jid).await.map_err(ArmadaError::transient)? {
                if job.status.is_terminal() {
                    return Ok(job);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ArmadaError::Timeout(timeout));
            }
            tokio::time::sleep_until(
                (tokio::time::Instant::now() + self.config.wait_poll_interval()).min(deadline),
            )
            .await;
        }
    }

    /// Cached status, falling back to the job table.
    pub async fn last_known(&self, jid: &Jid) -> anyhow::Result<Option<JobRecord>> {
        let cached: Option<JobRecord> = self.status.get_json(&keys::job_status(jid)).await?;
        match cached {
            Some(job) => Ok(Some(job)),
            None => self.jobs.get(jid).await,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let reconciler = Arc::clone(self);
        let shutdown = self.tasks.token();
        self.tasks.spawn(reconciler.run(shutdown));
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown(timeout).await;
    }

    async fn run(self: Arc<Self>, shutdown: ShutdownToken) {
        let interval = self.config.interval();
        while shutdown.sleep(interval).await {
            match self.tick().await {
                Ok(report) if report.examined > 0 => {
                    tracing::debug!(?report, "reconcile tick");
                }
                Ok(_) => {}
                Err(err) => tracing::error!("reconcile tick failed: {err}"),
            }
        }
        tracing::info!("job reconciler shutting down");
    }

    fn is_expired(&self, job: &JobRecord, now: chrono::DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.config.job_timeout()) {
            Ok(limit) => job.elapsed(now) > limit,
            Err(_) => false,
        }
    }

    async fn lookup(&self, jid: &Jid) -> anyhow::Result<Option<PlaneResult>> {
        let timeout = self.config.lookup_timeout();
        match tokio::time::timeout(timeout, self.plane.lookup(jid)).await {
            Ok(result) => result,
            Err(_) => Err(ArmadaError::Timeout(timeout).into()),
        }
    }

    async fn time_out(&self, job: &JobRecord) -> anyhow::Result<Transition> {
        tracing::warn!(
            jid = %job.jid,
            started = %job.start_time,
            "job exceeded timeout"
        );
        let update = JobUpdate::finish(job, JobState::Timeout, Utc::now());
        self.apply(job, update).await
    }

    async fn settle(
        &self,
        job: &JobRecord,
        lookup: anyhow::Result<Option<PlaneResult>>,
    ) -> anyhow::Result<Reconciled> {
        let span = telemetry::job_reconcile_span(job.jid.as_str());
        self.classify(job, lookup).instrument(span).await
    }

    async fn classify(
        &self,
        job: &JobRecord,
        lookup: anyhow::Result<Option<PlaneResult>>,
    ) -> anyhow::Result<Reconciled> {
        let result = match lookup {
            Ok(Some(result)) if !result.is_empty() => result,
            Ok(_) => return Ok(Reconciled::StillRunning),
            Err(err) => {
                telemetry::record_job_lookup_error(job.jid.as_str(), &err);
                return Ok(Reconciled::LookupError);
            }
        };

        let summary = summarize_result(&result);
        let Some(state) = summary.terminal_state() else {
            return Ok(Reconciled::StillRunning);
        };
        if !summary.failed_targets.is_empty() {
            tracing::info!(failed = ?summary.failed_targets, "targets reported failure");
        }
        let raw = serde_json::to_value(&result)?;
        let update = JobUpdate::finish(job, state, Utc::now()).with_summary(&summary, raw);
        Ok(Reconciled::Transition(self.apply(job, update).await?))
    }

    /// Validates and conditionally writes one transition, then publishes it.
    async fn apply(&self, job: &JobRecord, update: JobUpdate) -> anyhow::Result<Transition> {
        let from = job.status;
        let to = update.status;
        if !is_valid_transition(from, to) {
            let err = ArmadaError::IllegalTransition {
                jid: job.jid.clone(),
                from,
                to,
            };
            tracing::warn!("{err}");
            return Ok(Transition::Rejected);
        }

        if !self.jobs.update_if(&job.jid, from, &update).await? {
            tracing::debug!(jid = %job.jid, %from, %to, "job transition lost to another writer");
            return Ok(Transition::Conflict);
        }

        let mut updated = job.clone();
        updated.apply(&update);
        telemetry::record_job_transition(from.as_str(), to.as_str());

        if let Err(err) = self
            .status
            .set_json(
                &keys::job_status(&updated.jid),
                &updated,
                Some(self.config.status_ttl()),
            )
            .await
        {
            tracing::warn!(jid = %updated.jid, "failed to cache job status: {err}");
        }

        if to.is_terminal() {
            publish_quietly(
                self.events.as_ref(),
                EventPayload::JobStateChanged {
                    jid: updated.jid.clone(),
                    task_id: updated.task_id,
                    old: from,
                    new: to,
                    success_count: updated.success_count,
                    failed_count: updated.failed_count,
                    duration_secs: updated.duration_secs,
                },
            )
            .await;

            self.fire_callback(&updated);
        }

        Ok(Transition::Applied(updated))
    }

    /// Removes and runs the callback for `job`, if one is still registered.
    fn fire_callback(&self, job: &JobRecord) {
        let callback = self.callbacks.lock().remove(&job.jid);
        if let Some(callback) = callback {
            let fired = std::panic::catch_unwind(AssertUnwindSafe(|| callback(job)));
            if fired.is_err() {
                tracing::error!(jid = %job.jid, "job callback panicked");
            }
        }
    }
}
