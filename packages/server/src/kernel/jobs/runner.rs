//! Job runner service for processing background jobs.
//!
//! The `JobRunner` is a long-running service that:
//! - Polls the database for ready jobs and claims them in batches
//! - Deserializes and executes jobs via the registry
//! - Enforces concurrency caps (global, per job type, per upstream source)
//! - Holds jobs back while a source's circuit breaker is open
//! - Sends heartbeats for running jobs and bounds their execution time
//! - Handles status updates; retries and dead-lettering live in the queue
//!
//! # Architecture
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► Poll DB (claim jobs via JobQueue, FOR UPDATE SKIP LOCKED)
//!     ├─► Cap / breaker check (over limit → release back to pending)
//!     ├─► Execute via JobRegistry (deserialize + call handler, with timeout)
//!     └─► Mark succeeded/failed (JobQueue schedules retries / dead-letters)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{ClaimedJob, JobQueue};
use super::registry::SharedJobRegistry;
use super::ErrorKind;
use crate::domains::chapters::sync::SyncError;
use crate::domains::series::canonicalize::CanonicalizeError;
use crate::kernel::source_client::SourceError;
use crate::kernel::ServerDeps;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of jobs to claim at once
    pub batch_size: i64,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to extend the lease of running jobs
    pub heartbeat_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
    /// Global cap on concurrently executing jobs
    pub max_concurrent_jobs: usize,
    /// Cap per job type
    pub max_concurrent_per_type: usize,
    /// Cap per upstream source
    pub max_concurrent_per_source: usize,
    /// How long a capped or breaker-held job waits before it becomes
    /// claimable again
    pub held_back_delay: Duration,
    /// How long shutdown waits for in-flight jobs before force-exiting
    pub drain_timeout: Duration,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            max_concurrent_jobs: 16,
            max_concurrent_per_type: 8,
            max_concurrent_per_source: 2,
            held_back_delay: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl JobRunnerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Live occupancy per job type and upstream source. All three caps are
/// enforced independently; a job over any one of them is held back.
#[derive(Default)]
struct Occupancy {
    total: usize,
    by_type: HashMap<String, usize>,
    by_source: HashMap<String, usize>,
}

struct RunningSet {
    config: JobRunnerConfig,
    inner: Mutex<Occupancy>,
}

impl RunningSet {
    fn new(config: JobRunnerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Occupancy::default()),
        }
    }

    fn total(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    /// Admit a job if no cap is exceeded, incrementing the counters.
    fn try_admit(&self, job_type: &str, source_name: Option<&str>) -> bool {
        let mut occ = self.inner.lock().unwrap();
        if occ.total >= self.config.max_concurrent_jobs {
            return false;
        }
        if occ.by_type.get(job_type).copied().unwrap_or(0) >= self.config.max_concurrent_per_type {
            return false;
        }
        if let Some(source) = source_name {
            if occ.by_source.get(source).copied().unwrap_or(0)
                >= self.config.max_concurrent_per_source
            {
                return false;
            }
        }
        occ.total += 1;
        *occ.by_type.entry(job_type.to_string()).or_insert(0) += 1;
        if let Some(source) = source_name {
            *occ.by_source.entry(source.to_string()).or_insert(0) += 1;
        }
        true
    }

    fn leave(&self, job_type: &str, source_name: Option<&str>) {
        let mut occ = self.inner.lock().unwrap();
        occ.total = occ.total.saturating_sub(1);
        if let Some(count) = occ.by_type.get_mut(job_type) {
            *count = count.saturating_sub(1);
        }
        if let Some(source) = source_name {
            if let Some(count) = occ.by_source.get_mut(source) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// What the runner should do with a failed job.
enum FailureAction {
    /// Another worker owns the target; the job is already in progress
    /// elsewhere. Complete without retrying.
    Skip,
    /// Record the failure and let the queue decide retry vs dead letter.
    Fail(ErrorKind),
}

/// Background service that processes jobs from the queue.
pub struct JobRunner {
    job_queue: Arc<dyn JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
    config: JobRunnerConfig,
    running: Arc<RunningSet>,
}

impl JobRunner {
    pub fn new(
        job_queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
    ) -> Self {
        Self::with_config(job_queue, registry, deps, JobRunnerConfig::default())
    }

    pub fn with_config(
        job_queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
        config: JobRunnerConfig,
    ) -> Self {
        let running = Arc::new(RunningSet::new(config.clone()));
        Self {
            job_queue,
            registry,
            deps,
            config,
            running,
        }
    }

    /// Run the job runner until the shutdown token fires.
    ///
    /// On shutdown the runner stops claiming, waits up to `drain_timeout`
    /// for in-flight jobs, then returns. Interrupted jobs roll back their
    /// transactions and are retried by another worker after lease expiry.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent_jobs,
            "job runner starting"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reap finished tasks without blocking.
            while tasks.try_join_next().is_some() {}

            let capacity = self
                .config
                .max_concurrent_jobs
                .saturating_sub(self.running.total());
            if capacity == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let limit = (capacity as i64).min(self.config.batch_size);
            let jobs = match self.job_queue.claim(&self.config.worker_id, limit).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            for job in jobs {
                let source_name = job.job.source_name.clone();

                // A source with an open breaker gets no calls until its
                // cooldown elapses; the job waits instead of failing.
                if let Some(source) = &source_name {
                    if !self.deps.breakers.allow(source) {
                        debug!(job_id = %job.id, source = %source, "breaker open, holding job back");
                        self.release_held_back(&job).await;
                        continue;
                    }
                }

                if !self
                    .running
                    .try_admit(job.job_type(), source_name.as_deref())
                {
                    debug!(job_id = %job.id, "concurrency cap reached, holding job back");
                    self.release_held_back(&job).await;
                    continue;
                }

                let queue = self.job_queue.clone();
                let registry = self.registry.clone();
                let deps = self.deps.clone();
                let running = self.running.clone();
                let heartbeat_interval = self.config.heartbeat_interval;
                let job_shutdown = shutdown.child_token();

                tasks.spawn(async move {
                    let job_type = job.job_type().to_string();
                    let source = job.job.source_name.clone();
                    process_job(job, queue, registry, deps, heartbeat_interval, job_shutdown)
                        .await;
                    running.leave(&job_type, source.as_deref());
                });
            }
        }

        // Drain: give in-flight jobs a bounded window to finish.
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(count = in_flight, "waiting for running jobs to complete");
            let drained = tokio::time::timeout(self.config.drain_timeout, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("drain timeout exceeded, abandoning in-flight jobs to lease recovery");
                tasks.abort_all();
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }

    async fn release_held_back(&self, job: &ClaimedJob) {
        let run_at = Utc::now()
            + chrono::Duration::from_std(self.config.held_back_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        if let Err(e) = self.job_queue.release(job.id, run_at).await {
            error!(job_id = %job.id, error = %e, "failed to release held-back job");
        }
    }
}

/// Execute one claimed job with heartbeats and a hard timeout.
async fn process_job(
    job: ClaimedJob,
    queue: Arc<dyn JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) {
    let job_id = job.id;
    let job_type = job.job_type().to_string();
    let source_name = job.job.source_name.clone();

    // Heartbeat task keeps the lease alive while the handler runs.
    let heartbeat_cancel = shutdown.child_token();
    let heartbeat_queue = queue.clone();
    let heartbeat_job = job.job.clone();
    let heartbeat_handle = tokio::spawn({
        let cancel = heartbeat_cancel.clone();
        async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = heartbeat_queue.heartbeat(&heartbeat_job).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }
    });

    let timeout = Duration::from_millis(job.job.timeout_ms.max(0) as u64);
    let result = tokio::time::timeout(timeout, registry.execute(&job, deps.clone())).await;

    heartbeat_cancel.cancel();
    let _ = heartbeat_handle.await;

    match result {
        Ok(Ok(())) => {
            debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
            if let Some(source) = &source_name {
                deps.breakers.record_success(source);
            }
            if let Err(e) = queue.mark_succeeded(job_id).await {
                error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
            }
        }
        Ok(Err(e)) => {
            match classify_error(&e, shutdown.is_cancelled()) {
                FailureAction::Skip => {
                    debug!(job_id = %job_id, job_type = %job_type, reason = %e,
                        "target already in progress elsewhere, skipping");
                    if let Err(e) = queue.mark_succeeded(job_id).await {
                        error!(job_id = %job_id, error = %e, "failed to mark skipped job");
                    }
                }
                FailureAction::Fail(kind) => {
                    warn!(job_id = %job_id, job_type = %job_type, error = %e, "job failed");
                    if let Some(source) = &source_name {
                        deps.breakers.record_failure(source);
                    }
                    if let Err(mark_err) = queue.mark_failed(job_id, &e.to_string(), kind).await {
                        error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
                    }
                }
            }
        }
        Err(_elapsed) => {
            warn!(job_id = %job_id, job_type = %job_type, timeout_ms = job.job.timeout_ms,
                "job exceeded max execution time");
            if let Some(source) = &source_name {
                deps.breakers.record_failure(source);
            }
            if let Err(e) = queue
                .mark_failed(job_id, "execution timed out", ErrorKind::Retryable)
                .await
            {
                error!(job_id = %job_id, error = %e, "failed to mark timed-out job");
            }
        }
    }
}

/// Classify an error to determine retry behavior.
///
/// Typed errors from the sync pipeline and the source seam carry their own
/// classification; anything else falls back to message inspection.
fn classify_error(error: &anyhow::Error, shutting_down: bool) -> FailureAction {
    if let Some(sync) = error.downcast_ref::<SyncError>() {
        return match sync {
            // Another worker holds the advisory lock or bumped the fence:
            // the work is happening (or already happened) elsewhere.
            SyncError::LockUnavailable | SyncError::FenceExpired => FailureAction::Skip,
        };
    }

    if let Some(canonicalize) = error.downcast_ref::<CanonicalizeError>() {
        return match canonicalize {
            CanonicalizeError::LockUnavailable => FailureAction::Skip,
            CanonicalizeError::UrlAlreadyClaimed { .. } => {
                FailureAction::Fail(ErrorKind::NonRetryable)
            }
        };
    }

    if let Some(source) = error.downcast_ref::<SourceError>() {
        return FailureAction::Fail(if source.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::NonRetryable
        });
    }

    if shutting_down {
        return FailureAction::Fail(ErrorKind::Shutdown);
    }

    let error_str = error.to_string().to_lowercase();

    // Non-retryable: validation errors, not found, bad payloads
    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("unknown job type")
        || error_str.contains("deserialize")
    {
        return FailureAction::Fail(ErrorKind::NonRetryable);
    }

    // Everything else is retryable (network errors, timeouts, etc.)
    FailureAction::Fail(ErrorKind::Retryable)
}
