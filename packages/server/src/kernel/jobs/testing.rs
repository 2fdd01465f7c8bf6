//! In-memory job queue for tests.
//!
//! Same contract as the Postgres queue — idempotency-key dedup, lease +
//! fence on claim, retry chains, dead-lettering — without a database. Tests
//! drive the runner and assert on queue state directly.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::job::{retry_delay, ErrorKind, Job, JobStatus};
use super::queue::{ClaimedJob, EnqueueResult, JobQueue, JobSpec};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    insertion_order: Vec<Uuid>,
}

/// In-memory [`JobQueue`] implementation.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    lease_ms: i64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            lease_ms: 60_000,
        }
    }

    /// All jobs, in insertion order.
    pub fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().unwrap();
        state
            .insertion_order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.state.lock().unwrap().jobs.get(&id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<Job> {
        self.jobs()
            .into_iter()
            .filter(|j| j.status == JobStatus::DeadLetter)
            .collect()
    }

    /// The retry chain rooted at `root`, oldest attempt first.
    pub fn attempt_history(&self, root: Uuid) -> Vec<Job> {
        let mut chain: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|j| j.id == root || j.root_job_id == Some(root))
            .collect();
        chain.sort_by_key(|j| j.attempt);
        chain
    }

    fn outstanding_with_key(&self, key: &str) -> Option<Uuid> {
        let state = self.state.lock().unwrap();
        state
            .insertion_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .find(|j| {
                j.idempotency_key.as_deref() == Some(key)
                    && matches!(j.status, JobStatus::Pending | JobStatus::Running)
            })
            .map(|j| j.id)
    }

    fn insert(&self, job: Job) {
        let mut state = self.state.lock().unwrap();
        state.insertion_order.push(job.id);
        state.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult> {
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.outstanding_with_key(key) {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let job = Job::for_command(
            spec.job_type,
            spec.args,
            spec.idempotency_key,
            spec.source_name,
            spec.priority,
            spec.max_retries,
            spec.run_at,
            self.lease_ms,
        );
        let id = job.id;
        self.insert(job);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();

        let mut ready: Vec<Uuid> = state
            .insertion_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|j| {
                let pending_ready = j.status == JobStatus::Pending
                    && j.next_run_at.map(|t| t <= now).unwrap_or(true);
                let lease_expired = j.status == JobStatus::Running
                    && j.lease_expires_at.map(|t| t < now).unwrap_or(false);
                pending_ready || lease_expired
            })
            .map(|j| j.id)
            .collect();
        ready.sort_by_key(|id| {
            let j = &state.jobs[id];
            (j.priority.as_i16(), j.next_run_at.unwrap_or(j.created_at))
        });
        ready.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.worker_id = Some(worker_id.to_string());
                job.last_run_at = Some(now);
                job.lease_expires_at = Some(now + Duration::milliseconds(job.lease_duration_ms));
                job.fence += 1;
                job.updated_at = now;
                claimed.push(ClaimedJob {
                    id,
                    job: job.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::Succeeded;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<()> {
        let retry = {
            let mut state = self.state.lock().unwrap();
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return Ok(());
            };

            if kind.should_retry() && job.attempt < job.max_retries {
                job.status = JobStatus::Failed;
                job.error_message = Some(error.to_string());
                job.error_kind = Some(kind);
                job.updated_at = Utc::now();
                Some(job.create_retry(Utc::now() + retry_delay(job.attempt)))
            } else {
                job.status = JobStatus::DeadLetter;
                job.error_message = Some(error.to_string());
                job.error_kind = Some(kind);
                job.dead_lettered_at = Some(Utc::now());
                job.dead_letter_reason = Some(if kind.should_retry() {
                    "max retries exceeded".to_string()
                } else {
                    "non-retryable error".to_string()
                });
                job.updated_at = Utc::now();
                None
            }
        };

        if let Some(retry_job) = retry {
            self.insert(retry_job);
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                job.next_run_at = Some(run_at);
                job.lease_expires_at = None;
                job.worker_id = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(ErrorKind::Cancelled);
                job.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn heartbeat(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state.jobs.get_mut(&job.id) {
            if stored.status == JobStatus::Running && stored.fence == job.fence {
                stored.lease_expires_at =
                    Some(Utc::now() + Duration::milliseconds(stored.lease_duration_ms));
            }
        }
        Ok(())
    }

    async fn next_run_time(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .filter_map(|j| j.next_run_at)
            .min())
    }

    async fn replay_dead_letter(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::DeadLetter {
                job.status = JobStatus::Pending;
                job.attempt = 1;
                job.next_run_at = Some(Utc::now());
                job.error_message = None;
                job.error_kind = None;
                job.dead_lettered_at = None;
                job.dead_letter_reason = None;
                job.replay_count += 1;
                job.updated_at = Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn resolve_dead_letter(&self, job_id: Uuid, note: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::DeadLetter && job.resolved_at.is_none() {
                job.resolved_at = Some(Utc::now());
                job.resolution_note = Some(note.to_string());
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::JobPriority;

    fn spec(key: Option<&str>) -> JobSpec {
        JobSpec {
            job_type: "sync_chapters",
            args: serde_json::json!({}),
            idempotency_key: key.map(String::from),
            source_name: Some("mangahost".to_string()),
            priority: JobPriority::Normal,
            max_retries: 3,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_deduplicated_while_outstanding() {
        let queue = InMemoryJobQueue::new();

        let first = queue.enqueue(spec(Some("sync:incremental:x"))).await.unwrap();
        let second = queue.enqueue(spec(Some("sync:incremental:x"))).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn key_is_free_again_after_completion() {
        let queue = InMemoryJobQueue::new();

        let first = queue.enqueue(spec(Some("sync:incremental:x"))).await.unwrap();
        queue.mark_succeeded(first.job_id()).await.unwrap();

        let second = queue.enqueue(spec(Some("sync:incremental:x"))).await.unwrap();
        assert!(second.is_created());
        assert_ne!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn claim_bumps_fence_and_leases() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(spec(None)).await.unwrap();

        let claimed = queue.claim("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.fence, 1);
        assert!(claimed[0].job.lease_expires_at.is_some());

        // Nothing left to claim while the lease is live.
        assert!(queue.claim("worker-2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_then_dead_letters_with_history() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(spec(Some("sync:incremental:x"))).await.unwrap();
        let root = first.job_id();

        // Exhaust all 3 attempts.
        let mut current = root;
        for _ in 0..3 {
            queue
                .mark_failed(current, "network timeout", ErrorKind::Retryable)
                .await
                .unwrap();
            let chain = queue.attempt_history(root);
            current = chain.last().unwrap().id;
        }

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 3);
        assert_eq!(dead[0].error_message.as_deref(), Some("network timeout"));

        let history = queue.attempt_history(root);
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().map(|j| j.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let queue = InMemoryJobQueue::new();
        let result = queue.enqueue(spec(None)).await.unwrap();

        queue
            .mark_failed(result.job_id(), "bad payload", ErrorKind::NonRetryable)
            .await
            .unwrap();

        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn released_job_waits_until_run_at() {
        let queue = InMemoryJobQueue::new();
        let result = queue.enqueue(spec(None)).await.unwrap();

        let claimed = queue.claim("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        queue
            .release(result.job_id(), Utc::now() + Duration::seconds(30))
            .await
            .unwrap();

        // Not claimable until run_at passes; attempt count untouched.
        assert!(queue.claim("worker-1", 10).await.unwrap().is_empty());
        assert_eq!(queue.job(result.job_id()).unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn replayed_dead_letter_is_claimable_again() {
        let queue = InMemoryJobQueue::new();
        let result = queue.enqueue(spec(None)).await.unwrap();

        queue
            .mark_failed(result.job_id(), "bad payload", ErrorKind::NonRetryable)
            .await
            .unwrap();
        assert_eq!(queue.dead_letters().len(), 1);

        assert!(queue.replay_dead_letter(result.job_id()).await.unwrap());
        assert!(queue.dead_letters().is_empty());

        let replayed = queue.job(result.job_id()).unwrap();
        assert_eq!(replayed.status, JobStatus::Pending);
        assert_eq!(replayed.replay_count, 1);
        assert_eq!(replayed.attempt, 1);
    }

    #[tokio::test]
    async fn resolved_dead_letter_keeps_its_record() {
        let queue = InMemoryJobQueue::new();
        let result = queue.enqueue(spec(None)).await.unwrap();
        queue
            .mark_failed(result.job_id(), "bad payload", ErrorKind::NonRetryable)
            .await
            .unwrap();

        assert!(queue
            .resolve_dead_letter(result.job_id(), "known upstream outage")
            .await
            .unwrap());
        // Still dead-lettered, just resolved; resolving twice is a no-op.
        assert_eq!(queue.job(result.job_id()).unwrap().status, JobStatus::DeadLetter);
        assert!(!queue
            .resolve_dead_letter(result.job_id(), "again")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_jobs() {
        let queue = InMemoryJobQueue::new();
        let result = queue.enqueue(spec(None)).await.unwrap();

        assert!(queue.cancel(result.job_id()).await.unwrap());
        assert!(!queue.cancel(result.job_id()).await.unwrap());
    }
}
