//! PostgreSQL-backed job queue implementation.
//!
//! Durable, at-least-once delivery with idempotency-key dedup. The enqueue
//! path checks for an outstanding job with the same key, and a partial unique
//! index on the jobs table settles the race when two producers check at the
//! same time.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::job::{retry_delay, ErrorKind, Job, JobPriority};

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Command was enqueued, returns new job ID
    Created(Uuid),
    /// An outstanding job already holds this idempotency key
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// A claimed job ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: Job,
}

impl ClaimedJob {
    /// Deserialize the command payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C> {
        let args = self
            .job
            .args
            .as_ref()
            .ok_or_else(|| anyhow!("job {} has no args", self.id))?;
        serde_json::from_value(args.clone())
            .map_err(|e| anyhow!("failed to deserialize command: {}", e))
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }
}

/// Metadata a command provides so it can be stored as a job.
pub trait CommandMeta {
    /// The command type name (used as job_type).
    fn command_type(&self) -> &'static str;

    /// Deterministic idempotency key. If provided, at most one outstanding
    /// job exists with this key.
    fn idempotency_key(&self) -> Option<String> {
        None
    }

    /// Upstream source the job talks to, for per-source throttling and the
    /// circuit breaker.
    fn source_name(&self) -> Option<String> {
        None
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Maximum attempts for this command.
    fn max_retries(&self) -> i32 {
        3
    }
}

/// Everything the queue needs to persist one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: &'static str,
    pub args: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub source_name: Option<String>,
    pub priority: JobPriority,
    pub max_retries: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    /// Build a spec from a serializable command.
    pub fn for_command<C>(command: &C) -> Result<Self>
    where
        C: Serialize + CommandMeta,
    {
        Ok(Self {
            job_type: command.command_type(),
            args: serde_json::to_value(command)?,
            idempotency_key: command.idempotency_key(),
            source_name: command.source_name(),
            priority: command.priority(),
            max_retries: command.max_retries(),
            run_at: None,
        })
    }

    pub fn at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// Trait for job queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, idempotent on the spec's key: a second enqueue while
    /// the first job is outstanding returns `Duplicate` with the existing id.
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult>;

    /// Claim up to `limit` jobs for processing.
    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>>;

    /// Mark a job as successfully completed.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Mark a job as failed. Schedules a retry with backoff while attempts
    /// remain, otherwise dead-letters the job.
    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<()>;

    /// Return a claimed job to the pending queue without counting an
    /// attempt, to run no earlier than `run_at`. Used when a concurrency cap
    /// or an open circuit breaker holds the job back: it waits, it is not
    /// rejected.
    async fn release(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()>;

    /// Cancel a pending job. Running jobs stop via cooperative cancellation.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Extend the lease for a running job (heartbeat).
    async fn heartbeat(&self, job: &Job) -> Result<()>;

    /// Find the next scheduled run time (for sleep optimization).
    async fn next_run_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Move a dead-lettered job back to pending for another round of
    /// attempts (manual operation).
    async fn replay_dead_letter(&self, job_id: Uuid) -> Result<bool>;

    /// Mark a dead-lettered job as manually resolved without replaying it.
    async fn resolve_dead_letter(&self, job_id: Uuid, note: &str) -> Result<bool>;
}

/// PostgreSQL-backed job queue.
pub struct PostgresJobQueue {
    pool: PgPool,
    default_lease_ms: i64,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000, // 1 minute
        }
    }

    pub fn with_lease_duration(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
        }
    }

    /// Find the outstanding (pending/running) job holding an idempotency key.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, priority, args, source_name, idempotency_key,
                   max_retries, attempt, next_run_at, last_run_at, timeout_ms,
                   lease_duration_ms, lease_expires_at, worker_id, fence, error_message,
                   error_kind, dead_lettered_at, dead_letter_reason, replay_count,
                   resolved_at, resolution_note, root_job_id, created_at, updated_at
            FROM jobs
            WHERE idempotency_key = $1
              AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn replay_dead_letter_inner(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempt = 1,
                next_run_at = NOW(),
                error_message = NULL,
                error_kind = NULL,
                dead_lettered_at = NULL,
                dead_letter_reason = NULL,
                replay_count = replay_count + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resolve_dead_letter_inner(&self, job_id: Uuid, note: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET resolved_at = NOW(),
                resolution_note = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'dead_letter'
            "#,
        )
        .bind(job_id)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueResult> {
        // Check idempotency first
        if let Some(key) = &spec.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = Job::for_command(
            spec.job_type,
            spec.args,
            spec.idempotency_key.clone(),
            spec.source_name,
            spec.priority,
            spec.max_retries,
            spec.run_at,
            self.default_lease_ms,
        );

        // The partial unique index on outstanding idempotency keys settles
        // the race two producers lose by both passing the check above.
        match job.insert(&self.pool).await {
            Ok(inserted) => Ok(EnqueueResult::Created(inserted.id)),
            Err(e) => {
                let unique_violation = e
                    .downcast_ref::<sqlx::Error>()
                    .and_then(|e| e.as_database_error())
                    .map(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
                    .unwrap_or(false);
                if unique_violation {
                    if let Some(key) = &spec.idempotency_key {
                        if let Some(existing) = self.find_by_idempotency_key(key).await? {
                            return Ok(EnqueueResult::Duplicate(existing.id));
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let jobs = Job::claim_jobs(limit, worker_id, &self.pool).await?;
        Ok(jobs
            .into_iter()
            .map(|job| ClaimedJob { id: job.id, job })
            .collect())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<()> {
        let job = Job::find_by_id(job_id, &self.pool).await?;

        if kind.should_retry() && job.attempt < job.max_retries {
            let retry_at = Utc::now() + retry_delay(job.attempt);
            let retry_job = job.create_retry(retry_at);

            // Fail the original before inserting the retry: the outstanding
            // idempotency-key index admits one pending row per key at a time.
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    error_message = $1,
                    error_kind = $2,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, status, priority, args, source_name, idempotency_key,
                    max_retries, attempt, next_run_at, timeout_ms, lease_duration_ms,
                    fence, replay_count, root_job_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(retry_job.id)
            .bind(&retry_job.job_type)
            .bind(retry_job.status)
            .bind(retry_job.priority)
            .bind(&retry_job.args)
            .bind(&retry_job.source_name)
            .bind(&retry_job.idempotency_key)
            .bind(retry_job.max_retries)
            .bind(retry_job.attempt)
            .bind(retry_job.next_run_at)
            .bind(retry_job.timeout_ms)
            .bind(retry_job.lease_duration_ms)
            .bind(retry_job.fence)
            .bind(retry_job.replay_count)
            .bind(retry_job.root_job_id)
            .bind(retry_job.created_at)
            .bind(retry_job.updated_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            info!(
                job_id = %job_id,
                retry_job_id = %retry_job.id,
                attempt = retry_job.attempt,
                retry_at = %retry_at,
                "scheduled retry"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dead_letter',
                    error_message = $1,
                    error_kind = $2,
                    dead_lettered_at = NOW(),
                    dead_letter_reason = $4,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(error)
            .bind(kind)
            .bind(job_id)
            .bind(if kind.should_retry() {
                "max retries exceeded"
            } else {
                "non-retryable error"
            })
            .execute(&self.pool)
            .await?;

            warn!(
                job_id = %job_id,
                attempt = job.attempt,
                error = %error,
                "job dead-lettered"
            );
        }

        Ok(())
    }

    async fn release(&self, job_id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                next_run_at = $2,
                lease_expires_at = NULL,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, job: &Job) -> Result<()> {
        job.extend_lease(&self.pool).await
    }

    async fn next_run_time(&self) -> Result<Option<DateTime<Utc>>> {
        Job::find_next_run_time(&self.pool).await
    }

    async fn replay_dead_letter(&self, job_id: Uuid) -> Result<bool> {
        self.replay_dead_letter_inner(job_id).await
    }

    async fn resolve_dead_letter(&self, job_id: Uuid, note: &str) -> Result<bool> {
        self.resolve_dead_letter_inner(job_id, note).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestCommand {
        target: Uuid,
    }

    impl CommandMeta for TestCommand {
        fn command_type(&self) -> &'static str {
            "test_command"
        }

        fn idempotency_key(&self) -> Option<String> {
            Some(format!("test:{}", self.target))
        }

        fn source_name(&self) -> Option<String> {
            Some("mangahost".to_string())
        }

        fn max_retries(&self) -> i32 {
            5
        }
    }

    #[test]
    fn enqueue_result_helpers() {
        let created = EnqueueResult::Created(Uuid::new_v4());
        assert!(created.is_created());

        let duplicate = EnqueueResult::Duplicate(Uuid::new_v4());
        assert!(!duplicate.is_created());
    }

    #[test]
    fn spec_carries_command_meta() {
        let cmd = TestCommand {
            target: Uuid::new_v4(),
        };
        let spec = JobSpec::for_command(&cmd).unwrap();
        assert_eq!(spec.job_type, "test_command");
        assert_eq!(spec.idempotency_key, Some(format!("test:{}", cmd.target)));
        assert_eq!(spec.source_name, Some("mangahost".to_string()));
        assert_eq!(spec.max_retries, 5);
        assert!(spec.run_at.is_none());
    }

    #[test]
    fn claimed_job_deserializes_payload() {
        let cmd = TestCommand {
            target: Uuid::new_v4(),
        };
        let spec = JobSpec::for_command(&cmd).unwrap();
        let job = Job::for_command(
            spec.job_type,
            spec.args,
            spec.idempotency_key,
            spec.source_name,
            spec.priority,
            spec.max_retries,
            None,
            60_000,
        );
        let claimed = ClaimedJob { id: job.id, job };
        let back: TestCommand = claimed.deserialize().unwrap();
        assert_eq!(back.target, cmd.target);
    }
}
