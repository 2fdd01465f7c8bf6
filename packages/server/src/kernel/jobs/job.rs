//! Job model for background command execution.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::utils::db_id;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    DeadLetter,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer for efficient DB ordering (lower = higher priority)
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Cancelled,
    /// Job was interrupted by graceful shutdown - will retry
    Shutdown,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Shutdown)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Base retry delay; doubles per attempt.
const BACKOFF_BASE_SECS: i64 = 30;
/// Retry delay ceiling.
const BACKOFF_MAX_SECS: i64 = 3600;

/// Delay before the next attempt: `min(max, base * 2^attempt + jitter)`,
/// with up to 25% jitter so a burst of failures does not retry in lockstep.
pub fn retry_delay(attempt: i32) -> Duration {
    let exp = attempt.clamp(0, 30) as u32;
    let backoff = BACKOFF_BASE_SECS.saturating_mul(2i64.saturating_pow(exp));
    let jitter = fastrand::i64(0..=backoff / 4);
    Duration::seconds(backoff.saturating_add(jitter).min(BACKOFF_MAX_SECS))
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Core identity
    pub job_type: String,

    // Payload
    #[builder(default, setter(strip_option))]
    pub args: Option<serde_json::Value>,

    // Routing / throttling scope: which upstream source this job talks to
    #[builder(default, setter(strip_option))]
    pub source_name: Option<String>,

    // Idempotency
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,

    // Policies
    #[builder(default)]
    pub priority: JobPriority,

    // Execution settings
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = 300_000)] // 5 minutes
    pub timeout_ms: i64,
    #[builder(default = 60_000)] // 1 minute
    pub lease_duration_ms: i64,

    // Scheduling
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,

    // Lease management
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    /// Monotonic fence token, incremented on every claim. A transactional
    /// write must verify its fence is still current before commit.
    #[builder(default = 0)]
    pub fence: i64,

    // State
    #[builder(default)]
    pub status: JobStatus,

    // Error tracking
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,

    // Dead letter workflow
    #[builder(default, setter(strip_option))]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub dead_letter_reason: Option<String>,
    #[builder(default = 0)]
    pub replay_count: i32,
    #[builder(default, setter(strip_option))]
    pub resolved_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub resolution_note: Option<String>,

    // Retry chain tracing
    #[builder(default, setter(strip_option))]
    pub root_job_id: Option<Uuid>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"
    id, job_type, status, priority, args, source_name, idempotency_key,
    max_retries, attempt, next_run_at, last_run_at, timeout_ms,
    lease_duration_ms, lease_expires_at, worker_id, fence, error_message,
    error_kind, dead_lettered_at, dead_letter_reason, replay_count,
    resolved_at, resolution_note, root_job_id, created_at, updated_at
"#;

impl Job {
    /// Create a job for a serialized command.
    pub fn for_command(
        job_type: &str,
        args: serde_json::Value,
        idempotency_key: Option<String>,
        source_name: Option<String>,
        priority: JobPriority,
        max_retries: i32,
        run_at: Option<DateTime<Utc>>,
        lease_duration_ms: i64,
    ) -> Self {
        Self::builder()
            .job_type(job_type.to_string())
            .args(args)
            .priority(priority)
            .max_retries(max_retries)
            .lease_duration_ms(lease_duration_ms)
            .build()
            .with_optionals(idempotency_key, source_name, run_at)
    }

    fn with_optionals(
        mut self,
        idempotency_key: Option<String>,
        source_name: Option<String>,
        run_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.idempotency_key = idempotency_key;
        self.source_name = source_name;
        self.next_run_at = run_at;
        self
    }

    /// Check if the job is ready to run
    pub fn is_ready(&self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        match self.next_run_at {
            None => true,
            Some(next_run) => next_run <= Utc::now(),
        }
    }

    /// Create the next attempt of this job, scheduled for `scheduled_for`.
    /// The chain is threaded through `root_job_id` so a dead letter carries
    /// its full attempt history.
    pub fn create_retry(&self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: db_id(),
            job_type: self.job_type.clone(),
            args: self.args.clone(),
            source_name: self.source_name.clone(),
            idempotency_key: self.idempotency_key.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            attempt: self.attempt + 1,
            timeout_ms: self.timeout_ms,
            lease_duration_ms: self.lease_duration_ms,
            next_run_at: Some(scheduled_for),
            last_run_at: None,
            lease_expires_at: None,
            worker_id: None,
            fence: 0,
            status: JobStatus::Pending,
            error_message: None,
            error_kind: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
            replay_count: 0,
            resolved_at: None,
            resolution_note: None,
            root_job_id: self.root_job_id.or(Some(self.id)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs (
                id, job_type, status, priority, args, source_name, idempotency_key,
                max_retries, attempt, next_run_at, last_run_at, timeout_ms,
                lease_duration_ms, lease_expires_at, worker_id, fence, error_message,
                error_kind, dead_lettered_at, dead_letter_reason, replay_count,
                resolved_at, resolution_note, root_job_id, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17,
                $18, $19, $20, $21,
                $22, $23, $24, $25, $26
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(self.id)
        .bind(&self.job_type)
        .bind(self.status)
        .bind(self.priority)
        .bind(&self.args)
        .bind(&self.source_name)
        .bind(&self.idempotency_key)
        .bind(self.max_retries)
        .bind(self.attempt)
        .bind(self.next_run_at)
        .bind(self.last_run_at)
        .bind(self.timeout_ms)
        .bind(self.lease_duration_ms)
        .bind(self.lease_expires_at)
        .bind(&self.worker_id)
        .bind(self.fence)
        .bind(&self.error_message)
        .bind(self.error_kind)
        .bind(self.dead_lettered_at)
        .bind(&self.dead_letter_reason)
        .bind(self.replay_count)
        .bind(self.resolved_at)
        .bind(&self.resolution_note)
        .bind(self.root_job_id)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await?;
        Ok(job)
    }

    /// Claim jobs atomically using FOR UPDATE SKIP LOCKED.
    ///
    /// Also recovers stale jobs with expired leases; every claim bumps the
    /// fence token so the previous holder can no longer commit.
    pub async fn claim_jobs(
        limit: i64,
        worker_id: &str,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE
                    (status = 'pending' AND (next_run_at IS NULL OR next_run_at <= NOW()))
                    OR (status = 'running' AND lease_expires_at < NOW())
                ORDER BY priority, COALESCE(next_run_at, created_at)
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                status = 'running',
                last_run_at = NOW(),
                lease_expires_at = NOW() + (lease_duration_ms || ' milliseconds')::INTERVAL,
                worker_id = $2,
                fence = jobs.fence + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(worker_id)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Extend the lease for a running job (heartbeat). The fence guard means
    /// a stale holder's heartbeat cannot resurrect its lease.
    pub async fn extend_lease(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + (lease_duration_ms || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND fence = $2
            "#,
        )
        .bind(self.id)
        .bind(self.fence)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Find the next scheduled run time for any pending job (for poll-sleep
    /// optimization).
    pub async fn find_next_run_time(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
        let result = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT next_run_at
            FROM jobs
            WHERE status = 'pending' AND next_run_at IS NOT NULL
            ORDER BY next_run_at ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await?;
        Ok(result)
    }

    /// All attempts in this job's retry chain, oldest first.
    pub async fn find_attempt_history(&self, pool: &PgPool) -> Result<Vec<Self>> {
        let root = self.root_job_id.unwrap_or(self.id);
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE id = $1 OR root_job_id = $1
            ORDER BY attempt ASC
            "#
        ))
        .bind(root)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Queue depth per job type (pending + running), for the metrics surface.
    pub async fn queue_depths(pool: &PgPool) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT job_type, COUNT(*)::bigint
            FROM jobs
            WHERE status IN ('pending', 'running')
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Unresolved dead letters, newest first, for manual inspection.
    pub async fn find_dead_letters(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = 'dead_letter' AND resolved_at IS NULL
            ORDER BY dead_lettered_at DESC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    pub async fn count_dead_letters(pool: &PgPool) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM jobs WHERE status = 'dead_letter' AND resolved_at IS NULL",
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}
