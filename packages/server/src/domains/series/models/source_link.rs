use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::common::utils::db_id;
use crate::common::{MetadataStatus, SyncTier};

/// Trust score delta applied on a successful sync.
const TRUST_GAIN: f32 = 0.01;
/// Trust score delta applied on a failed sync.
const TRUST_DECAY: f32 = 0.05;

/// Link between a canonical series and one upstream provider's
/// representation of it. `(source_name, source_id)` is unique: the same
/// upstream entity is never linked twice.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SeriesSource {
    pub id: Uuid,
    pub series_id: Uuid,
    pub source_name: String,
    pub source_id: String,
    pub source_url: String,
    pub trust_score: f32,
    pub sync_tier: SyncTier,
    pub metadata_status: MetadataStatus,
    pub metadata_retry_count: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SeriesSource {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let source = sqlx::query_as::<_, SeriesSource>(
            "SELECT * FROM series_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(source)
    }

    pub async fn find_by_upstream(
        source_name: &str,
        source_id: &str,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        let source = sqlx::query_as::<_, SeriesSource>(
            "SELECT * FROM series_sources WHERE source_name = $1 AND source_id = $2",
        )
        .bind(source_name)
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
        Ok(source)
    }

    /// Any link already claiming this upstream page. The ingestion path
    /// checks here before linking so two canonical series never race to own
    /// the same URL.
    pub async fn find_by_url(source_url: &str, pool: &PgPool) -> Result<Option<Self>> {
        let source = sqlx::query_as::<_, SeriesSource>(
            "SELECT * FROM series_sources WHERE source_url = $1 LIMIT 1",
        )
        .bind(source_url)
        .fetch_optional(pool)
        .await?;
        Ok(source)
    }

    /// Atomic find-or-create on the upstream identity. The conflict arm is a
    /// no-op update so the existing row comes back instead of an error.
    pub async fn find_or_create<'e>(
        series_id: Uuid,
        source_name: &str,
        source_id: &str,
        source_url: &str,
        tier: SyncTier,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        let source = sqlx::query_as::<_, SeriesSource>(
            r#"
            INSERT INTO series_sources (
                id, series_id, source_name, source_id, source_url, sync_tier
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_name, source_id) DO UPDATE SET
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(series_id)
        .bind(source_name)
        .bind(source_id)
        .bind(source_url)
        .bind(tier)
        .fetch_one(executor)
        .await?;
        Ok(source)
    }

    /// Sources of `tier` overdue for a refresh, stalest first, capped.
    /// Rows that have never synced count as infinitely stale.
    pub async fn find_due_for_sync(
        tier: SyncTier,
        interval: Duration,
        cap: i64,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        let sources = sqlx::query_as::<_, SeriesSource>(
            r#"
            SELECT * FROM series_sources
            WHERE sync_tier = $1
              AND (last_success_at IS NULL
                   OR last_success_at <= NOW() - ($2 || ' seconds')::INTERVAL)
            ORDER BY last_success_at ASC NULLS FIRST
            LIMIT $3
            "#,
        )
        .bind(tier)
        .bind(interval.num_seconds().to_string())
        .bind(cap)
        .fetch_all(pool)
        .await?;
        Ok(sources)
    }

    /// Record a successful sync: bump the success clock and nudge the trust
    /// score up, clamped to [0.5, 1.0].
    pub async fn record_sync_success<'e>(id: Uuid, executor: impl PgExecutor<'e>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE series_sources
            SET last_success_at = NOW(),
                consecutive_failures = 0,
                trust_score = LEAST(1.0, trust_score + $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(TRUST_GAIN)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Record a failed sync: decay the trust score, clamped to [0.5, 1.0].
    pub async fn record_sync_failure<'e>(id: Uuid, executor: impl PgExecutor<'e>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE series_sources
            SET last_failure_at = NOW(),
                consecutive_failures = consecutive_failures + 1,
                trust_score = GREATEST(0.5, trust_score - $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(TRUST_DECAY)
        .execute(executor)
        .await?;
        Ok(())
    }

    pub async fn set_metadata_status<'e>(
        id: Uuid,
        status: MetadataStatus,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        // Failed enrichment attempts also bump the retry counter.
        sqlx::query(
            r#"
            UPDATE series_sources
            SET metadata_status = $2,
                metadata_retry_count = metadata_retry_count
                    + CASE WHEN $2 = 'failed'::metadata_status THEN 1 ELSE 0 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Move every link of `from_series` to `to_series` (merge re-parenting).
    pub async fn reparent_series(
        from_series: Uuid,
        to_series: Uuid,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE series_sources SET series_id = $2, updated_at = NOW() WHERE series_id = $1",
        )
        .bind(from_series)
        .bind(to_series)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// How many sources per tier are overdue right now, for the metrics
    /// surface.
    pub async fn staleness_count(
        tier: SyncTier,
        interval: Duration,
        pool: &PgPool,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint FROM series_sources
            WHERE sync_tier = $1
              AND (last_success_at IS NULL
                   OR last_success_at <= NOW() - ($2 || ' seconds')::INTERVAL)
            "#,
        )
        .bind(tier)
        .bind(interval.num_seconds().to_string())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}
