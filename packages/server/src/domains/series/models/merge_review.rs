use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::common::utils::db_id;

/// A candidate merge between two series that both carried review flags when
/// high confidence was reached. These are never resolved automatically; an
/// operator works the queue.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MergeReview {
    pub id: Uuid,
    pub series_a_id: Uuid,
    pub series_b_id: Uuid,
    pub confidence: f32,
    pub reason: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MergeReview {
    /// Queue a pair for review. The pair is stored in id order and is unique,
    /// so re-observing the same pair is a no-op.
    pub async fn enqueue<'e>(
        a: Uuid,
        b: Uuid,
        confidence: f32,
        reason: &str,
        executor: impl PgExecutor<'e>,
    ) -> Result<Option<Self>> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let review = sqlx::query_as::<_, MergeReview>(
            r#"
            INSERT INTO merge_reviews (id, series_a_id, series_b_id, confidence, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (series_a_id, series_b_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(lo)
        .bind(hi)
        .bind(confidence)
        .bind(reason)
        .fetch_optional(executor)
        .await?;
        Ok(review)
    }

    pub async fn find_open(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let reviews = sqlx::query_as::<_, MergeReview>(
            r#"
            SELECT * FROM merge_reviews
            WHERE resolved_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(reviews)
    }

    pub async fn resolve<'e>(
        id: Uuid,
        resolution: &str,
        executor: impl PgExecutor<'e>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE merge_reviews
            SET resolved_at = NOW(), resolution = $2
            WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(resolution)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
