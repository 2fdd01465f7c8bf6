use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::common::utils::db_id;
use crate::common::SeriesStatus;

/// Canonical work record. A row with `canonical_series_id` set is an alias
/// that was merged into another series; the chain is always one hop.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Series {
    pub id: Uuid,
    pub title: String,
    pub alternative_titles: Vec<String>,
    pub creators: Vec<String>,
    pub status: SeriesStatus,
    pub language: Option<String>,
    pub start_year: Option<i32>,
    pub follower_count: i64,
    pub metadata_rank: i16,
    pub metadata_schema_version: i32,
    pub needs_review: bool,
    pub canonical_series_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a new canonical series from upstream metadata.
#[derive(Debug, Clone, Default)]
pub struct NewSeries {
    pub title: String,
    pub alternative_titles: Vec<String>,
    pub creators: Vec<String>,
    pub status: SeriesStatus,
    pub language: Option<String>,
    pub start_year: Option<i32>,
    pub needs_review: bool,
}

impl Series {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        let series = sqlx::query_as::<_, Series>("SELECT * FROM series WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(series)
    }

    /// Resolve to the true canonical row. The alias chain is one hop by
    /// invariant, so a single extra fetch is always enough.
    pub async fn resolve_canonical(id: Uuid, pool: &PgPool) -> Result<Self> {
        let series = Self::find_by_id(id, pool).await?;
        match series.canonical_series_id {
            Some(canonical_id) => Self::find_by_id(canonical_id, pool).await,
            None => Ok(series),
        }
    }

    pub async fn insert<'e>(new: NewSeries, executor: impl PgExecutor<'e>) -> Result<Self> {
        let series = sqlx::query_as::<_, Series>(
            r#"
            INSERT INTO series (
                id, title, alternative_titles, creators, status, language,
                start_year, needs_review
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(&new.title)
        .bind(&new.alternative_titles)
        .bind(&new.creators)
        .bind(new.status)
        .bind(&new.language)
        .bind(new.start_year)
        .bind(new.needs_review)
        .fetch_one(executor)
        .await?;
        Ok(series)
    }

    /// Fast path for canonicalization: canonical rows whose title or any
    /// alternative title equals the normalized needle exactly.
    pub async fn find_by_any_title(normalized: &str, pool: &PgPool) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Series>(
            r#"
            SELECT * FROM series
            WHERE canonical_series_id IS NULL
              AND (LOWER(title) = $1 OR $1 = ANY(SELECT LOWER(t) FROM unnest(alternative_titles) AS t))
            "#,
        )
        .bind(normalized)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Candidate set for fuzzy matching. Bounded: beyond this the right tool
    /// is a trigram index, not a bigger scan.
    pub async fn find_canonical_candidates(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Series>(
            r#"
            SELECT * FROM series
            WHERE canonical_series_id IS NULL
            ORDER BY follower_count DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Point this row at its merge winner. Never deletes; resolution is
    /// always redirective.
    pub async fn set_canonical<'e>(
        loser_id: Uuid,
        winner_id: Uuid,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE series
            SET canonical_series_id = $2,
                needs_review = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(loser_id)
        .bind(winner_id)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Collapse any one-hop-removed aliases pointing at `loser_id` onto the
    /// new winner, preserving the at-most-one-hop invariant after a merge.
    pub async fn repoint_aliases<'e>(
        loser_id: Uuid,
        winner_id: Uuid,
        executor: impl PgExecutor<'e>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE series
            SET canonical_series_id = $2,
                updated_at = NOW()
            WHERE canonical_series_id = $1
            "#,
        )
        .bind(loser_id)
        .bind(winner_id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_needs_review<'e>(
        id: Uuid,
        needs_review: bool,
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        sqlx::query("UPDATE series SET needs_review = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(needs_review)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// Absorb additional titles discovered on another source into the
    /// alternative-title set.
    pub async fn add_alternative_titles<'e>(
        id: Uuid,
        titles: &[String],
        executor: impl PgExecutor<'e>,
    ) -> Result<()> {
        if titles.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE series
            SET alternative_titles = (
                    SELECT ARRAY(
                        SELECT DISTINCT t
                        FROM unnest(alternative_titles || $2) AS t
                        WHERE t <> title
                    )
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(titles)
        .execute(executor)
        .await?;
        Ok(())
    }
}
