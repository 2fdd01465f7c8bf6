use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::common::utils::db_id;
use crate::domains::chapters::chapter_number::ChapterKey;

/// One availability fact: a chapter mirrored on one source. Multiple rows
/// per logical chapter are expected.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChapterSource {
    pub id: Uuid,
    pub chapter_id: Uuid,
    pub series_source_id: Uuid,
    pub source_chapter_url: String,
    pub is_available: bool,
    pub detected_at: DateTime<Utc>,
    pub source_published_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A stored chapter as seen from one source, joined with its sortable key.
/// This is the diffing input: what the store currently believes the source
/// serves.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSourceChapter {
    pub chapter_id: Uuid,
    pub number_band: i16,
    pub number_main: i64,
    pub number_sub: i32,
    pub chapter_title: Option<String>,
    pub source_chapter_url: String,
    pub is_available: bool,
}

impl StoredSourceChapter {
    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            band: self.number_band,
            main: self.number_main,
            sub: self.number_sub,
        }
    }
}

impl ChapterSource {
    /// Upsert on the `(series_source_id, chapter_id)` identity.
    pub async fn upsert<'e>(
        chapter_id: Uuid,
        series_source_id: Uuid,
        source_chapter_url: &str,
        source_published_at: Option<DateTime<Utc>>,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        let row = sqlx::query_as::<_, ChapterSource>(
            r#"
            INSERT INTO chapter_sources (
                id, chapter_id, series_source_id, source_chapter_url,
                is_available, detected_at, source_published_at
            )
            VALUES ($1, $2, $3, $4, TRUE, NOW(), $5)
            ON CONFLICT (series_source_id, chapter_id) DO UPDATE SET
                source_chapter_url = EXCLUDED.source_chapter_url,
                is_available = TRUE,
                source_published_at = COALESCE(EXCLUDED.source_published_at, chapter_sources.source_published_at),
                deleted_at = NULL
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(chapter_id)
        .bind(series_source_id)
        .bind(source_chapter_url)
        .bind(source_published_at)
        .fetch_one(executor)
        .await?;
        Ok(row)
    }

    /// Everything the store believes this source currently serves, joined
    /// with the chapter keys, for diffing against the upstream list.
    pub async fn find_stored_for_source(
        series_source_id: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<StoredSourceChapter>> {
        let rows = sqlx::query_as::<_, StoredSourceChapter>(
            r#"
            SELECT cs.chapter_id, l.number_band, l.number_main, l.number_sub,
                   l.chapter_title, cs.source_chapter_url, cs.is_available
            FROM chapter_sources cs
            JOIN logical_chapters l ON l.id = cs.chapter_id
            WHERE cs.series_source_id = $1
              AND cs.deleted_at IS NULL
            ORDER BY l.number_band, l.number_main, l.number_sub
            "#,
        )
        .bind(series_source_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Tombstone this source's availability rows for the given chapters.
    /// Returns how many rows were touched.
    pub async fn tombstone_for_chapters<'e>(
        series_source_id: Uuid,
        chapter_ids: &[Uuid],
        executor: impl PgExecutor<'e>,
    ) -> Result<u64> {
        if chapter_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE chapter_sources
            SET is_available = FALSE,
                deleted_at = NOW()
            WHERE series_source_id = $1
              AND chapter_id = ANY($2)
              AND deleted_at IS NULL
            "#,
        )
        .bind(series_source_id)
        .bind(chapter_ids)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}
