use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::common::utils::db_id;
use crate::domains::chapters::chapter_number::ChapterKey;

/// Canonical chapter identity, shared by every source that mirrors it.
/// One row per (series, chapter key); never hard-deleted while sources might
/// still reference it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogicalChapter {
    pub id: Uuid,
    pub series_id: Uuid,
    pub number_band: i16,
    pub number_main: i64,
    pub number_sub: i32,
    pub chapter_number_raw: String,
    pub chapter_title: Option<String>,
    pub volume_number: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LogicalChapter {
    pub fn key(&self) -> ChapterKey {
        ChapterKey {
            band: self.number_band,
            main: self.number_main,
            sub: self.number_sub,
        }
    }

    /// Upsert on the `(series_id, chapter key)` identity.
    ///
    /// Concurrent writers syncing different sources of the same series
    /// converge on one row here; the unique constraint is what settles the
    /// race. A tombstoned chapter that reappears upstream is revived.
    pub async fn upsert<'e>(
        series_id: Uuid,
        key: ChapterKey,
        raw_number: &str,
        title: Option<&str>,
        volume: Option<i32>,
        published_at: Option<DateTime<Utc>>,
        executor: impl PgExecutor<'e>,
    ) -> Result<Self> {
        let chapter = sqlx::query_as::<_, LogicalChapter>(
            r#"
            INSERT INTO logical_chapters (
                id, series_id, number_band, number_main, number_sub,
                chapter_number_raw, chapter_title, volume_number, published_at,
                first_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (series_id, number_band, number_main, number_sub) DO UPDATE SET
                chapter_title = COALESCE(EXCLUDED.chapter_title, logical_chapters.chapter_title),
                volume_number = COALESCE(EXCLUDED.volume_number, logical_chapters.volume_number),
                published_at = COALESCE(logical_chapters.published_at, EXCLUDED.published_at),
                deleted_at = NULL
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(series_id)
        .bind(key.band)
        .bind(key.main)
        .bind(key.sub)
        .bind(raw_number)
        .bind(title)
        .bind(volume)
        .bind(published_at)
        .fetch_one(executor)
        .await?;
        Ok(chapter)
    }

    pub async fn find_active_by_series(series_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let chapters = sqlx::query_as::<_, LogicalChapter>(
            r#"
            SELECT * FROM logical_chapters
            WHERE series_id = $1 AND deleted_at IS NULL
            ORDER BY number_band, number_main, number_sub
            "#,
        )
        .bind(series_id)
        .fetch_all(pool)
        .await?;
        Ok(chapters)
    }

    /// Tombstone every chapter in `ids` that no source still serves.
    /// Returns how many rows were tombstoned.
    pub async fn tombstone_orphaned<'e>(
        ids: &[Uuid],
        executor: impl PgExecutor<'e>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE logical_chapters l
            SET deleted_at = NOW()
            WHERE l.id = ANY($1)
              AND l.deleted_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM chapter_sources cs
                  WHERE cs.chapter_id = l.id
                    AND cs.deleted_at IS NULL
                    AND cs.is_available
              )
            "#,
        )
        .bind(ids)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-parent the chapters of `from_series` onto `to_series` during a
    /// merge. Chapters whose key already exists on the target have their
    /// availability rows repointed at the target chapter and are tombstoned
    /// in place (the uniqueness backstop admits one live row per key);
    /// everything else moves across.
    pub async fn reparent_series(
        from_series: Uuid,
        to_series: Uuid,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<()> {
        // Repoint availability rows of colliding chapters at the target's row.
        sqlx::query(
            r#"
            UPDATE chapter_sources cs
            SET chapter_id = w.id
            FROM logical_chapters l
            JOIN logical_chapters w
              ON w.series_id = $2
             AND w.number_band = l.number_band
             AND w.number_main = l.number_main
             AND w.number_sub = l.number_sub
            WHERE cs.chapter_id = l.id
              AND l.series_id = $1
            "#,
        )
        .bind(from_series)
        .bind(to_series)
        .execute(&mut **tx)
        .await?;

        // Tombstone the duplicates left behind.
        sqlx::query(
            r#"
            UPDATE logical_chapters l
            SET deleted_at = NOW()
            WHERE l.series_id = $1
              AND l.deleted_at IS NULL
              AND EXISTS (
                  SELECT 1 FROM logical_chapters w
                  WHERE w.series_id = $2
                    AND w.number_band = l.number_band
                    AND w.number_main = l.number_main
                    AND w.number_sub = l.number_sub
              )
            "#,
        )
        .bind(from_series)
        .bind(to_series)
        .execute(&mut **tx)
        .await?;

        // Move everything that does not collide.
        sqlx::query(
            r#"
            UPDATE logical_chapters l
            SET series_id = $2
            WHERE l.series_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM logical_chapters w
                  WHERE w.series_id = $2
                    AND w.number_band = l.number_band
                    AND w.number_main = l.number_main
                    AND w.number_sub = l.number_sub
              )
            "#,
        )
        .bind(from_series)
        .bind(to_series)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
