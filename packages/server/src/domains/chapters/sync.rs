//! Chapter ingestion: converge stored chapter state for one series source
//! with the upstream truth, transactionally.
//!
//! Pipeline per sync:
//! 1. fetch the raw chapter list through the source seam
//! 2. normalize chapter numbers into sortable keys (bad items are skipped
//!    and logged, never fatal)
//! 3. sort and record upstream disorder
//! 4. diff against stored state (pure, see [`plan_sync`])
//! 5. apply in transactional chunks under the advisory lock, fence-checked
//! 6. tombstone vanished chapters — unless the shrink looks like an
//!    upstream error, in which case nothing is deleted and a warning is
//!    raised
//! 7. update source health and trust

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::SyncType;
use crate::domains::chapters::chapter_number::{parse_chapter_number, ChapterKey};
use crate::domains::chapters::models::{ChapterSource, LogicalChapter, StoredSourceChapter};
use crate::domains::series::models::SeriesSource;
use crate::kernel::jobs::JobContext;
use crate::kernel::locks::{try_advisory_xact_lock, LockKey};
use crate::kernel::source_client::RawChapter;
use crate::kernel::ServerDeps;

/// A source reporting more than this fraction of its chapters gone is
/// assumed broken, not pruned.
const SUSPECT_MISSING_FRACTION: f64 = 0.5;

/// Typed sync failures the runner needs to recognize. Everything else
/// (database errors, [`SourceError`]) travels through anyhow with its
/// original type intact for downcasting.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another worker holds the advisory lock for this series source.
    #[error("series source is locked by another worker")]
    LockUnavailable,

    /// The job's lease fence is no longer current; a successor took over.
    #[error("lease fence expired before commit")]
    FenceExpired,
}

/// One upstream chapter after normalization.
#[derive(Debug, Clone)]
pub struct IncomingChapter {
    pub key: ChapterKey,
    pub raw_number: String,
    pub title: Option<String>,
    pub volume: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
    pub url: String,
}

/// The diff between upstream truth and stored state for one source.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// New or changed chapters, in key order.
    pub to_write: Vec<IncomingChapter>,
    pub added: usize,
    pub changed: usize,
    /// Chapter ids stored for this source but absent upstream.
    pub missing: Vec<Uuid>,
    pub missing_fraction: f64,
    /// Upstream list was not already in normalized order.
    pub out_of_order: bool,
    /// More than half the stored chapters vanished at once; treat as an
    /// upstream error and delete nothing.
    pub suspected_source_error: bool,
    /// Items dropped during normalization (duplicate keys).
    pub skipped: usize,
}

/// What one sync run did, for logging and the source-health update.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub written: usize,
    pub tombstoned_sources: u64,
    pub tombstoned_chapters: u64,
    pub chunks: usize,
    pub suspected_source_error: bool,
    pub out_of_order: bool,
}

/// Normalize a raw upstream list. Items whose numbers fall back to a hashed
/// key are kept (deterministic), duplicate keys after the first are dropped
/// and counted.
pub fn normalize_chapters(raw: Vec<RawChapter>) -> (Vec<IncomingChapter>, usize) {
    let mut seen: HashSet<ChapterKey> = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;

    for chapter in raw {
        let parsed = parse_chapter_number(&chapter.number);
        if parsed.fallback {
            debug!(number = %chapter.number, "chapter number did not parse, using fallback key");
        }
        if !seen.insert(parsed.key) {
            warn!(number = %chapter.number, "duplicate chapter key in upstream list, skipping");
            skipped += 1;
            continue;
        }
        out.push(IncomingChapter {
            key: parsed.key,
            raw_number: chapter.number,
            title: chapter.title,
            volume: chapter.volume,
            published_at: chapter.published_at,
            url: chapter.url,
        });
    }
    (out, skipped)
}

/// Pure diff of normalized upstream chapters against stored state.
pub fn plan_sync(stored: &[StoredSourceChapter], incoming: Vec<IncomingChapter>) -> SyncPlan {
    let mut plan = SyncPlan::default();

    // Validate ordering: sort before diffing, remember that we had to.
    let mut sorted = incoming;
    plan.out_of_order = sorted.windows(2).any(|w| w[0].key > w[1].key);
    if plan.out_of_order {
        sorted.sort_by_key(|c| c.key);
    }

    let stored_by_key: HashMap<ChapterKey, &StoredSourceChapter> =
        stored.iter().map(|s| (s.key(), s)).collect();
    let incoming_keys: HashSet<ChapterKey> = sorted.iter().map(|c| c.key).collect();

    for chapter in sorted {
        match stored_by_key.get(&chapter.key) {
            None => {
                plan.added += 1;
                plan.to_write.push(chapter);
            }
            Some(existing) => {
                let title_changed = chapter.title.is_some()
                    && chapter.title.as_deref() != existing.chapter_title.as_deref();
                let url_changed = chapter.url != existing.source_chapter_url;
                let availability_changed = !existing.is_available;
                if title_changed || url_changed || availability_changed {
                    plan.changed += 1;
                    plan.to_write.push(chapter);
                }
            }
        }
    }

    plan.missing = stored
        .iter()
        .filter(|s| !incoming_keys.contains(&s.key()))
        .map(|s| s.chapter_id)
        .collect();

    if !stored.is_empty() {
        plan.missing_fraction = plan.missing.len() as f64 / stored.len() as f64;
        plan.suspected_source_error = plan.missing_fraction > SUSPECT_MISSING_FRACTION;
    }

    plan
}

/// Run one sync for a series source.
///
/// Writes happen in chunks of `deps.sync.max_chapters_per_sync`, each inside
/// its own transaction holding the advisory lock and re-checking the fence
/// token; a crash loses at most one uncommitted chunk. Tombstoning runs in a
/// final transaction and is withheld entirely when the shrink is suspect.
pub async fn sync_series_source(
    series_source_id: Uuid,
    sync_type: SyncType,
    ctx: JobContext,
    deps: &ServerDeps,
) -> Result<SyncReport> {
    let pool = &deps.db_pool;
    let source = SeriesSource::find_by_id(series_source_id, pool).await?;

    let raw = match deps
        .source_client
        .fetch_chapters(&source.source_name, &source.source_id, &source.source_url)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            SeriesSource::record_sync_failure(source.id, pool).await?;
            return Err(e.into());
        }
    };

    let (incoming, skipped) = normalize_chapters(raw);
    let stored = ChapterSource::find_stored_for_source(source.id, pool).await?;
    let mut plan = plan_sync(&stored, incoming);
    plan.skipped += skipped;

    if plan.out_of_order {
        // Recorded, not failed: upstream ordering is advisory.
        debug!(
            series_source_id = %source.id,
            source_name = %source.source_name,
            "upstream chapter list was out of order"
        );
    }

    let mut report = SyncReport {
        suspected_source_error: plan.suspected_source_error,
        out_of_order: plan.out_of_order,
        ..Default::default()
    };

    // Apply writes in independently committed chunks.
    for chunk in plan.to_write.chunks(deps.sync.max_chapters_per_sync.max(1)) {
        let mut tx = pool.begin().await?;
        if !try_advisory_xact_lock(&mut tx, LockKey::series_source(source.id)).await? {
            return Err(SyncError::LockUnavailable.into());
        }
        if !verify_fence(&ctx, &mut tx).await? {
            return Err(SyncError::FenceExpired.into());
        }

        for chapter in chunk {
            let logical = LogicalChapter::upsert(
                source.series_id,
                chapter.key,
                &chapter.raw_number,
                chapter.title.as_deref(),
                chapter.volume,
                chapter.published_at,
                &mut *tx,
            )
            .await?;
            ChapterSource::upsert(
                logical.id,
                source.id,
                &chapter.url,
                chapter.published_at,
                &mut *tx,
            )
            .await?;
        }

        tx.commit().await?;
        report.written += chunk.len();
        report.chunks += 1;
    }

    // Tombstone what vanished, unless the shrink is suspect.
    if plan.suspected_source_error {
        warn!(
            series_source_id = %source.id,
            source_name = %source.source_name,
            missing = plan.missing.len(),
            stored = stored.len(),
            fraction = plan.missing_fraction,
            "suspected source error: most chapters vanished at once, keeping prior state"
        );
    } else if !plan.missing.is_empty() {
        let mut tx = pool.begin().await?;
        if !try_advisory_xact_lock(&mut tx, LockKey::series_source(source.id)).await? {
            return Err(SyncError::LockUnavailable.into());
        }
        if !verify_fence(&ctx, &mut tx).await? {
            return Err(SyncError::FenceExpired.into());
        }

        report.tombstoned_sources =
            ChapterSource::tombstone_for_chapters(source.id, &plan.missing, &mut *tx).await?;
        // The logical chapter only goes when no other source still serves it.
        report.tombstoned_chapters =
            LogicalChapter::tombstone_orphaned(&plan.missing, &mut *tx).await?;

        tx.commit().await?;
        report.chunks += 1;
    }

    SeriesSource::record_sync_success(source.id, pool).await?;

    info!(
        series_source_id = %source.id,
        source_name = %source.source_name,
        sync_type = %sync_type,
        added = plan.added,
        changed = plan.changed,
        written = report.written,
        tombstoned = report.tombstoned_sources,
        skipped = plan.skipped,
        chunks = report.chunks,
        "sync complete"
    );

    Ok(report)
}

/// Fence re-check inside a write transaction. A detached context (nil job)
/// has no lease to lose.
async fn verify_fence(
    ctx: &JobContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<bool> {
    if ctx.job_id.is_nil() {
        return Ok(true);
    }
    let current: Option<i64> = sqlx::query_scalar("SELECT fence FROM jobs WHERE id = $1")
        .bind(ctx.job_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(current == Some(ctx.fence))
}
