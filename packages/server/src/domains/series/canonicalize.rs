//! Canonicalization engine: series identity resolution and merges.
//!
//! Decides whether a newly observed source entity is an already-known work,
//! a new one, or a case for human review — and performs merges between
//! canonical series deterministically. Runs under an advisory lock and a
//! single transaction; re-running on an already-linked entity is a no-op.

use anyhow::Result;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::utils::normalize_source_url;
use crate::common::SyncTier;
use crate::domains::chapters::models::LogicalChapter;
use crate::domains::series::matching::{
    self, CanonicalCandidate, MatchDecision, SourceEntity, AUTO_LINK_CONFIDENCE,
};
use crate::domains::series::models::{MergeReview, NewSeries, Series, SeriesSource};
use crate::kernel::locks::{try_advisory_xact_lock, LockKey};

/// How many canonical rows the fuzzy pass scans per decision.
const FUZZY_CANDIDATE_LIMIT: i64 = 5_000;

#[derive(Debug, Error)]
pub enum CanonicalizeError {
    #[error("source url {url} is already claimed by series source {existing}")]
    UrlAlreadyClaimed { url: String, existing: Uuid },

    #[error("target is locked by another worker")]
    LockUnavailable,
}

/// How an entity was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The upstream entity was already linked; nothing changed.
    AlreadyLinked,
    /// Linked to an existing canonical series.
    Linked { confidence: f32 },
    /// A new series was created, flagged for review because of a near-miss.
    CreatedFlagged { near_series_id: Uuid, confidence: f32 },
    /// A new unrelated series was created.
    Created,
}

#[derive(Debug, Clone)]
pub struct CanonicalizationOutcome {
    pub series: Series,
    pub source: SeriesSource,
    pub resolution: Resolution,
}

fn candidate_view(series: &Series) -> CanonicalCandidate {
    CanonicalCandidate {
        id: series.id,
        title: series.title.clone(),
        alternative_titles: series.alternative_titles.clone(),
        creators: series.creators.clone(),
        language: series.language.clone(),
        start_year: series.start_year,
        needs_review: series.needs_review,
    }
}

/// Resolve one upstream entity to a canonical series and link it.
///
/// Signal order: exact external-id match short-circuits everything (and
/// makes retries no-ops); then the matcher scores the entity against exact
/// normalized-title hits and the bounded fuzzy candidate set. All writes —
/// series creation and the source link — happen in one transaction under an
/// advisory lock on the upstream identity.
pub async fn canonicalize_source_entity(
    source_name: &str,
    source_id: &str,
    source_url: &str,
    entity: SourceEntity,
    tier: SyncTier,
    pool: &PgPool,
) -> Result<CanonicalizationOutcome> {
    // Exact external id: this upstream entity is already linked.
    if let Some(existing) = SeriesSource::find_by_upstream(source_name, source_id, pool).await? {
        let series = Series::resolve_canonical(existing.series_id, pool).await?;
        return Ok(CanonicalizationOutcome {
            series,
            source: existing,
            resolution: Resolution::AlreadyLinked,
        });
    }

    // One upstream page belongs to one link. A different upstream id
    // claiming an already-linked URL is upstream churn a human has to look
    // at, not something to guess about.
    let normalized_url = normalize_source_url(source_url);
    if let Some(holder) = SeriesSource::find_by_url(&normalized_url, pool).await? {
        if holder.source_name != source_name || holder.source_id != source_id {
            warn!(
                url = %normalized_url,
                holder = %holder.id,
                source_name,
                source_id,
                "source url already claimed by a different upstream entity"
            );
            Series::set_needs_review(holder.series_id, true, pool).await?;
            return Err(CanonicalizeError::UrlAlreadyClaimed {
                url: normalized_url,
                existing: holder.id,
            }
            .into());
        }
    }

    // Match against the canonical set before taking the lock; the decision
    // is re-validated by the upstream-identity re-check inside it.
    let mut candidates = Vec::new();
    for series in Series::find_by_any_title(&matching::normalize_title(&entity.title), pool).await?
    {
        candidates.push(candidate_view(&series));
    }
    for series in Series::find_canonical_candidates(FUZZY_CANDIDATE_LIMIT, pool).await? {
        if !candidates.iter().any(|c| c.id == series.id) {
            candidates.push(candidate_view(&series));
        }
    }
    let decision = matching::evaluate(&entity, &candidates);

    let mut tx = pool.begin().await?;
    if !try_advisory_xact_lock(&mut tx, LockKey::source_entity(source_name, source_id)).await? {
        return Err(CanonicalizeError::LockUnavailable.into());
    }

    // Another worker may have linked this entity between our check and the
    // lock; their decision wins.
    if let Some(existing) = SeriesSource::find_by_upstream(source_name, source_id, pool).await? {
        tx.rollback().await?;
        let series = Series::resolve_canonical(existing.series_id, pool).await?;
        return Ok(CanonicalizationOutcome {
            series,
            source: existing,
            resolution: Resolution::AlreadyLinked,
        });
    }

    let (series, resolution) = match decision {
        MatchDecision::Link {
            series_id,
            confidence,
        } => {
            let series = Series::find_by_id(series_id, pool).await?;
            let mut titles = vec![entity.title.clone()];
            titles.extend(entity.alternative_titles.iter().cloned());
            Series::add_alternative_titles(series.id, &titles, &mut *tx).await?;
            info!(
                series_id = %series.id,
                source_name,
                source_id,
                confidence,
                "linked source entity to existing series"
            );
            (series, Resolution::Linked { confidence })
        }
        MatchDecision::CreateFlagged {
            near_series_id,
            confidence,
        } => {
            let series = Series::insert(
                NewSeries {
                    title: entity.title.clone(),
                    alternative_titles: entity.alternative_titles.clone(),
                    creators: entity.creators.clone(),
                    language: entity.language.clone(),
                    start_year: entity.start_year,
                    needs_review: true,
                    ..Default::default()
                },
                &mut *tx,
            )
            .await?;
            info!(
                series_id = %series.id,
                near_series_id = %near_series_id,
                confidence,
                "created series flagged for review"
            );
            (
                series,
                Resolution::CreatedFlagged {
                    near_series_id,
                    confidence,
                },
            )
        }
        MatchDecision::Create => {
            let series = Series::insert(
                NewSeries {
                    title: entity.title.clone(),
                    alternative_titles: entity.alternative_titles.clone(),
                    creators: entity.creators.clone(),
                    language: entity.language.clone(),
                    start_year: entity.start_year,
                    needs_review: false,
                    ..Default::default()
                },
                &mut *tx,
            )
            .await?;
            info!(series_id = %series.id, source_name, source_id, "created new series");
            (series, Resolution::Created)
        }
    };

    let source = SeriesSource::find_or_create(
        series.id,
        source_name,
        source_id,
        &normalized_url,
        tier,
        &mut *tx,
    )
    .await?;

    tx.commit().await?;

    Ok(CanonicalizationOutcome {
        series,
        source,
        resolution,
    })
}

/// Deterministic merge winner: higher metadata-source rank first, then
/// higher follower count, then the older row, then the smaller id as a
/// final total-order guarantee.
pub fn decide_merge<'a>(a: &'a Series, b: &'a Series) -> (&'a Series, &'a Series) {
    let a_key = (
        -(a.metadata_rank as i32),
        -(a.follower_count as i128),
        a.created_at,
        a.id,
    );
    let b_key = (
        -(b.metadata_rank as i32),
        -(b.follower_count as i128),
        b.created_at,
        b.id,
    );
    if a_key <= b_key {
        (a, b)
    } else {
        (b, a)
    }
}

/// Merge two canonical series: the loser becomes a one-hop alias of the
/// winner and every dependent row is re-parented in the same transaction
/// that records the decision. Never deletes a series.
pub async fn merge_series(a_id: Uuid, b_id: Uuid, pool: &PgPool) -> Result<Series> {
    // Work on the true canonical rows; merging an alias means merging its
    // canonical target.
    let a = Series::resolve_canonical(a_id, pool).await?;
    let b = Series::resolve_canonical(b_id, pool).await?;
    if a.id == b.id {
        return Ok(a);
    }

    let (primary, secondary) = decide_merge(&a, &b);

    let mut tx = pool.begin().await?;
    if !try_advisory_xact_lock(&mut tx, LockKey::merge_pair(primary.id, secondary.id)).await? {
        return Err(CanonicalizeError::LockUnavailable.into());
    }

    Series::set_canonical(secondary.id, primary.id, &mut *tx).await?;
    Series::repoint_aliases(secondary.id, primary.id, &mut *tx).await?;

    let moved_sources = SeriesSource::reparent_series(secondary.id, primary.id, &mut tx).await?;
    LogicalChapter::reparent_series(secondary.id, primary.id, &mut tx).await?;

    let mut titles = vec![secondary.title.clone()];
    titles.extend(secondary.alternative_titles.iter().cloned());
    Series::add_alternative_titles(primary.id, &titles, &mut *tx).await?;

    tx.commit().await?;

    info!(
        primary = %primary.id,
        secondary = %secondary.id,
        moved_sources,
        "merged series"
    );

    Series::find_by_id(primary.id, pool).await
}

/// Re-evaluate review-flagged series against the canonical set.
///
/// A flagged series that reaches link confidence against an unflagged
/// canonical row is merged. When *both* sides carry review flags the pair
/// goes to the merge-review queue instead — flag-on-flag resolution is an
/// operator decision, never automatic.
pub async fn reevaluate_flagged(limit: i64, pool: &PgPool) -> Result<u64> {
    let flagged: Vec<Series> = sqlx::query_as(
        r#"
        SELECT * FROM series
        WHERE canonical_series_id IS NULL AND needs_review
        ORDER BY created_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    if flagged.is_empty() {
        return Ok(0);
    }

    let canonical = Series::find_canonical_candidates(FUZZY_CANDIDATE_LIMIT, pool).await?;
    let mut actions = 0u64;

    for series in &flagged {
        let entity = SourceEntity {
            title: series.title.clone(),
            alternative_titles: series.alternative_titles.clone(),
            creators: series.creators.clone(),
            language: series.language.clone(),
            start_year: series.start_year,
        };
        let candidates: Vec<CanonicalCandidate> = canonical
            .iter()
            .filter(|c| c.id != series.id)
            .map(candidate_view)
            .collect();

        if let MatchDecision::Link {
            series_id: other_id,
            confidence,
        } = matching::evaluate(&entity, &candidates)
        {
            debug_assert!(confidence >= AUTO_LINK_CONFIDENCE);
            let other = Series::find_by_id(other_id, pool).await?;

            if other.needs_review {
                if MergeReview::enqueue(
                    series.id,
                    other.id,
                    confidence,
                    "both series flagged for review at link confidence",
                    pool,
                )
                .await?
                .is_some()
                {
                    info!(a = %series.id, b = %other.id, confidence, "queued flagged pair for merge review");
                    actions += 1;
                }
            } else {
                match merge_series(series.id, other.id, pool).await {
                    Ok(_) => actions += 1,
                    Err(e) if e.downcast_ref::<CanonicalizeError>().is_some() => {
                        // Lock contention: another worker is on this pair.
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use crate::common::SeriesStatus;

    fn series(rank: i16, followers: i64, age_days: i64) -> Series {
        Series {
            id: Uuid::new_v4(),
            title: "One Piece".to_string(),
            alternative_titles: vec![],
            creators: vec![],
            status: SeriesStatus::Ongoing,
            language: None,
            start_year: None,
            follower_count: followers,
            metadata_rank: rank,
            metadata_schema_version: 1,
            needs_review: false,
            canonical_series_id: None,
            created_at: Utc::now() - Duration::days(age_days),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn higher_rank_wins() {
        let a = series(2, 10, 1);
        let b = series(1, 1_000_000, 1_000);
        let (primary, _) = decide_merge(&a, &b);
        assert_eq!(primary.id, a.id);
    }

    #[test]
    fn follower_count_breaks_rank_ties() {
        let a = series(1, 10, 1);
        let b = series(1, 500, 1);
        let (primary, _) = decide_merge(&a, &b);
        assert_eq!(primary.id, b.id);
    }

    #[test]
    fn older_row_breaks_follower_ties() {
        let a = series(1, 100, 10);
        let b = series(1, 100, 1_000);
        let (primary, _) = decide_merge(&a, &b);
        assert_eq!(primary.id, b.id);
    }

    #[test]
    fn decide_merge_is_symmetric() {
        let a = series(1, 100, 10);
        let b = series(2, 50, 500);
        let (p1, s1) = decide_merge(&a, &b);
        let (p2, s2) = decide_merge(&b, &a);
        assert_eq!(p1.id, p2.id);
        assert_eq!(s1.id, s2.id);
    }

    #[test]
    fn decide_merge_is_total_even_on_full_ties() {
        let now = Utc::now();
        let mut a = series(1, 100, 0);
        let mut b = series(1, 100, 0);
        a.created_at = now;
        b.created_at = now;

        let (p1, _) = decide_merge(&a, &b);
        let (p2, _) = decide_merge(&b, &a);
        assert_eq!(p1.id, p2.id);
        assert_eq!(p1.id, a.id.min(b.id));
    }
}
