//! ImportSourceJob - background job that links a newly discovered upstream
//! entity to a canonical series (creating one if needed) and kicks off its
//! first full sync.
//!
//! Canonicalization runs here, before any chapter write for the entity ever
//! happens.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{MetadataStatus, SyncTier, SyncType};
use crate::domains::chapters::jobs::SyncChaptersJob;
use crate::domains::series::canonicalize::{self, Resolution};
use crate::domains::series::matching::SourceEntity;
use crate::domains::series::models::SeriesSource;
use crate::kernel::jobs::{CommandMeta, JobContext, JobPriority, JobQueue, JobSpec};
use crate::kernel::ServerDeps;

/// Job to import one upstream entity discovered on a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSourceJob {
    pub source_name: String,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    #[serde(default)]
    pub alternative_titles: Vec<String>,
    #[serde(default)]
    pub creators: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub tier: SyncTier,
}

impl ImportSourceJob {
    /// The job type identifier used in the jobs table.
    pub const JOB_TYPE: &'static str = "import_source";
}

impl CommandMeta for ImportSourceJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn idempotency_key(&self) -> Option<String> {
        Some(format!("import:{}:{}", self.source_name, self.source_id))
    }

    fn source_name(&self) -> Option<String> {
        Some(self.source_name.clone())
    }

    fn priority(&self) -> JobPriority {
        JobPriority::High
    }

    fn max_retries(&self) -> i32 {
        3
    }
}

/// Resolve the entity against the canonical set, then enqueue the first
/// full sync for the resulting link. Retries are no-ops past the decision:
/// an already-linked entity resolves to the same canonical id.
pub async fn handle(job: ImportSourceJob, _ctx: JobContext, deps: Arc<ServerDeps>) -> Result<()> {
    let entity = SourceEntity {
        title: job.title.clone(),
        alternative_titles: job.alternative_titles.clone(),
        creators: job.creators.clone(),
        language: job.language.clone(),
        start_year: job.start_year,
    };

    let outcome = canonicalize::canonicalize_source_entity(
        &job.source_name,
        &job.source_id,
        &job.source_url,
        entity,
        job.tier,
        &deps.db_pool,
    )
    .await?;

    info!(
        series_id = %outcome.series.id,
        series_source_id = %outcome.source.id,
        resolution = ?outcome.resolution,
        "import resolved"
    );

    // The import payload either carried real metadata or it didn't; record
    // which, so enrichment knows where to pick up.
    let metadata_status = if !job.creators.is_empty() || job.start_year.is_some() {
        MetadataStatus::Enriched
    } else {
        MetadataStatus::Pending
    };
    SeriesSource::set_metadata_status(outcome.source.id, metadata_status, &deps.db_pool).await?;

    // A fresh link gets its history backfilled right away; an existing one
    // is already on the scheduler's rotation.
    if outcome.resolution != Resolution::AlreadyLinked {
        let sync = SyncChaptersJob::new(outcome.source.id, SyncType::Full, &job.source_name);
        deps.job_queue.enqueue(JobSpec::for_command(&sync)?).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ImportSourceJob {
        ImportSourceJob {
            source_name: "mangahost".to_string(),
            source_id: "one-piece-123".to_string(),
            source_url: "https://mangahost.example/series/one-piece-123".to_string(),
            title: "One Piece".to_string(),
            alternative_titles: vec![],
            creators: vec!["Eiichiro Oda".to_string()],
            language: Some("ja".to_string()),
            start_year: Some(1997),
            tier: SyncTier::Hot,
        }
    }

    #[test]
    fn idempotency_key_follows_upstream_identity() {
        assert_eq!(
            job().idempotency_key(),
            Some("import:mangahost:one-piece-123".to_string())
        );
    }

    #[test]
    fn imports_run_at_high_priority() {
        assert_eq!(job().priority(), JobPriority::High);
        assert_eq!(job().max_retries(), 3);
    }

    #[test]
    fn payload_tolerates_missing_optional_fields() {
        let json = r#"{
            "source_name": "mangahost",
            "source_id": "x",
            "source_url": "https://mangahost.example/series/x",
            "title": "X"
        }"#;
        let parsed: ImportSourceJob = serde_json::from_str(json).unwrap();
        assert!(parsed.creators.is_empty());
        assert_eq!(parsed.tier, SyncTier::Warm);
    }
}
