//! SyncChaptersJob - background job that converges one series source with
//! its upstream chapter list.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::SyncType;
use crate::domains::chapters::sync;
use crate::kernel::jobs::{CommandMeta, JobContext, JobPriority};
use crate::kernel::ServerDeps;

/// Job to sync the chapter list of one series source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChaptersJob {
    pub series_source_id: Uuid,
    pub sync_type: SyncType,
    /// Upstream source name, for per-source throttling and the breaker.
    pub source_name: String,
}

impl SyncChaptersJob {
    /// The job type identifier used in the jobs table.
    pub const JOB_TYPE: &'static str = "sync_chapters";

    pub fn new(series_source_id: Uuid, sync_type: SyncType, source_name: &str) -> Self {
        Self {
            series_source_id,
            sync_type,
            source_name: source_name.to_string(),
        }
    }
}

impl CommandMeta for SyncChaptersJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    /// One outstanding sync per (type, source link): a second enqueue while
    /// the first is pending or running collapses into it.
    fn idempotency_key(&self) -> Option<String> {
        Some(format!("sync:{}:{}", self.sync_type, self.series_source_id))
    }

    fn source_name(&self) -> Option<String> {
        Some(self.source_name.clone())
    }

    fn priority(&self) -> JobPriority {
        JobPriority::Normal
    }

    /// Upstreams flake; give syncs headroom before dead-lettering.
    fn max_retries(&self) -> i32 {
        5
    }
}

/// Execute the sync. Errors keep their type through anyhow so the runner
/// can classify them (lock contention → skip, network → retry, ...).
pub async fn handle(job: SyncChaptersJob, ctx: JobContext, deps: Arc<ServerDeps>) -> Result<()> {
    sync::sync_series_source(job.series_source_id, job.sync_type, ctx, &deps).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let id = Uuid::new_v4();
        let a = SyncChaptersJob::new(id, SyncType::Incremental, "mangahost");
        let b = SyncChaptersJob::new(id, SyncType::Incremental, "mangahost");
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_eq!(
            a.idempotency_key(),
            Some(format!("sync:incremental:{id}"))
        );
    }

    #[test]
    fn full_and_incremental_syncs_have_distinct_keys() {
        let id = Uuid::new_v4();
        let full = SyncChaptersJob::new(id, SyncType::Full, "mangahost");
        let incremental = SyncChaptersJob::new(id, SyncType::Incremental, "mangahost");
        assert_ne!(full.idempotency_key(), incremental.idempotency_key());
    }

    #[test]
    fn command_meta_routes_by_source() {
        let job = SyncChaptersJob::new(Uuid::new_v4(), SyncType::Full, "mangahost");
        assert_eq!(job.command_type(), "sync_chapters");
        assert_eq!(job.source_name(), Some("mangahost".to_string()));
        assert_eq!(job.max_retries(), 5);
    }

    #[test]
    fn serialization_round_trips() {
        let job = SyncChaptersJob::new(Uuid::new_v4(), SyncType::Full, "mangahost");
        let json = serde_json::to_string(&job).unwrap();
        let back: SyncChaptersJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.series_source_id, job.series_source_id);
        assert_eq!(back.sync_type, job.sync_type);
        assert_eq!(back.source_name, job.source_name);
    }
}
