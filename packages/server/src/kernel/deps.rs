//! Server dependencies for job handlers (traits for testability).
//!
//! One explicit, process-scoped context object built at startup and passed to
//! components at construction time. No module-level singletons: lifecycle is
//! init in `main`, drained at shutdown.

use std::sync::Arc;

use sqlx::PgPool;

use crate::kernel::breaker::BreakerRegistry;
use crate::kernel::jobs::JobQueue;
use crate::kernel::source_client::SourceClient;

/// Ingestion knobs that handlers need at run time.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Chapters applied per transactional chunk. A sync larger than this is
    /// split into independently committed chunks.
    pub max_chapters_per_sync: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_chapters_per_sync: 500,
        }
    }
}

/// Dependencies accessible to job handlers.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub source_client: Arc<dyn SourceClient>,
    pub breakers: Arc<BreakerRegistry>,
    /// Handlers enqueue follow-up work (e.g. the first sync after an
    /// import) through the same queue the runner drains.
    pub job_queue: Arc<dyn JobQueue>,
    pub sync: SyncSettings,
}

impl ServerDeps {
    pub fn new(
        db_pool: PgPool,
        source_client: Arc<dyn SourceClient>,
        breakers: Arc<BreakerRegistry>,
        job_queue: Arc<dyn JobQueue>,
        sync: SyncSettings,
    ) -> Self {
        Self {
            db_pool,
            source_client,
            breakers,
            job_queue,
            sync,
        }
    }
}
