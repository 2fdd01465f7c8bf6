mod import_source;
mod sync_chapters;

pub use import_source::ImportSourceJob;
pub use sync_chapters::SyncChaptersJob;

use crate::kernel::jobs::JobRegistry;

/// Register this domain's job handlers.
pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<SyncChaptersJob, _, _>(SyncChaptersJob::JOB_TYPE, sync_chapters::handle);
    registry.register::<ImportSourceJob, _, _>(ImportSourceJob::JOB_TYPE, import_source::handle);
}
