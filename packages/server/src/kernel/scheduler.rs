//! Scheduled background passes using tokio-cron-scheduler.
//!
//! The sync scheduler produces a bounded, deduplicated stream of sync
//! candidates: per tier, every series source whose last success is older
//! than the tier interval, stalest first, capped per pass. Targets another
//! worker currently holds are skipped, not queued behind it; duplicates are
//! collapsed by the queue's idempotency keys.
//!
//! ```text
//! Scheduler (cron tick)
//!     │
//!     ├─► find_due_for_sync(tier) per tier, cap shared across tiers
//!     ├─► drop rows whose advisory lock is held right now
//!     └─► enqueue SyncChaptersJob (idempotency key dedups outstanding runs)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::common::{SyncTier, SyncType};
use crate::domains::chapters::jobs::SyncChaptersJob;
use crate::domains::series::canonicalize;
use crate::domains::series::models::SeriesSource;
use crate::kernel::jobs::{JobQueue, JobSpec};
use crate::kernel::locks::{held_advisory_keys, LockKey};
use crate::kernel::ServerDeps;

/// Scheduler pass configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard cap on candidates per pass, shared across tiers.
    pub batch_cap: i64,
    /// Per-tier refresh intervals.
    pub tier_intervals: HashMap<SyncTier, Duration>,
    /// Halt a pass once this many per-row failures accumulate.
    /// `None` means never halt (the default).
    pub failure_ceiling: Option<usize>,
    /// Cron expression for the periodic pass.
    pub cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_cap: 500,
            tier_intervals: SyncTier::ALL
                .iter()
                .map(|t| (*t, t.default_interval()))
                .collect(),
            failure_ceiling: None,
            // Every 5 minutes.
            cron: "0 */5 * * * *".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self, tier: SyncTier) -> Duration {
        self.tier_intervals
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_interval())
    }
}

/// Per-row failure counter for one pass. One bad row never aborts the
/// batch; a pass only halts early past the configured ceiling.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    failures: usize,
    ceiling: Option<usize>,
}

impl ErrorAccumulator {
    pub fn new(ceiling: Option<usize>) -> Self {
        Self {
            failures: 0,
            ceiling,
        }
    }

    pub fn record(&mut self) {
        self.failures += 1;
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn exceeded(&self) -> bool {
        match self.ceiling {
            Some(ceiling) => self.failures > ceiling,
            None => false,
        }
    }
}

/// What one scheduler pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub examined: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub skipped_locked: usize,
    pub failures: usize,
    pub halted: bool,
}

/// Run one scheduling pass over all tiers.
pub async fn run_scheduler_pass(
    config: &SchedulerConfig,
    deps: &ServerDeps,
) -> Result<SchedulerReport> {
    let mut report = SchedulerReport::default();
    let mut errors = ErrorAccumulator::new(config.failure_ceiling);

    'tiers: for tier in SyncTier::ALL {
        let remaining = config.batch_cap - report.examined as i64;
        if remaining <= 0 {
            break;
        }

        let due =
            SeriesSource::find_due_for_sync(tier, config.interval(tier), remaining, &deps.db_pool)
                .await?;
        if due.is_empty() {
            continue;
        }
        report.examined += due.len();

        // Skip rows a worker is already on: queuing behind a held lock just
        // piles jobs up behind the slowest sync.
        let keys: Vec<LockKey> = due.iter().map(|s| LockKey::series_source(s.id)).collect();
        let held = held_advisory_keys(&deps.db_pool, &keys).await?;

        for source in due {
            if held.contains(&LockKey::series_source(source.id).as_i64()) {
                report.skipped_locked += 1;
                continue;
            }

            // A source that has never synced gets a full backfill.
            let sync_type = if source.last_success_at.is_none() {
                SyncType::Full
            } else {
                SyncType::Incremental
            };

            let job = SyncChaptersJob::new(source.id, sync_type, &source.source_name);
            let spec = match JobSpec::for_command(&job) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(series_source_id = %source.id, error = %e, "failed to build sync job");
                    errors.record();
                    if errors.exceeded() {
                        report.halted = true;
                        break 'tiers;
                    }
                    continue;
                }
            };

            match deps.job_queue.enqueue(spec).await {
                Ok(result) if result.is_created() => report.enqueued += 1,
                Ok(_) => report.duplicates += 1,
                Err(e) => {
                    warn!(series_source_id = %source.id, error = %e, "failed to enqueue sync job");
                    errors.record();
                    if errors.exceeded() {
                        report.halted = true;
                        break 'tiers;
                    }
                }
            }
        }
    }

    report.failures = errors.failures();

    info!(
        examined = report.examined,
        enqueued = report.enqueued,
        duplicates = report.duplicates,
        skipped_locked = report.skipped_locked,
        failures = report.failures,
        halted = report.halted,
        "scheduler pass complete"
    );

    Ok(report)
}

/// Start all scheduled tasks: the periodic sync pass and a daily
/// re-evaluation of review-flagged series.
pub async fn start_scheduler(
    config: SchedulerConfig,
    deps: Arc<ServerDeps>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let pass_config = config.clone();
    let pass_deps = deps.clone();
    let sync_job = Job::new_async(config.cron.as_str(), move |_uuid, _lock| {
        let config = pass_config.clone();
        let deps = pass_deps.clone();
        Box::pin(async move {
            if let Err(e) = run_scheduler_pass(&config, &deps).await {
                error!("scheduler pass failed: {}", e);
            }
        })
    })?;
    scheduler.add(sync_job).await?;

    // Flagged-series re-evaluation - runs daily at 03:00.
    let review_deps = deps.clone();
    let review_job = Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
        let deps = review_deps.clone();
        Box::pin(async move {
            match canonicalize::reevaluate_flagged(1_000, &deps.db_pool).await {
                Ok(actions) if actions > 0 => {
                    info!(actions, "flagged-series re-evaluation acted on series");
                }
                Ok(_) => {}
                Err(e) => error!("flagged-series re-evaluation failed: {}", e),
            }
        })
    })?;
    scheduler.add(review_job).await?;

    scheduler.start().await?;
    info!("scheduled tasks started (sync pass, daily flagged re-evaluation)");
    Ok(scheduler)
}
