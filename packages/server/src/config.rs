use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Stable worker identity; generated per process when unset.
    pub worker_id: Option<String>,

    // Source client
    pub source_user_agent: String,
    pub source_timeout_secs: u64,

    // Scheduler
    pub scheduler_cron: String,
    pub scheduler_batch_cap: i64,
    pub hot_interval_minutes: i64,
    pub warm_interval_minutes: i64,
    pub cold_interval_minutes: i64,
    /// Halt a scheduler pass past this many per-row failures; unset means
    /// never halt.
    pub scheduler_failure_ceiling: Option<usize>,

    // Ingestion
    pub max_chapters_per_sync: usize,

    // Worker pool
    pub max_concurrent_jobs: usize,
    pub max_concurrent_per_type: usize,
    pub max_concurrent_per_source: usize,
    pub shutdown_drain_secs: u64,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: i64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got {:?}", key, value)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env_parse("PORT", 8080)?,
            worker_id: env::var("WORKER_ID").ok(),

            source_user_agent: env::var("SOURCE_USER_AGENT")
                .unwrap_or_else(|_| "chapter-tracker/0.1".to_string()),
            source_timeout_secs: env_parse("SOURCE_TIMEOUT_SECS", 30)?,

            scheduler_cron: env::var("SCHEDULER_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            scheduler_batch_cap: env_parse("SCHEDULER_BATCH_CAP", 500)?,
            hot_interval_minutes: env_parse("HOT_INTERVAL_MINUTES", 30)?,
            warm_interval_minutes: env_parse("WARM_INTERVAL_MINUTES", 360)?,
            cold_interval_minutes: env_parse("COLD_INTERVAL_MINUTES", 2880)?,
            scheduler_failure_ceiling: env::var("SCHEDULER_FAILURE_CEILING")
                .ok()
                .map(|v| {
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("SCHEDULER_FAILURE_CEILING must be a number"))
                })
                .transpose()?,

            max_chapters_per_sync: env_parse("MAX_CHAPTERS_PER_SYNC", 500)?,

            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 16)?,
            max_concurrent_per_type: env_parse("MAX_CONCURRENT_PER_TYPE", 8)?,
            max_concurrent_per_source: env_parse("MAX_CONCURRENT_PER_SOURCE", 2)?,
            shutdown_drain_secs: env_parse("SHUTDOWN_DRAIN_SECS", 30)?,

            breaker_failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_cooldown_secs: env_parse("BREAKER_COOLDOWN_SECS", 300)?,
        })
    }
}
