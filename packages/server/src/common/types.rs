// Status domains shared between the kernel and domain layers.
//
// Each status is a single closed enum, defined once and matched exhaustively
// at every use site. Adding a variant is a compile-time event, not a runtime
// assertion.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Publication status of a canonical series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "series_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Ongoing,
    Completed,
    Hiatus,
    Cancelled,
    #[default]
    Unknown,
}

/// Refresh tier for a series source. Hotter tiers are polled more often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncTier {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl SyncTier {
    pub const ALL: [SyncTier; 3] = [SyncTier::Hot, SyncTier::Warm, SyncTier::Cold];

    /// Default refresh interval for the tier. Overridable via config.
    pub fn default_interval(&self) -> Duration {
        match self {
            SyncTier::Hot => Duration::minutes(30),
            SyncTier::Warm => Duration::hours(6),
            SyncTier::Cold => Duration::hours(48),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTier::Hot => "hot",
            SyncTier::Warm => "warm",
            SyncTier::Cold => "cold",
        }
    }
}

impl fmt::Display for SyncTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enrichment state of a source's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "metadata_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    #[default]
    Pending,
    Enriched,
    Unavailable,
    Failed,
}

/// Kind of chapter sync requested for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Re-diff the complete upstream chapter list.
    Full,
    /// Diff only against the most recent window.
    #[default]
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_intervals_are_ordered() {
        assert!(SyncTier::Hot.default_interval() < SyncTier::Warm.default_interval());
        assert!(SyncTier::Warm.default_interval() < SyncTier::Cold.default_interval());
    }

    #[test]
    fn sync_type_round_trips_through_serde() {
        let json = serde_json::to_string(&SyncType::Full).unwrap();
        assert_eq!(json, "\"full\"");
        let back: SyncType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SyncType::Full);
    }
}
