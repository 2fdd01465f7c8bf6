// Chapter Release Aggregator - core
//
// Continuously aggregates chapter-release information for serialized
// publications from independent upstream sources, merges per-source records
// into a canonical timeline per work, and resolves works imported from
// different sources into one canonical entity.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
