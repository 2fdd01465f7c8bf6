//! Chapter domain: normalization, canonical chapter/availability models,
//! and the ingestion processor.

pub mod chapter_number;
pub mod jobs;
pub mod models;
pub mod sync;
