//! Series domain: canonical works, source links, identity matching, and the
//! canonicalization engine.

pub mod canonicalize;
pub mod matching;
pub mod models;
