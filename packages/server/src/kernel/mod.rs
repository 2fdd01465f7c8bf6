//! Infrastructure layer: job execution, scheduling, locking, upstream
//! clients, and the dependency container handed to domain handlers.

pub mod breaker;
pub mod deps;
pub mod jobs;
pub mod locks;
pub mod scheduler;
pub mod source_client;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use deps::{ServerDeps, SyncSettings};
pub use locks::{try_advisory_xact_lock, InMemoryLocks, LockKey};
pub use source_client::{HttpSourceClient, RawChapter, SourceClient, SourceError, StaticSourceClient};
